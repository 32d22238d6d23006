use std::env;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use emmdb::{
    builder, datagen,
    error::{BuildError, Result},
    tables, CancelToken, EncStore, MasterKey, PlainStore, Variant,
};

#[derive(Parser)]
#[command(name = "emmdb", about = "Encrypted index builder for relational data")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one or more build stages against the configured stores.
    Build {
        /// Index layout to build.
        #[arg(value_enum)]
        variant: VariantArg,
        /// Stages, executed in the order given.
        #[arg(value_enum, required = true)]
        modes: Vec<DataMode>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum VariantArg {
    Spx,
    Corr,
    Pkfk,
}

impl From<VariantArg> for Variant {
    fn from(arg: VariantArg) -> Self {
        match arg {
            VariantArg::Spx => Variant::Spx,
            VariantArg::Corr => Variant::Corr,
            VariantArg::Pkfk => Variant::Pkfk,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DataMode {
    /// Generate synthetic plaintext tables into the source store.
    Generate,
    /// Load CSV tables and key declarations from the scratch directory.
    LoadPlain,
    /// Build the encrypted tables and multi-maps.
    BuildEnc,
}

/// Environment-driven configuration, read once at startup.
struct Config {
    plain_db: PathBuf,
    enc_db: PathBuf,
    master_key: PathBuf,
    scratch: PathBuf,
    rows: usize,
}

fn required(var: &str) -> Result<PathBuf> {
    env::var_os(var)
        .map(PathBuf::from)
        .ok_or_else(|| BuildError::MissingEnv {
            var: var.to_string(),
        })
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Config {
            plain_db: required("EMMDB_PLAIN_DB")?,
            enc_db: required("EMMDB_ENC_DB")?,
            master_key: required("EMMDB_MASTER_KEY")?,
            scratch: env::var_os("EMMDB_SCRATCH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./scratch")),
            rows: env::var("EMMDB_ROWS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(256),
        })
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Build { variant, modes } => {
            for mode in modes {
                run_mode(&config, variant.into(), mode)?;
            }
        }
    }
    Ok(())
}

fn run_mode(config: &Config, variant: Variant, mode: DataMode) -> Result<()> {
    match mode {
        DataMode::Generate => {
            let db = datagen::synthetic_database(config.rows, 0x5eed);
            db.validate()?;
            PlainStore::open(&config.plain_db)?.write_database(&db)?;
        }
        DataMode::LoadPlain => {
            let keys = tables::load_key_spec(&config.scratch.join("keys.txt"))?;
            let db = emmdb::Database {
                tables: tables::load_tables(&config.scratch)?,
                keys,
            };
            db.validate()?;
            PlainStore::open(&config.plain_db)?.write_database(&db)?;
        }
        DataMode::BuildEnc => {
            let master = MasterKey::load(&config.master_key)?;
            let plain = PlainStore::open_read_only(&config.plain_db)?;
            let mut enc = EncStore::open(&config.enc_db)?;
            let cancel = CancelToken::new();
            let report = builder::build(variant, &master, &plain, &mut enc, &cancel)?;
            info!(
                variant = ?report.variant,
                tables = report.tables,
                rows = report.rows,
                indices = report.indices,
                "build complete"
            );
        }
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
