use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for the index builder.
///
/// Variants are grouped by the four kinds the build distinguishes:
/// configuration errors and data errors are raised at validation time,
/// before any store write; crypto errors are fatal; store errors abort the
/// current build and leave the partially written state in place for an
/// overwrite re-run.
#[derive(Error, Debug)]
pub enum BuildError {
    // === Configuration ===
    /// A table has no declared primary key.
    #[error("no primary key declared for table '{table}'")]
    MissingPrimaryKey { table: String },

    /// A table declared more than one primary key.
    #[error("ambiguous primary key for table '{table}'")]
    AmbiguousPrimaryKey { table: String },

    /// Compound primary keys are limited to two components.
    #[error("unsupported compound key arity {arity} on table '{table}'")]
    CompoundKeyArity { table: String, arity: usize },

    /// A foreign key references a table that is not part of the build.
    #[error("foreign key references unknown table '{table}'")]
    UnknownTable { table: String },

    /// `~` is the reserved predicate separator.
    #[error("reserved character '~' in identifier '{name}'")]
    ReservedCharacter { name: String },

    /// The master secret file is missing or malformed.
    #[error("master key material at '{}' is invalid: {detail}", path.display())]
    BadKeyMaterial { path: PathBuf, detail: String },

    /// A required environment variable is not set.
    #[error("missing environment variable {var}")]
    MissingEnv { var: String },

    /// The requested build variant does not exist.
    #[error("unknown build variant '{name}'")]
    UnknownVariant { name: String },

    // === Crypto ===
    /// A PRF or cipher was handed a key of the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// AEAD encryption failed.
    #[error("cell encryption failed")]
    CellEncryption,

    // === Store ===
    /// Any error surfaced by the backing relational store.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// File I/O on scratch or key material.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Data ===
    /// A declared key column is absent from the source table.
    #[error("no such column '{column}' in table '{table}'")]
    NoSuchColumn { table: String, column: String },

    /// A cell could not be cast to the type an operation requires.
    #[error("cannot cast cell '{lexeme}' of table '{table}' to {wanted}")]
    TypeCast {
        table: String,
        lexeme: String,
        wanted: &'static str,
    },

    /// Cantor pairing is defined over non-negative components.
    #[error("negative compound key component {value} in table '{table}'")]
    NegativeKeyComponent { table: String, value: i64 },

    /// The paired compound key overflowed an i64.
    #[error("compound key overflow in table '{table}'")]
    CompoundKeyOverflow { table: String },

    /// CSV input could not be parsed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    // === Control ===
    /// The build was cancelled at a barrier point.
    #[error("build cancelled")]
    Cancelled,
}

impl BuildError {
    /// True for errors raised before any side effect on the encrypted store.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BuildError::MissingPrimaryKey { .. }
                | BuildError::AmbiguousPrimaryKey { .. }
                | BuildError::CompoundKeyArity { .. }
                | BuildError::UnknownTable { .. }
                | BuildError::ReservedCharacter { .. }
                | BuildError::NoSuchColumn { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
