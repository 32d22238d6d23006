//! Build orchestration: validates the input, attaches row identifiers,
//! dispatches to the selected scheme, then realizes index requests and
//! statistics refresh.
//!
//! The build is offline and single-shot. Failures after `Init` surface to
//! the caller with partial state left in the encrypted store; a re-run
//! with the same inputs and keys overwrites it deterministically.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::crypto::MasterKey;
use crate::emm::{self, RidTable};
use crate::encoding::pk_long;
use crate::error::{BuildError, Result};
use crate::store::{EncStore, PlainStore};
use crate::tables::Database;

/// The three index layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Spx,
    Corr,
    Pkfk,
}

impl FromStr for Variant {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "spx" => Ok(Variant::Spx),
            "corr" => Ok(Variant::Corr),
            "pkfk" => Ok(Variant::Pkfk),
            other => Err(BuildError::UnknownVariant {
                name: other.to_string(),
            }),
        }
    }
}

/// Cooperative cancellation, checked at the build barriers. A triggered
/// token aborts outstanding work; the encrypted store may be left partial
/// and the caller re-runs with overwrite.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn check(&self) -> Result<()> {
        if self.flag.load(Ordering::SeqCst) {
            Err(BuildError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Progress of one build pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    Init,
    DatagenScanned,
    RidAttached,
    EmmBuilt,
    IndicesRequested,
    Analyzed,
    Done,
}

fn advance(state: &mut BuildState, next: BuildState) {
    info!(from = ?*state, to = ?next, "build state");
    *state = next;
}

/// Summary returned by a successful build.
#[derive(Debug)]
pub struct BuildReport {
    pub variant: Variant,
    pub tables: usize,
    pub rows: usize,
    pub indices: usize,
}

/// Runs one full build pass: plaintext scan, validation, RID attachment,
/// scheme dispatch, index requests, ANALYZE.
pub fn build(
    variant: Variant,
    master: &MasterKey,
    plain: &PlainStore,
    enc: &mut EncStore,
    cancel: &CancelToken,
) -> Result<BuildReport> {
    let mut state = BuildState::Init;

    let db = plain.read_database()?;
    advance(&mut state, BuildState::DatagenScanned);

    // validation errors fire here, before any encrypted-side write
    db.validate()?;

    let rid_tables = attach_rids(variant, &db)?;
    cancel.check()?;
    advance(&mut state, BuildState::RidAttached);

    let indices = match variant {
        Variant::Spx => emm::spx::build(master, &db, &rid_tables, enc, cancel)?,
        Variant::Corr => emm::corr::build(master, &db, &rid_tables, enc, cancel)?,
        Variant::Pkfk => emm::pkfk::build(master, &db, &rid_tables, enc, cancel)?,
    };
    advance(&mut state, BuildState::EmmBuilt);

    for (table, column, kind) in &indices {
        enc.request_index(table, column, *kind)?;
    }
    advance(&mut state, BuildState::IndicesRequested);

    enc.analyze()?;
    advance(&mut state, BuildState::Analyzed);

    advance(&mut state, BuildState::Done);
    Ok(BuildReport {
        variant,
        tables: db.tables.len(),
        rows: db.tables.iter().map(|t| t.rows.len()).sum(),
        indices: indices.len(),
    })
}

/// RID attachment. SPX and CORR assign monotone per-table identifiers;
/// PKFK uses the primary key itself, collapsed to a long.
fn attach_rids(variant: Variant, db: &Database) -> Result<Vec<RidTable<'_>>> {
    match variant {
        Variant::Spx | Variant::Corr => {
            Ok(db.tables.iter().map(RidTable::attach).collect())
        }
        Variant::Pkfk => db
            .tables
            .iter()
            .map(|table| {
                let pk = db.keys.primary_of(&table.name).ok_or_else(|| {
                    BuildError::MissingPrimaryKey {
                        table: table.name.clone(),
                    }
                })?;
                let rids = table
                    .rows
                    .iter()
                    .map(|row| pk_long(pk, table, row).map(|long| long as u64))
                    .collect::<Result<Vec<u64>>>()?;
                Ok(RidTable { table, rids })
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::scenario_database;

    #[test]
    fn variant_parsing() {
        assert_eq!(Variant::from_str("spx").unwrap(), Variant::Spx);
        assert_eq!(Variant::from_str("corr").unwrap(), Variant::Corr);
        assert_eq!(Variant::from_str("pkfk").unwrap(), Variant::Pkfk);
        assert!(Variant::from_str("opx").is_err());
    }

    #[test]
    fn cancel_token_trips_at_barriers() {
        let cancel = CancelToken::new();
        cancel.check().unwrap();
        cancel.cancel();
        assert!(matches!(cancel.check(), Err(BuildError::Cancelled)));
    }

    #[test]
    fn pkfk_rids_are_primary_keys() {
        let db = scenario_database();
        let rid_tables = attach_rids(Variant::Pkfk, &db).unwrap();
        // data2 PK is column a
        assert_eq!(rid_tables[0].rids, vec![1, 1, 2, 3]);
        // data3 PK is column c
        assert_eq!(rid_tables[1].rids, vec![1, 1, 2]);
    }

    #[test]
    fn spx_rids_are_monotone() {
        let db = scenario_database();
        let rid_tables = attach_rids(Variant::Spx, &db).unwrap();
        assert_eq!(rid_tables[0].rids, vec![0, 1, 2, 3]);
    }
}
