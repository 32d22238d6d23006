//! The CORR layout: everything SPX builds, plus a dependent-filter token
//! set and a correlated-join EMM whose buckets hang off the left row's
//! secondary trapdoors.

use tracing::debug;

use crate::builder::CancelToken;
use crate::crypto::MasterKey;
use crate::encoding::{corr_join_predicate, filter_predicate};
use crate::error::Result;
use crate::store::{EncStore, IndexKind};
use crate::tables::Database;

use super::spx::find_rid_table;
use super::{
    buckets_by_lexeme, filter_columns, IndexRequest, RidTable, T_CORR_JOIN, T_DEP_FILTER,
};

pub fn build(
    master: &MasterKey,
    db: &Database,
    rid_tables: &[RidTable],
    store: &mut EncStore,
    cancel: &CancelToken,
) -> Result<Vec<IndexRequest>> {
    // the SPX tables come first, including the uncorrelated-join EMM
    let mut indices = super::spx::build(master, db, rid_tables, store, cancel)?;

    let mut dep_rows: Vec<Vec<Vec<u8>>> = Vec::new();
    for rid_table in rid_tables {
        dep_rows.extend(dep_filter_entries(master, rid_table, db));
    }
    cancel.check()?;
    let dep_columns = vec!["tok".to_string()];
    store.overwrite_table(T_DEP_FILTER, &dep_columns)?;
    store.insert_rows(T_DEP_FILTER, &dep_columns, &dep_rows)?;

    let mut join_rows: Vec<Vec<Vec<u8>>> = Vec::new();
    for fk in &db.keys.foreign {
        // both orientations of every declared edge
        let forward = (
            (fk.table.as_str(), fk.column.as_str()),
            (fk.ref_table.as_str(), fk.ref_column.as_str()),
        );
        for (left, right) in [forward, (forward.1, forward.0)] {
            join_rows.extend(corr_join_entries(master, left, right, rid_tables)?);
        }
    }
    cancel.check()?;
    let join_columns = vec!["label".to_string(), "value".to_string()];
    store.overwrite_table(T_CORR_JOIN, &join_columns)?;
    store.insert_rows(T_CORR_JOIN, &join_columns, &join_rows)?;

    indices.push((T_DEP_FILTER.to_string(), "tok".to_string(), IndexKind::Hash));
    indices.push((T_CORR_JOIN.to_string(), "label".to_string(), IndexKind::Hash));
    Ok(indices)
}

/// Dependent-filter tokens: one `PRF_{T_P}(ρ)` per matching row of every
/// filter predicate. The client later derives the same token for each
/// candidate ρ and the server probes this set by equality.
fn dep_filter_entries(
    master: &MasterKey,
    rid_table: &RidTable,
    db: &Database,
) -> Vec<Vec<Vec<u8>>> {
    let table = rid_table.table;
    let mut rows: Vec<Vec<Vec<u8>>> = Vec::new();
    for (idx, column) in filter_columns(table, &db.keys) {
        for (lexeme, rids) in buckets_by_lexeme(rid_table, idx) {
            let predicate = filter_predicate(&table.name, column, &lexeme);
            let trapdoor = master.trapdoor(predicate.as_bytes());
            for rid in rids {
                rows.push(vec![trapdoor.token(rid)]);
            }
        }
    }
    debug!(table = %table.name, tokens = rows.len(), "dependent-filter tokens");
    rows
}

/// Correlated-join entries for one orientation `(L, R)`: for each left row
/// ρ_L with at least one match, secondary trapdoors `S_1, S_2` key a dense
/// per-ρ_L bucket of encrypted right-side RIDs. The query processor
/// increments the counter until a lookup miss.
fn corr_join_entries(
    master: &MasterKey,
    left: (&str, &str),
    right: (&str, &str),
    rid_tables: &[RidTable],
) -> Result<Vec<Vec<Vec<u8>>>> {
    let left_table = find_rid_table(rid_tables, left.0)?;
    let right_table = find_rid_table(rid_tables, right.0)?;
    let left_col = left_table.table.headers.index_of(left.0, left.1)?;
    let right_col = right_table.table.headers.index_of(right.0, right.1)?;

    let predicate = corr_join_predicate(left.0, left.1, right.0, right.1);
    let master_trapdoor = master.trapdoor(predicate.as_bytes());
    let right_buckets = buckets_by_lexeme(right_table, right_col);

    let mut entries: Vec<Vec<Vec<u8>>> = Vec::new();
    for (rid_left, row) in left_table.rows() {
        let Some(right_rids) = right_buckets.get(&row[left_col].lexeme()) else {
            continue;
        };
        let s1 = master_trapdoor.secondary_j(rid_left, 1);
        let s2 = master_trapdoor.secondary_j(rid_left, 2);
        for (k, &rid_right) in right_rids.iter().enumerate() {
            entries.push(vec![s1.label(k as u64), s2.xor_rid(b"v", rid_right)]);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::scenario_database;

    #[test]
    fn corr_join_buckets_follow_the_scenario_counts() {
        let master = MasterKey::from_bytes([5u8; 32]);
        let db = scenario_database();
        let rid_tables: Vec<RidTable> = db.tables.iter().map(RidTable::attach).collect();

        let forward =
            corr_join_entries(&master, ("data2", "b"), ("data3", "c"), &rid_tables).unwrap();
        let reverse =
            corr_join_entries(&master, ("data3", "c"), ("data2", "b"), &rid_tables).unwrap();
        // forward: rows of data2 match 2, 1, 0, 0 rows of data3
        assert_eq!(forward.len(), 3);
        // reverse: rows of data3 match 1, 1, 1 rows of data2
        assert_eq!(reverse.len(), 3);

        // probe the bucket of data2 row (1,1) (rid 0): counters 0,1 hit
        let predicate = corr_join_predicate("data2", "b", "data3", "c");
        let trapdoor = master.trapdoor(predicate.as_bytes());
        let (s1, s2) = (trapdoor.secondary_j(0, 1), trapdoor.secondary_j(0, 2));
        let mut recovered = Vec::new();
        for k in 0.. {
            let label = s1.label(k);
            match forward.iter().find(|e| e[0] == label) {
                Some(entry) => recovered.push(s2.unxor_rid(b"v", &entry[1])),
                None => break,
            }
        }
        assert_eq!(recovered, vec![0, 1]);

        // data2 row (1,2) (rid 1) matches only data3 (2,3) (rid 2)
        let (s1, s2) = (trapdoor.secondary_j(1, 1), trapdoor.secondary_j(1, 2));
        let entry = forward.iter().find(|e| e[0] == s1.label(0)).unwrap();
        assert_eq!(s2.unxor_rid(b"v", &entry[1]), 2);
        assert!(!forward.iter().any(|e| e[0] == s1.label(1)));
    }

    #[test]
    fn dep_filter_tokens_match_client_derivation() {
        let master = MasterKey::from_bytes([5u8; 32]);
        let db = scenario_database();
        let rid_table = RidTable::attach(db.table("data2").unwrap());
        let rows = dep_filter_entries(&master, &rid_table, &db);
        // one token per (non-join column, row): column a over 4 rows
        assert_eq!(rows.len(), 4);

        let trapdoor = master.trapdoor(b"filter~data2~a~1");
        assert!(rows.iter().any(|r| r[0] == trapdoor.token(0)));
        assert!(rows.iter().any(|r| r[0] == trapdoor.token(1)));
        assert!(!rows.iter().any(|r| r[0] == trapdoor.token(2)));
    }
}
