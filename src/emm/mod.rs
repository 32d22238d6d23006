//! Encrypted multi-map construction.
//!
//! The three schemes live in their own submodules and share the pieces
//! defined here: RID attachment, the row encryptor, bucket partitioning
//! with dense counters, and the PiBAS-style filter entries used by both
//! the SPX and CORR layouts.

pub mod corr;
pub mod pkfk;
pub mod spx;

use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::crypto::MasterKey;
use crate::encoding::filter_predicate;
use crate::error::Result;
use crate::store::IndexKind;
use crate::tables::{CellContent, KeySpec, Table};

/// Flat filter EMM shared by SPX and CORR.
pub const T_FILTER: &str = "t_filter";
/// Uncorrelated-join EMM (SPX).
pub const T_UNCORR_JOIN: &str = "t_uncorr_join";
/// Dependent-filter token set (CORR).
pub const T_DEP_FILTER: &str = "t_dep_filter";
/// Correlated-join EMM (CORR).
pub const T_CORR_JOIN: &str = "t_corr_join";

/// An index request emitted by a scheme, realized after all inserts.
pub type IndexRequest = (String, String, IndexKind);

/// A plaintext table with row identifiers attached: RID ρ is a 64-bit
/// monotone value, unique within the table, assigned in row order.
pub struct RidTable<'a> {
    pub table: &'a Table,
    pub rids: Vec<u64>,
}

impl<'a> RidTable<'a> {
    pub fn attach(table: &'a Table) -> Self {
        RidTable {
            table,
            rids: (0..table.rows.len() as u64).collect(),
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = (u64, &'a [CellContent])> + '_ {
        self.rids
            .iter()
            .copied()
            .zip(self.table.rows.iter().map(|r| r.as_slice()))
    }
}

/// Columns eligible for filter indexing: everything that does not appear
/// on either side of a foreign key. Join attributes are served by the join
/// EMMs and never get filter buckets.
pub fn filter_columns<'a>(table: &'a Table, keys: &KeySpec) -> Vec<(usize, &'a str)> {
    let join_cols = keys.join_columns(&table.name);
    table
        .headers
        .column_names()
        .enumerate()
        .filter(|(_, name)| !join_cols.contains(*name))
        .collect()
}

/// Partitions a column into value buckets. Each bucket holds the RIDs of
/// the matching rows in ascending order, so zipping with `0..` yields the
/// dense, deterministic counter sequence the query processor enumerates.
pub fn buckets_by_lexeme(rid_table: &RidTable, column: usize) -> BTreeMap<String, Vec<u64>> {
    let mut buckets: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for (rid, row) in rid_table.rows() {
        buckets.entry(row[column].lexeme()).or_default().push(rid);
    }
    for rids in buckets.values_mut() {
        rids.sort_unstable();
    }
    buckets
}

/// Opaque server-side name for a plaintext table.
pub fn enc_table_name(master: &MasterKey, table: &str) -> String {
    format!("t_{}", master.opaque_name(table))
}

/// Opaque server-side name for a plaintext column.
pub fn enc_column_name(master: &MasterKey, column: &str) -> String {
    format!("c_{}", master.opaque_name(column))
}

/// One encrypted table ready for insertion: all columns are BLOBs.
pub struct EncryptedTable {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Vec<u8>>>,
}

/// The row encryptor: projects a RID-attached table to
/// `{enc_rid, PRF(col_1), …}` with every cell AEAD-encrypted. Per-row and
/// embarrassingly parallel; output order follows input order but nothing
/// downstream depends on it.
pub fn encrypt_rows(master: &MasterKey, rid_table: &RidTable) -> Result<EncryptedTable> {
    let aead = master.cell_cipher();
    let prp = master.rid_cipher();
    let table = rid_table.table;

    let mut columns = vec!["enc_rid".to_string()];
    columns.extend(table.headers.column_names().map(|c| enc_column_name(master, c)));

    let rows: Result<Vec<Vec<Vec<u8>>>> = table
        .rows
        .par_iter()
        .zip(rid_table.rids.par_iter())
        .map(|(row, &rid)| {
            let mut out: Vec<Vec<u8>> = Vec::with_capacity(row.len() + 1);
            out.push(prp.encrypt(rid));
            for cell in row {
                out.push(aead.encrypt(cell.lexeme().as_bytes())?);
            }
            Ok(out)
        })
        .collect();

    Ok(EncryptedTable {
        name: enc_table_name(master, &table.name),
        columns,
        rows: rows?,
    })
}

/// PiBAS filter entries for one table: for every eligible column and every
/// value bucket, derive the two-key trapdoor pair and emit
/// `(PRF_T1(k), rid_k ⊕ PRF_T2("v"))` for the dense counters k.
pub fn filter_entries(
    master: &MasterKey,
    rid_table: &RidTable,
    keys: &KeySpec,
) -> Vec<Vec<Vec<u8>>> {
    let table = rid_table.table;
    let mut predicates: Vec<(String, Vec<u64>)> = Vec::new();
    for (idx, column) in filter_columns(table, keys) {
        for (lexeme, rids) in buckets_by_lexeme(rid_table, idx) {
            predicates.push((filter_predicate(&table.name, column, &lexeme), rids));
        }
    }

    predicates
        .par_iter()
        .flat_map(|(predicate, rids)| {
            let (t1, t2) = master.trapdoor_pair(predicate.as_bytes());
            rids.iter()
                .enumerate()
                .map(|(k, &rid)| vec![t1.label(k as u64), t2.xor_rid(b"v", rid)])
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use crate::tables::scenario_database;

    fn master() -> MasterKey {
        MasterKey::from_bytes([9u8; 32])
    }

    #[test]
    fn rid_attachment_is_monotone_and_dense() {
        let db = scenario_database();
        let rid_table = RidTable::attach(db.table("data2").unwrap());
        assert_eq!(rid_table.rids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn filter_columns_skip_join_attributes() {
        let db = scenario_database();
        let cols = filter_columns(db.table("data2").unwrap(), &db.keys);
        assert_eq!(cols, vec![(0, "a")]);
        let cols = filter_columns(db.table("data3").unwrap(), &db.keys);
        assert_eq!(cols, vec![(1, "d")]);
    }

    #[test]
    fn buckets_are_sorted_and_complete() {
        let db = scenario_database();
        let rid_table = RidTable::attach(db.table("data2").unwrap());
        let buckets = buckets_by_lexeme(&rid_table, 0);
        assert_eq!(buckets["1"], vec![0, 1]);
        assert_eq!(buckets["2"], vec![2]);
        assert_eq!(buckets["3"], vec![3]);
    }

    #[test]
    fn encrypted_rows_conserve_count_and_shape() {
        let db = scenario_database();
        let rid_table = RidTable::attach(db.table("data2").unwrap());
        let enc = encrypt_rows(&master(), &rid_table).unwrap();
        assert_eq!(enc.rows.len(), 4);
        assert_eq!(enc.columns.len(), 3);
        assert!(enc.columns[0] == "enc_rid");
        // enc_rid is deterministic; distinct rids map to distinct blocks
        assert_ne!(enc.rows[0][0], enc.rows[1][0]);
    }

    #[test]
    fn filter_entries_cover_every_match_once() {
        let db = scenario_database();
        let rid_table = RidTable::attach(db.table("data2").unwrap());
        let entries = filter_entries(&master(), &rid_table, &db.keys);
        // column a has buckets {1: 2 rows, 2: 1 row, 3: 1 row}
        assert_eq!(entries.len(), 4);

        // recover the a=1 bucket by trapdoor probing
        let (t1, t2) = master().trapdoor_pair(b"filter~data2~a~1");
        let mut recovered = Vec::new();
        for k in 0..3u64 {
            let label = t1.label(k);
            if let Some(entry) = entries.iter().find(|e| e[0] == label) {
                recovered.push(t2.unxor_rid(b"v", &entry[1]));
            }
        }
        assert_eq!(recovered, vec![0, 1]);
        // counter 2 must miss: counters are dense in [0, n)
        let miss = t1.label(2);
        assert!(!entries.iter().any(|e| e[0] == miss));
    }
}
