//! The SPX layout: per-table encrypted rows, one flat filter EMM and one
//! uncorrelated-join EMM keyed by foreign-key declarations.

use tracing::{debug, info_span};

use crate::builder::CancelToken;
use crate::crypto::MasterKey;
use crate::encoding::uncorr_join_predicate;
use crate::error::{BuildError, Result};
use crate::store::{EncStore, IndexKind};
use crate::tables::{Database, ForeignKey};

use super::{
    buckets_by_lexeme, encrypt_rows, filter_entries, IndexRequest, RidTable, T_FILTER,
    T_UNCORR_JOIN,
};

pub fn build(
    master: &MasterKey,
    db: &Database,
    rid_tables: &[RidTable],
    store: &mut EncStore,
    cancel: &CancelToken,
) -> Result<Vec<IndexRequest>> {
    write_base_tables(master, db, rid_tables, store, cancel)?;

    let join_columns = vec![
        "label".to_string(),
        "value_left".to_string(),
        "value_right".to_string(),
    ];
    let mut join_rows: Vec<Vec<Vec<u8>>> = Vec::new();
    for fk in &db.keys.foreign {
        join_rows.extend(uncorr_join_entries(master, fk, rid_tables)?);
    }
    cancel.check()?;
    store.overwrite_table(T_UNCORR_JOIN, &join_columns)?;
    store.insert_rows(T_UNCORR_JOIN, &join_columns, &join_rows)?;

    Ok(vec![
        (T_FILTER.to_string(), "label".to_string(), IndexKind::Hash),
        (T_UNCORR_JOIN.to_string(), "label".to_string(), IndexKind::Hash),
    ])
}

/// Writes the per-table encrypted rows and the flat filter EMM. CORR
/// reuses this verbatim, then layers its own tables on top.
pub(super) fn write_base_tables(
    master: &MasterKey,
    db: &Database,
    rid_tables: &[RidTable],
    store: &mut EncStore,
    cancel: &CancelToken,
) -> Result<()> {
    for rid_table in rid_tables {
        let span = info_span!("encrypt_rows", table = %rid_table.table.name);
        let _enter = span.enter();

        let enc = encrypt_rows(master, rid_table)?;
        cancel.check()?;
        store.overwrite_table(&enc.name, &enc.columns)?;
        store.insert_rows(&enc.name, &enc.columns, &enc.rows)?;
    }

    // union of filter entries across all (table, column) pairs
    let mut filter_rows: Vec<Vec<Vec<u8>>> = Vec::new();
    for rid_table in rid_tables {
        let entries = filter_entries(master, rid_table, &db.keys);
        debug!(table = %rid_table.table.name, entries = entries.len(), "filter entries");
        filter_rows.extend(entries);
    }
    cancel.check()?;
    let filter_columns = vec!["label".to_string(), "value".to_string()];
    store.overwrite_table(T_FILTER, &filter_columns)?;
    store.insert_rows(T_FILTER, &filter_columns, &filter_rows)?;
    Ok(())
}

pub(super) fn find_rid_table<'a, 'b>(
    rid_tables: &'a [RidTable<'b>],
    name: &str,
) -> Result<&'a RidTable<'b>> {
    rid_tables
        .iter()
        .find(|rt| rt.table.name == name)
        .ok_or_else(|| BuildError::UnknownTable {
            table: name.to_string(),
        })
}

/// Equi-join the two sides of one foreign key and emit one EMM entry per
/// matching row pair. The lexicographically smaller qualified name is the
/// left side; the counter is monotone over the whole join result of this
/// predicate.
fn uncorr_join_entries(
    master: &MasterKey,
    fk: &ForeignKey,
    rid_tables: &[RidTable],
) -> Result<Vec<Vec<Vec<u8>>>> {
    let fk_side = (fk.qualified(), fk.table.as_str(), fk.column.as_str());
    let ref_side = (fk.ref_qualified(), fk.ref_table.as_str(), fk.ref_column.as_str());
    let (left, right) = if fk_side.0 <= ref_side.0 {
        (fk_side, ref_side)
    } else {
        (ref_side, fk_side)
    };

    let left_table = find_rid_table(rid_tables, left.1)?;
    let right_table = find_rid_table(rid_tables, right.1)?;
    let left_col = left_table.table.headers.index_of(left.1, left.2)?;
    let right_col = right_table.table.headers.index_of(right.1, right.2)?;

    let left_buckets = buckets_by_lexeme(left_table, left_col);
    let right_buckets = buckets_by_lexeme(right_table, right_col);

    let predicate = uncorr_join_predicate(&left.0, &right.0);
    let (t1, t2) = master.trapdoor_pair(predicate.as_bytes());

    let mut entries: Vec<Vec<Vec<u8>>> = Vec::new();
    let mut counter: u64 = 0;
    for (lexeme, left_rids) in &left_buckets {
        let Some(right_rids) = right_buckets.get(lexeme) else {
            continue;
        };
        for &rid_left in left_rids {
            for &rid_right in right_rids {
                entries.push(vec![
                    t1.label(counter),
                    t2.xor_rid(b"l", rid_left),
                    t2.xor_rid(b"r", rid_right),
                ]);
                counter += 1;
            }
        }
    }
    Ok(entries)
}
