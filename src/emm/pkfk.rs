//! The PKFK layout: no separate EMM tables. Each encrypted table embeds
//! its own join tokens (`pfk_*`, `fpk_*`), filter tokens (`val_*`,
//! `dep_val_*`) and cell ciphertexts (`enc_*`). In this scheme the row
//! identifier is the primary key itself, collapsed to a long, and only its
//! encrypted form leaves the builder.

use std::collections::BTreeMap;

use tracing::info_span;

use crate::builder::CancelToken;
use crate::crypto::MasterKey;
use crate::encoding::{filter_predicate, pkfk_predicate};
use crate::error::{BuildError, Result};
use crate::store::{EncStore, IndexKind};
use crate::tables::Database;

use super::{enc_table_name, IndexRequest, RidTable};

pub fn build(
    master: &MasterKey,
    db: &Database,
    rid_tables: &[RidTable],
    store: &mut EncStore,
    cancel: &CancelToken,
) -> Result<Vec<IndexRequest>> {
    let mut indices: Vec<IndexRequest> = Vec::new();
    for rid_table in rid_tables {
        let span = info_span!("pkfk_table", table = %rid_table.table.name);
        let _enter = span.enter();

        let enc = encrypt_pkfk_table(master, db, rid_table, cancel)?;
        cancel.check()?;
        store.overwrite_table(&enc.table, &enc.columns)?;
        store.insert_rows(&enc.table, &enc.columns, &enc.rows)?;
        for column in enc.index_columns {
            indices.push((enc.table.clone(), column, IndexKind::Tree));
        }
    }
    Ok(indices)
}

struct PkfkTable {
    table: String,
    columns: Vec<String>,
    index_columns: Vec<String>,
    rows: Vec<Vec<Vec<u8>>>,
}

/// Ranks rows within partitions of `keys`: within each partition the rank
/// is dense from 0, ordered by (RID, row position) so ties between
/// duplicate identifiers stay deterministic.
fn dense_counters(keys: &[String], rids: &[u64]) -> Vec<u64> {
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, key) in keys.iter().enumerate() {
        groups.entry(key.as_str()).or_default().push(i);
    }
    let mut counters = vec![0u64; keys.len()];
    for members in groups.values_mut() {
        members.sort_by_key(|&i| (rids[i], i));
        for (rank, &i) in members.iter().enumerate() {
            counters[i] = rank as u64;
        }
    }
    counters
}

fn encrypt_pkfk_table(
    master: &MasterKey,
    db: &Database,
    rid_table: &RidTable,
    cancel: &CancelToken,
) -> Result<PkfkTable> {
    let table = rid_table.table;
    let rids = &rid_table.rids;
    let n = table.rows.len();
    let pk = db
        .keys
        .primary_of(&table.name)
        .ok_or_else(|| BuildError::MissingPrimaryKey {
            table: table.name.clone(),
        })?;
    let join_cols = db.keys.join_columns(&table.name);

    let aead = master.cell_cipher();
    let prp = master.rid_cipher();

    let mut columns: Vec<String> = vec!["enc_rid".to_string()];
    let mut index_columns: Vec<String> = Vec::new();
    let mut cells: Vec<Vec<Vec<u8>>> = vec![rids.iter().map(|&rid| prp.encrypt(rid)).collect()];

    // join-token column pair per outgoing foreign key
    for fk in db.keys.foreign.iter().filter(|fk| fk.table == table.name) {
        let a_idx = table.headers.index_of(&table.name, &fk.column)?;
        let mut a_longs: Vec<u64> = Vec::with_capacity(n);
        let mut a_lexemes: Vec<String> = Vec::with_capacity(n);
        for row in &table.rows {
            a_longs.push(row[a_idx].as_long(&table.name)? as u64);
            a_lexemes.push(row[a_idx].lexeme());
        }
        let counters = dense_counters(&a_lexemes, rids);
        cancel.check()?;

        // forward: probing with the primary-side key value enumerates the
        // matching foreign rows
        let forward = pkfk_predicate(&fk.ref_table, &table.name);
        let forward_trapdoor = master.trapdoor(forward.as_bytes());
        let pfk_name = format!(
            "pfk_{}",
            master.opaque_name(&format!("{}~{}", fk.ref_table, table.name))
        );
        cells.push(
            (0..n)
                .map(|i| forward_trapdoor.secondary(a_longs[i]).label(counters[i]))
                .collect(),
        );
        index_columns.push(pfk_name.clone());
        columns.push(pfk_name);

        // reverse: decrypting with the row's own RID recovers the
        // referenced key value
        let reverse = pkfk_predicate(&table.name, &fk.ref_table);
        let reverse_trapdoor = master.trapdoor(reverse.as_bytes());
        let fpk_name = format!(
            "fpk_{}",
            master.opaque_name(&format!("{}~{}", table.name, fk.ref_table))
        );
        cells.push(
            (0..n)
                .map(|i| reverse_trapdoor.secondary(rids[i]).xor_rid(b"v", a_longs[i]))
                .collect(),
        );
        columns.push(fpk_name);
    }

    // filter-token triple per non-key column
    for (idx, column) in table.headers.column_names().enumerate() {
        if pk.columns.iter().any(|c| c == column) || join_cols.contains(column) {
            continue;
        }
        let lexemes: Vec<String> = table.rows.iter().map(|row| row[idx].lexeme()).collect();
        let counters = dense_counters(&lexemes, rids);
        cancel.check()?;
        let opaque = master.opaque_name(column);

        let val: Vec<Vec<u8>> = (0..n)
            .map(|i| {
                let predicate = filter_predicate(&table.name, column, &lexemes[i]);
                master.trapdoor_j(predicate.as_bytes(), 1).label(counters[i])
            })
            .collect();
        let dep_val: Vec<Vec<u8>> = (0..n)
            .map(|i| {
                let predicate = filter_predicate(&table.name, column, &lexemes[i]);
                master.trapdoor(predicate.as_bytes()).token(rids[i])
            })
            .collect();
        let enc: Result<Vec<Vec<u8>>> = lexemes
            .iter()
            .map(|lexeme| aead.encrypt(lexeme.as_bytes()))
            .collect();

        let val_name = format!("val_{opaque}");
        let dep_name = format!("dep_val_{opaque}");
        index_columns.push(val_name.clone());
        index_columns.push(dep_name.clone());
        columns.push(val_name);
        columns.push(dep_name);
        columns.push(format!("enc_{opaque}"));
        cells.push(val);
        cells.push(dep_val);
        cells.push(enc?);
    }

    // column-major to row-major for insertion
    let rows: Vec<Vec<Vec<u8>>> = (0..n)
        .map(|i| cells.iter().map(|col| col[i].clone()).collect())
        .collect();

    Ok(PkfkTable {
        table: enc_table_name(master, &table.name),
        columns,
        index_columns,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CancelToken;
    use crate::encoding::pk_long;
    use crate::tables::scenario_database;

    fn pk_rid_table<'a>(db: &'a Database, name: &str) -> RidTable<'a> {
        let table = db.table(name).unwrap();
        let pk = db.keys.primary_of(name).unwrap();
        let rids = table
            .rows
            .iter()
            .map(|row| pk_long(pk, table, row).unwrap() as u64)
            .collect();
        RidTable { table, rids }
    }

    /// S3 setup: PK data2.a, FK data3.c -> data2.a.
    fn s3_database() -> Database {
        let mut db = scenario_database();
        db.keys.foreign = vec![crate::tables::ForeignKey {
            table: "data3".into(),
            column: "c".into(),
            ref_table: "data2".into(),
            ref_column: "a".into(),
        }];
        db
    }

    #[test]
    fn dense_counters_rank_within_partitions() {
        let keys: Vec<String> = ["1", "1", "2", "1"].iter().map(|s| s.to_string()).collect();
        let rids = vec![10, 5, 7, 20];
        // partition "1" holds rids 10,5,20 -> ranks by rid: 5->0, 10->1, 20->2
        assert_eq!(dense_counters(&keys, &rids), vec![1, 0, 0, 2]);
    }

    #[test]
    fn pkfk_round_trip_on_the_scenario() {
        let master = MasterKey::from_bytes([8u8; 32]);
        let db = s3_database();
        let rid_table = pk_rid_table(&db, "data3");
        let cancel = CancelToken::new();
        let enc = encrypt_pkfk_table(&master, &db, &rid_table, &cancel).unwrap();

        // data3 columns: c is PK and FK, d is the only non-key column
        // layout: enc_rid, pfk, fpk, val_d, dep_val_d, enc_d
        assert_eq!(enc.columns.len(), 6);
        assert_eq!(enc.rows.len(), 3);
        assert_eq!(enc.index_columns.len(), 3);

        // forward probe: S = PRF_{T}(a=1), counters 0,1 enumerate the two
        // c=1 rows; counter 2 misses
        let forward = pkfk_predicate("data2", "data3");
        let s = master.trapdoor(forward.as_bytes()).secondary(1);
        let pfk_cells: Vec<&Vec<u8>> = enc.rows.iter().map(|r| &r[1]).collect();
        assert!(pfk_cells.contains(&&s.label(0)));
        assert!(pfk_cells.contains(&&s.label(1)));
        assert!(!pfk_cells.contains(&&s.label(2)));

        // reverse: decrypting fpk with the row's RID recovers the key value
        let reverse = pkfk_predicate("data3", "data2");
        let trapdoor = master.trapdoor(reverse.as_bytes());
        for (i, row) in enc.rows.iter().enumerate() {
            let rid = rid_table.rids[i];
            let s_prime = trapdoor.secondary(rid);
            assert_eq!(s_prime.unxor_rid(b"v", &row[2]), rid);
        }
    }

    #[test]
    fn pkfk_filter_tokens_match_client_side_derivation() {
        let master = MasterKey::from_bytes([8u8; 32]);
        let db = s3_database();
        let rid_table = pk_rid_table(&db, "data2");
        let cancel = CancelToken::new();
        let enc = encrypt_pkfk_table(&master, &db, &rid_table, &cancel).unwrap();

        // data2: a is PK, b is non-key (the FK edge touches data3.c and
        // data2.a); layout: enc_rid, val_b, dep_val_b, enc_b
        assert_eq!(enc.columns.len(), 4);

        // each b value is unique, so every val token sits at counter 0
        for (i, row) in enc.rows.iter().enumerate() {
            let lexeme = db.table("data2").unwrap().rows[i][1].lexeme();
            let predicate = filter_predicate("data2", "b", &lexeme);
            assert_eq!(row[1], master.trapdoor_j(predicate.as_bytes(), 1).label(0));
            assert_eq!(
                row[2],
                master
                    .trapdoor(predicate.as_bytes())
                    .token(rid_table.rids[i])
            );
        }
    }
}
