//! Synthetic plaintext data for exercising a build end to end.
//!
//! Generates the two-table shape used throughout the test scenarios,
//! scaled to an arbitrary row count: a primary table whose key column the
//! second table references, with small value domains so filter buckets and
//! join fan-out are non-trivial. Generation is seeded and reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::tables::{
    CellContent, CellType, Database, ForeignKey, KeySpec, PrimaryKey, Table, TableHeaders,
};

/// Builds `data2(a, b)` and `data3(c, d)` with `rows` and `rows / 2` rows
/// respectively, PKs `data2.a` / `data3.c` and FK `data2.b -> data3.c`.
pub fn synthetic_database(rows: usize, seed: u64) -> Database {
    let mut rng = StdRng::seed_from_u64(seed);
    let primary_rows = std::cmp::max(1, rows / 2);

    let data3 = Table {
        name: "data3".into(),
        headers: TableHeaders(vec![
            ("c".into(), CellType::I64),
            ("d".into(), CellType::I64),
        ]),
        rows: (0..primary_rows)
            .map(|i| {
                vec![
                    CellContent::I64(i as i64),
                    CellContent::I64(rng.gen_range(0..8)),
                ]
            })
            .collect(),
    };

    let data2 = Table {
        name: "data2".into(),
        headers: TableHeaders(vec![
            ("a".into(), CellType::I64),
            ("b".into(), CellType::I64),
        ]),
        rows: (0..rows)
            .map(|i| {
                vec![
                    CellContent::I64(i as i64),
                    CellContent::I64(rng.gen_range(0..primary_rows as i64)),
                ]
            })
            .collect(),
    };

    info!(rows, primary_rows, "generated synthetic tables");
    Database {
        tables: vec![data2, data3],
        keys: KeySpec {
            primary: vec![
                PrimaryKey {
                    table: "data2".into(),
                    columns: vec!["a".into()],
                },
                PrimaryKey {
                    table: "data3".into(),
                    columns: vec!["c".into()],
                },
            ],
            foreign: vec![ForeignKey {
                table: "data2".into(),
                column: "b".into(),
                ref_table: "data3".into(),
                ref_column: "c".into(),
            }],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_seeded_and_valid() {
        let first = synthetic_database(64, 7);
        let second = synthetic_database(64, 7);
        first.validate().unwrap();
        assert_eq!(first.tables[0].rows, second.tables[0].rows);
        assert_eq!(first.tables[0].rows.len(), 64);
        assert_eq!(first.tables[1].rows.len(), 32);

        // every foreign value resolves to a primary key
        let primary_rows = first.tables[1].rows.len() as i64;
        for row in &first.tables[0].rows {
            let b = row[1].as_long("data2").unwrap();
            assert!((0..primary_rows).contains(&b));
        }
    }
}
