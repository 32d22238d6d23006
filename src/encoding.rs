//! Canonical encodings shared by every scheme: predicate byte strings and
//! the pairing function that collapses a two-column key into one long.
//!
//! Predicate strings are client secrets. They are fed to the PRF to derive
//! trapdoors and never reach the server; `~` is the reserved separator,
//! which validation keeps out of table and column names.

use crate::error::{BuildError, Result};
use crate::tables::{CellContent, PrimaryKey, Table};

/// `filter~<table>~<attr>~<lexeme>`, the selection predicate.
pub fn filter_predicate(table: &str, attr: &str, lexeme: &str) -> String {
    format!("filter~{table}~{attr}~{lexeme}")
}

/// `corrjoin~<lt>.<la>~<rt>.<ra>`, the correlated-join predicate for one
/// orientation of a foreign key.
pub fn corr_join_predicate(lt: &str, la: &str, rt: &str, ra: &str) -> String {
    format!("corrjoin~{lt}.{la}~{rt}.{ra}")
}

/// `uncorrjoin~<first>~<second>` over the lexicographically ordered pair of
/// qualified names, so both declarations of the same edge share a bucket.
pub fn uncorr_join_predicate(left_qualified: &str, right_qualified: &str) -> String {
    if left_qualified <= right_qualified {
        format!("uncorrjoin~{left_qualified}~{right_qualified}")
    } else {
        format!("uncorrjoin~{right_qualified}~{left_qualified}")
    }
}

/// `pkfk~<primary_table>~<foreign_table>`.
pub fn pkfk_predicate(primary_table: &str, foreign_table: &str) -> String {
    format!("pkfk~{primary_table}~{foreign_table}")
}

/// Cantor pairing `π(a,b) = (a+b)(a+b+1)/2 + b`, a bijection from ordered
/// pairs of naturals to naturals. Components must be non-negative and the
/// result must fit an `i64`.
pub fn cantor_pair(table: &str, a: i64, b: i64) -> Result<i64> {
    if a < 0 {
        return Err(BuildError::NegativeKeyComponent {
            table: table.to_string(),
            value: a,
        });
    }
    if b < 0 {
        return Err(BuildError::NegativeKeyComponent {
            table: table.to_string(),
            value: b,
        });
    }
    let (a, b) = (a as i128, b as i128);
    let paired = (a + b) * (a + b + 1) / 2 + b;
    i64::try_from(paired).map_err(|_| BuildError::CompoundKeyOverflow {
        table: table.to_string(),
    })
}

/// Reduces a row's primary key to one long: an atomic key is the column
/// value itself, a compound key is the Cantor pairing of its two
/// components.
pub fn pk_long(pk: &PrimaryKey, table: &Table, row: &[CellContent]) -> Result<i64> {
    match pk.columns.as_slice() {
        [single] => {
            let idx = table.headers.index_of(&table.name, single)?;
            row[idx].as_long(&table.name)
        }
        [first, second] => {
            let i = table.headers.index_of(&table.name, first)?;
            let j = table.headers.index_of(&table.name, second)?;
            cantor_pair(
                &table.name,
                row[i].as_long(&table.name)?,
                row[j].as_long(&table.name)?,
            )
        }
        other => Err(BuildError::CompoundKeyArity {
            table: table.name.clone(),
            arity: other.len(),
        }),
    }
}
