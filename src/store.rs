//! The two backing stores: the plaintext source database (read-only during
//! a build) and the encrypted target database.
//!
//! The builder only ever issues overwrite DDL, batched inserts and index
//! requests; retries, vacuuming and connection pooling belong to the
//! operators of the store. All encrypted-side writes are idempotent under
//! re-run with the same inputs and keys.

use std::path::Path;

use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use tracing::{debug, info};

use crate::error::{BuildError, Result};
use crate::tables::{
    CellContent, CellType, Database, ForeignKey, KeySpec, PrimaryKey, Table, TableHeaders,
};

/// Secondary-index family requested on a column.
///
/// Hash indices serve exact label probes on EMM tables; tree indices serve
/// the token columns of the per-table scheme. SQLite realizes both as
/// B-tree indices; the kind is preserved in the request so other backends
/// can honor it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndexKind {
    Hash,
    Tree,
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// === Plaintext source ===

/// Connection to the plaintext relational store.
pub struct PlainStore {
    conn: Connection,
}

const SCHEMA_KEYS_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_keys (
    tbl TEXT NOT NULL,
    kind TEXT NOT NULL,
    cols TEXT NOT NULL,
    ref_tbl TEXT,
    ref_cols TEXT
)";

impl PlainStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(PlainStore {
            conn: Connection::open(path)?,
        })
    }

    pub fn open_read_only(path: &Path) -> Result<Self> {
        Ok(PlainStore {
            conn: Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?,
        })
    }

    /// Writes tables and key declarations, overwriting previous content.
    pub fn write_database(&mut self, db: &Database) -> Result<()> {
        for table in &db.tables {
            let cols = table
                .headers
                .0
                .iter()
                .map(|(name, cell_type)| {
                    let sql_type = match cell_type {
                        CellType::ShortString => "TEXT",
                        _ => "INTEGER",
                    };
                    format!("{} {}", quoted(name), sql_type)
                })
                .collect::<Vec<_>>()
                .join(", ");
            self.conn
                .execute_batch(&format!("DROP TABLE IF EXISTS {}", quoted(&table.name)))?;
            self.conn
                .execute_batch(&format!("CREATE TABLE {} ({cols})", quoted(&table.name)))?;

            let placeholders = (1..=table.headers.0.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let insert = format!("INSERT INTO {} VALUES ({placeholders})", quoted(&table.name));
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare(&insert)?;
                for row in &table.rows {
                    let mut values = Vec::with_capacity(row.len());
                    for cell in row {
                        values.push(match cell {
                            CellContent::ShortString(s) => Value::Text(s.clone()),
                            other => Value::Integer(other.as_long(&table.name)?),
                        });
                    }
                    stmt.execute(params_from_iter(values))?;
                }
            }
            tx.commit()?;
            info!(table = %table.name, rows = table.rows.len(), "wrote plaintext table");
        }
        self.write_key_spec(&db.keys)
    }

    fn write_key_spec(&self, keys: &KeySpec) -> Result<()> {
        self.conn.execute_batch("DROP TABLE IF EXISTS schema_keys")?;
        self.conn.execute_batch(SCHEMA_KEYS_DDL)?;
        let mut stmt = self
            .conn
            .prepare("INSERT INTO schema_keys VALUES (?1, ?2, ?3, ?4, ?5)")?;
        for pk in &keys.primary {
            stmt.execute((&pk.table, "pk", pk.columns.join(","), None::<String>, None::<String>))?;
        }
        for fk in &keys.foreign {
            stmt.execute((&fk.table, "fk", &fk.column, Some(&fk.ref_table), Some(&fk.ref_column)))?;
        }
        Ok(())
    }

    /// Reads every user table plus the key declarations back into memory.
    pub fn read_database(&self) -> Result<Database> {
        let mut names: Vec<String> = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != 'schema_keys'
                 ORDER BY name",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                names.push(row.get(0)?);
            }
        }

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            tables.push(self.read_table(&name)?);
        }
        let keys = self.read_key_spec()?;
        Ok(Database { tables, keys })
    }

    fn read_table(&self, name: &str) -> Result<Table> {
        let mut headers: Vec<(String, CellType)> = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA table_info({})", quoted(name)))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let column: String = row.get(1)?;
                let decl: String = row.get(2)?;
                let cell_type = if decl.eq_ignore_ascii_case("TEXT") {
                    CellType::ShortString
                } else {
                    CellType::I64
                };
                headers.push((column, cell_type));
            }
        }

        let column_list = headers
            .iter()
            .map(|(c, _)| quoted(c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {column_list} FROM {}", quoted(name)))?;
        let mut rows = stmt.query([])?;
        let mut content: Vec<Vec<CellContent>> = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(headers.len());
            for i in 0..headers.len() {
                let cell = match row.get_ref(i)? {
                    ValueRef::Integer(v) => CellContent::I64(v),
                    ValueRef::Text(bytes) => {
                        CellContent::ShortString(String::from_utf8_lossy(bytes).into_owned())
                    }
                    other => {
                        return Err(BuildError::TypeCast {
                            table: name.to_string(),
                            lexeme: format!("{other:?}"),
                            wanted: "INTEGER or TEXT",
                        })
                    }
                };
                cells.push(cell);
            }
            content.push(cells);
        }

        Ok(Table {
            name: name.to_string(),
            headers: TableHeaders(headers),
            rows: content,
        })
    }

    fn read_key_spec(&self) -> Result<KeySpec> {
        let mut spec = KeySpec::default();
        let declared: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_keys'",
            [],
            |r| r.get(0),
        )?;
        if declared == 0 {
            return Ok(spec);
        }
        let mut stmt = self
            .conn
            .prepare("SELECT tbl, kind, cols, ref_tbl, ref_cols FROM schema_keys")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let tbl: String = row.get(0)?;
            let kind: String = row.get(1)?;
            let cols: String = row.get(2)?;
            match kind.as_str() {
                "pk" => spec.primary.push(PrimaryKey {
                    table: tbl,
                    columns: cols.split(',').map(String::from).collect(),
                }),
                "fk" => spec.foreign.push(ForeignKey {
                    table: tbl,
                    column: cols,
                    ref_table: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    ref_column: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                }),
                _ => {}
            }
        }
        Ok(spec)
    }
}

// === Encrypted target ===

/// Connection to the encrypted relational store. Every column it holds is
/// an opaque BLOB; the builder never sends it a plaintext value, predicate
/// or RID.
pub struct EncStore {
    conn: Connection,
}

impl EncStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(EncStore {
            conn: Connection::open(path)?,
        })
    }

    /// Drops and recreates a table of BLOB columns. Overwrite-on-conflict
    /// semantics: a re-run starts from a clean slate.
    pub fn overwrite_table(&self, name: &str, columns: &[String]) -> Result<()> {
        let cols = columns
            .iter()
            .map(|c| format!("{} BLOB", quoted(c)))
            .collect::<Vec<_>>()
            .join(", ");
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {}", quoted(name)))?;
        self.conn
            .execute_batch(&format!("CREATE TABLE {} ({cols})", quoted(name)))?;
        debug!(table = name, columns = columns.len(), "created encrypted table");
        Ok(())
    }

    /// Batched insert of BLOB rows inside one transaction.
    pub fn insert_rows(
        &mut self,
        name: &str,
        columns: &[String],
        rows: &[Vec<Vec<u8>>],
    ) -> Result<()> {
        let column_list = columns
            .iter()
            .map(|c| quoted(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!(
            "INSERT OR REPLACE INTO {} ({column_list}) VALUES ({placeholders})",
            quoted(name)
        );
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&insert)?;
            for row in rows {
                stmt.execute(params_from_iter(row.iter().map(|b| Value::Blob(b.clone()))))?;
            }
        }
        tx.commit()?;
        info!(table = name, rows = rows.len(), "inserted encrypted rows");
        Ok(())
    }

    /// Requests a secondary index on one column.
    pub fn request_index(&self, table: &str, column: &str, kind: IndexKind) -> Result<()> {
        let index_name = format!("idx_{table}_{column}");
        self.conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quoted(&index_name),
            quoted(table),
            quoted(column)
        ))?;
        debug!(table, column, ?kind, "index requested");
        Ok(())
    }

    /// Refreshes store statistics after a build.
    pub fn analyze(&self) -> Result<()> {
        self.conn.execute_batch("ANALYZE")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::scenario_database;

    #[test]
    fn plaintext_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.db");
        let db = scenario_database();
        PlainStore::open(&path).unwrap().write_database(&db).unwrap();

        let read_back = PlainStore::open_read_only(&path)
            .unwrap()
            .read_database()
            .unwrap();
        assert_eq!(read_back.tables.len(), 2);
        let data2 = read_back.table("data2").unwrap();
        assert_eq!(data2.rows.len(), 4);
        assert_eq!(data2.rows[3][0], CellContent::I64(3));
        assert_eq!(read_back.keys.primary.len(), 2);
        assert_eq!(read_back.keys.foreign.len(), 1);
        read_back.validate().unwrap();
    }

    #[test]
    fn overwrite_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enc.db");
        let columns = vec!["label".to_string(), "value".to_string()];
        let rows = vec![vec![vec![1u8; 32], vec![2u8; 8]]];

        for _ in 0..2 {
            let mut store = EncStore::open(&path).unwrap();
            store.overwrite_table("t_filter", &columns).unwrap();
            store.insert_rows("t_filter", &columns, &rows).unwrap();
            store
                .request_index("t_filter", "label", IndexKind::Hash)
                .unwrap();
            store.analyze().unwrap();
        }

        let conn = Connection::open(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM t_filter", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
