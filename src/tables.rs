use std::collections::HashSet;
use std::fs;
use std::fs::read_to_string;
use std::path::Path;
use std::str::FromStr;

use crate::error::{BuildError, Result};

/// An enum with one variant for each possible type of a cell's content.
#[derive(Debug, Clone, PartialEq)]
pub enum CellType {
    Bool,
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    I64,
    ShortString,
}

impl CellType {
    /// Transforms a `&str` to a `CellType`. Typically used when reading
    /// table headers.
    pub fn parse(str_type: &str) -> Result<Self> {
        match str_type {
            "bool" => Ok(Self::Bool),
            "uint8" => Ok(Self::U8),
            "uint16" => Ok(Self::U16),
            "uint32" => Ok(Self::U32),
            "int8" => Ok(Self::I8),
            "int16" => Ok(Self::I16),
            "int32" => Ok(Self::I32),
            "int64" => Ok(Self::I64),
            "string" => Ok(Self::ShortString),
            other => Err(BuildError::TypeCast {
                table: String::new(),
                lexeme: other.to_string(),
                wanted: "cell type",
            }),
        }
    }
}

/// Holds the content of a given cell.
#[derive(Clone, Debug, PartialEq)]
pub enum CellContent {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    ShortString(String),
}

impl CellContent {
    /// The canonical string form of the value. Partitioning, joining and
    /// predicate encoding all operate on lexemes, so two cells match
    /// exactly when their lexemes do.
    pub fn lexeme(&self) -> String {
        match self {
            Self::Bool(b) => format!("{}", *b as u8),
            Self::U8(u) => format!("{u}"),
            Self::U16(u) => format!("{u}"),
            Self::U32(u) => format!("{u}"),
            Self::I8(i) => format!("{i}"),
            Self::I16(i) => format!("{i}"),
            Self::I32(i) => format!("{i}"),
            Self::I64(i) => format!("{i}"),
            Self::ShortString(s) => s.clone(),
        }
    }

    /// Casts an integer-typed cell to `i64`. Key columns (primary-key
    /// components and join attributes) must be integer-typed.
    pub fn as_long(&self, table: &str) -> Result<i64> {
        match self {
            Self::Bool(b) => Ok(*b as i64),
            Self::U8(u) => Ok(*u as i64),
            Self::U16(u) => Ok(*u as i64),
            Self::U32(u) => Ok(*u as i64),
            Self::I8(i) => Ok(*i as i64),
            Self::I16(i) => Ok(*i as i64),
            Self::I32(i) => Ok(*i as i64),
            Self::I64(i) => Ok(*i),
            Self::ShortString(_) => Err(BuildError::TypeCast {
                table: table.to_string(),
                lexeme: self.lexeme(),
                wanted: "i64",
            }),
        }
    }

    /// Parses a `&str` into a `CellContent` of type `cell_type`.
    pub fn parse(s: &str, cell_type: &CellType, table: &str) -> Result<Self> {
        let cast = |wanted: &'static str| BuildError::TypeCast {
            table: table.to_string(),
            lexeme: s.to_string(),
            wanted,
        };
        match cell_type {
            CellType::Bool => bool::from_str(s).map(Self::Bool).map_err(|_| cast("bool")),
            CellType::U8 => u8::from_str(s).map(Self::U8).map_err(|_| cast("u8")),
            CellType::U16 => u16::from_str(s).map(Self::U16).map_err(|_| cast("u16")),
            CellType::U32 => u32::from_str(s).map(Self::U32).map_err(|_| cast("u32")),
            CellType::I8 => i8::from_str(s).map(Self::I8).map_err(|_| cast("i8")),
            CellType::I16 => i16::from_str(s).map(Self::I16).map_err(|_| cast("i16")),
            CellType::I32 => i32::from_str(s).map(Self::I32).map_err(|_| cast("i32")),
            CellType::I64 => i64::from_str(s).map(Self::I64).map_err(|_| cast("i64")),
            CellType::ShortString => Ok(Self::ShortString(s.to_string())),
        }
    }
}

/// A struct holding a vector of tuples `(column_identifier, data_type)`.
#[derive(Debug, Clone)]
pub struct TableHeaders(pub Vec<(String, CellType)>);

impl TableHeaders {
    /// Given a column identifier, returns its positional index.
    pub fn index_of(&self, table: &str, column: &str) -> Result<usize> {
        self.0
            .iter()
            .position(|(label, _)| label == column)
            .ok_or_else(|| BuildError::NoSuchColumn {
                table: table.to_string(),
                column: column.to_string(),
            })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(label, _)| label.as_str())
    }
}

/// A representation of one plaintext table.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub headers: TableHeaders,
    pub rows: Vec<Vec<CellContent>>,
}

/// A primary-key declaration: one or two component columns.
#[derive(Debug, Clone)]
pub struct PrimaryKey {
    pub table: String,
    pub columns: Vec<String>,
}

/// A foreign-key declaration `table.column -> ref_table.ref_column`.
#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub ref_table: String,
    pub ref_column: String,
}

impl ForeignKey {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }

    pub fn ref_qualified(&self) -> String {
        format!("{}.{}", self.ref_table, self.ref_column)
    }
}

/// The declared key structure of a table set.
#[derive(Debug, Clone, Default)]
pub struct KeySpec {
    pub primary: Vec<PrimaryKey>,
    pub foreign: Vec<ForeignKey>,
}

impl KeySpec {
    pub fn primary_of(&self, table: &str) -> Option<&PrimaryKey> {
        self.primary.iter().find(|pk| pk.table == table)
    }

    /// Columns of `table` that appear on either side of any foreign key.
    pub fn join_columns(&self, table: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        for fk in &self.foreign {
            if fk.table == table {
                out.insert(fk.column.clone());
            }
            if fk.ref_table == table {
                out.insert(fk.ref_column.clone());
            }
        }
        out
    }
}

/// The whole plaintext input: tables plus their key declarations.
#[derive(Debug, Clone)]
pub struct Database {
    pub tables: Vec<Table>,
    pub keys: KeySpec,
}

impl Database {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Validates declarations before any side effect: exactly one primary
    /// key per table with arity at most two, foreign keys that resolve to
    /// existing columns, a declared primary key on every referenced table,
    /// and no reserved `~` in any identifier.
    pub fn validate(&self) -> Result<()> {
        for table in &self.tables {
            if table.name.contains('~') {
                return Err(BuildError::ReservedCharacter {
                    name: table.name.clone(),
                });
            }
            for column in table.headers.column_names() {
                if column.contains('~') {
                    return Err(BuildError::ReservedCharacter {
                        name: format!("{}.{}", table.name, column),
                    });
                }
            }

            let declared: Vec<_> = self
                .keys
                .primary
                .iter()
                .filter(|pk| pk.table == table.name)
                .collect();
            let pk = match declared.as_slice() {
                [] => {
                    return Err(BuildError::MissingPrimaryKey {
                        table: table.name.clone(),
                    })
                }
                [single] => *single,
                _ => {
                    return Err(BuildError::AmbiguousPrimaryKey {
                        table: table.name.clone(),
                    })
                }
            };
            if pk.columns.is_empty() || pk.columns.len() > 2 {
                return Err(BuildError::CompoundKeyArity {
                    table: table.name.clone(),
                    arity: pk.columns.len(),
                });
            }
            for column in &pk.columns {
                table.headers.index_of(&table.name, column)?;
            }
        }

        for fk in &self.keys.foreign {
            let table = self
                .tables
                .iter()
                .find(|t| t.name == fk.table)
                .ok_or_else(|| BuildError::UnknownTable {
                    table: fk.table.clone(),
                })?;
            table.headers.index_of(&fk.table, &fk.column)?;

            let ref_table = self
                .tables
                .iter()
                .find(|t| t.name == fk.ref_table)
                .ok_or_else(|| BuildError::UnknownTable {
                    table: fk.ref_table.clone(),
                })?;
            ref_table.headers.index_of(&fk.ref_table, &fk.ref_column)?;

            // the referenced side must carry a declared primary key
            if self.keys.primary_of(&fk.ref_table).is_none() {
                return Err(BuildError::MissingPrimaryKey {
                    table: fk.ref_table.clone(),
                });
            }
        }
        Ok(())
    }
}

fn read_headers(path: &Path) -> Result<TableHeaders> {
    let header = read_to_string(path)?
        .lines()
        .map(String::from)
        .next()
        .unwrap_or_default();
    let mut result: Vec<(String, CellType)> = Vec::new();
    for column in header.split(',') {
        let mut split = column.split(':');
        if let (Some(label), Some(str_type)) = (split.next(), split.next()) {
            result.push((label.to_string(), CellType::parse(str_type)?));
        }
    }
    Ok(TableHeaders(result))
}

/// Loads every `<name>.csv` in a directory. The first line of each file
/// declares `column:type` pairs; remaining lines are rows.
pub fn load_tables(dir: &Path) -> Result<Vec<Table>> {
    let mut result: Vec<Table> = Vec::new();
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|p| p.extension().map(|e| e == "csv").unwrap_or(false))
        .collect();
    paths.sort();

    for table_path in paths {
        let table_name: String = table_path
            .file_stem()
            .and_then(|f| f.to_str())
            .map(String::from)
            .unwrap_or_default();
        let headers = read_headers(&table_path)?;
        let mut rdr = csv::Reader::from_path(&table_path)?;
        let mut rows: Vec<Vec<CellContent>> = Vec::new();
        for entry in rdr.records() {
            let entry = entry?;
            let mut row: Vec<CellContent> = Vec::with_capacity(headers.0.len());
            for (content, (_label, cell_type)) in entry.iter().zip(headers.0.iter()) {
                row.push(CellContent::parse(content, cell_type, &table_name)?);
            }
            rows.push(row);
        }
        result.push(Table {
            name: table_name,
            headers,
            rows,
        });
    }
    Ok(result)
}

/// Parses a `keys.txt` declaration file. One declaration per line:
///
/// ```text
/// pk data2 a
/// pk points x,y
/// fk data2.b -> data3.c
/// ```
///
/// Blank lines and `#` comments are skipped.
pub fn load_key_spec(path: &Path) -> Result<KeySpec> {
    let mut spec = KeySpec::default();
    for line in read_to_string(path)?.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        match words.next() {
            Some("pk") => {
                if let (Some(table), Some(cols)) = (words.next(), words.next()) {
                    spec.primary.push(PrimaryKey {
                        table: table.to_string(),
                        columns: cols.split(',').map(String::from).collect(),
                    });
                }
            }
            Some("fk") => {
                let (from, arrow, to) = (words.next(), words.next(), words.next());
                if let (Some(from), Some("->"), Some(to)) = (from, arrow, to) {
                    let parse_side = |s: &str| -> Option<(String, String)> {
                        let mut split = s.split('.');
                        Some((split.next()?.to_string(), split.next()?.to_string()))
                    };
                    if let (Some((table, column)), Some((ref_table, ref_column))) =
                        (parse_side(from), parse_side(to))
                    {
                        spec.foreign.push(ForeignKey {
                            table,
                            column,
                            ref_table,
                            ref_column,
                        });
                    }
                }
            }
            _ => {}
        }
    }
    Ok(spec)
}

#[cfg(test)]
pub(crate) fn scenario_database() -> Database {
    let data2 = Table {
        name: "data2".into(),
        headers: TableHeaders(vec![
            ("a".into(), CellType::I64),
            ("b".into(), CellType::I64),
        ]),
        rows: vec![
            vec![CellContent::I64(1), CellContent::I64(1)],
            vec![CellContent::I64(1), CellContent::I64(2)],
            vec![CellContent::I64(2), CellContent::I64(3)],
            vec![CellContent::I64(3), CellContent::I64(4)],
        ],
    };
    let data3 = Table {
        name: "data3".into(),
        headers: TableHeaders(vec![
            ("c".into(), CellType::I64),
            ("d".into(), CellType::I64),
        ]),
        rows: vec![
            vec![CellContent::I64(1), CellContent::I64(1)],
            vec![CellContent::I64(1), CellContent::I64(2)],
            vec![CellContent::I64(2), CellContent::I64(3)],
        ],
    };
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
    fn validate_accepts_scenario_database() {
        scenario_database().validate().unwrap();
    }

    #[test]
    fn validate_rejects_missing_primary_key() {
        let mut db = scenario_database();
        db.keys.primary.retain(|pk| pk.table != "data3");
        match db.validate() {
            Err(BuildError::MissingPrimaryKey { table }) => assert_eq!(table, "data3"),
            other => panic!("expected MissingPrimaryKey, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_wide_compound_keys() {
        let mut db = scenario_database();
        db.keys.primary[0].columns = vec!["a".into(), "b".into(), "a".into()];
        assert!(matches!(
            db.validate(),
            Err(BuildError::CompoundKeyArity { arity: 3, .. })
        ));
    }

    #[test]
    fn validate_rejects_reserved_separator() {
        let mut db = scenario_database();
        db.tables[0].name = "da~ta".into();
        assert!(matches!(
            db.validate(),
            Err(BuildError::ReservedCharacter { .. })
        ));
    }

    #[test]
    fn join_columns_cover_both_sides() {
        let db = scenario_database();
        assert_eq!(
            db.keys.join_columns("data2"),
            HashSet::from(["b".to_string()])
        );
        assert_eq!(
            db.keys.join_columns("data3"),
            HashSet::from(["c".to_string()])
        );
    }

    #[test]
    fn csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("data2.csv"),
            "a:int64,b:int64\n1,1\n1,2\n2,3\n3,4\n",
        )
        .unwrap();
        let tables = load_tables(dir.path()).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "data2");
        assert_eq!(tables[0].rows.len(), 4);
        assert_eq!(tables[0].rows[2][1], CellContent::I64(3));
    }

    #[test]
    fn key_spec_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.txt");
        std::fs::write(
            &path,
            "# keys\npk data2 a\npk points x,y\nfk data2.b -> data3.c\n",
        )
        .unwrap();
        let spec = load_key_spec(&path).unwrap();
        assert_eq!(spec.primary.len(), 2);
        assert_eq!(spec.primary[1].columns, vec!["x", "y"]);
        assert_eq!(spec.foreign.len(), 1);
        assert_eq!(spec.foreign[0].qualified(), "data2.b");
        assert_eq!(spec.foreign[0].ref_qualified(), "data3.c");
    }
}
