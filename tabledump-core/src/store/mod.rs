/*!
Table store adapters.

This module defines the relational backend abstraction (port) the archive
engine drives, and concrete implementations (adapters). The transfer engine
only sees these traits, so backends can be swapped without touching the
archive logic.
*/

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::codec::{Row, Value};
use crate::Result;

pub use memory::{MemoryMigrations, MemoryTableStore};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteMigrations, SqliteTableStore};

/// Table listing applied migration versions in its first column.
pub const DEFAULT_VERSIONS_TABLE: &str = "schema_migrations";

/// Logical column type, as far as dumping is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    Integer,
    Float,
    Decimal,
    String,
    Text,
    Binary,
    Boolean,
    Date,
    Time,
    Timestamp,
}

impl ColumnKind {
    /// Coerce a raw backend value into this column's type.
    ///
    /// Values that cannot be coerced are passed through unchanged.
    pub fn cast(&self, value: Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (ColumnKind::Integer, Value::Text(s)) => match s.trim().parse() {
                Ok(i) => Value::Int(i),
                Err(_) => Value::Text(s),
            },
            (ColumnKind::Integer, Value::Bool(b)) => Value::Int(i64::from(b)),
            (ColumnKind::Float, Value::Int(i)) => Value::Float(i as f64),
            (ColumnKind::Float, Value::Text(s)) => match s.trim().parse() {
                Ok(f) => Value::Float(f),
                Err(_) => Value::Text(s),
            },
            (ColumnKind::Decimal, Value::Int(i)) => Value::Decimal(i.to_string()),
            (ColumnKind::Decimal, Value::Float(f)) => Value::Decimal(f.to_string()),
            (ColumnKind::Decimal, Value::Text(s)) => Value::Decimal(s),
            (ColumnKind::Boolean, Value::Int(i)) => Value::Bool(i != 0),
            (ColumnKind::Boolean, Value::Text(s)) => match s.trim().to_lowercase().as_str() {
                "t" | "true" | "1" | "yes" => Value::Bool(true),
                "f" | "false" | "0" | "no" => Value::Bool(false),
                _ => Value::Text(s),
            },
            (ColumnKind::Binary, Value::Text(s)) => Value::Bytes(s.into_bytes()),
            (ColumnKind::String | ColumnKind::Text, Value::Bytes(b)) => {
                match String::from_utf8(b) {
                    Ok(s) => Value::Text(s),
                    Err(e) => Value::Bytes(e.into_bytes()),
                }
            }
            (ColumnKind::Date, Value::Text(s)) => match NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
                Ok(d) => Value::Date(d),
                Err(_) => Value::Text(s),
            },
            (ColumnKind::Time, Value::Text(s)) => match NaiveTime::parse_from_str(&s, "%H:%M:%S%.f")
            {
                Ok(t) => Value::Time(t),
                Err(_) => Value::Text(s),
            },
            (ColumnKind::Timestamp, Value::Text(s)) => match parse_timestamp(&s) {
                Some(ts) => Value::Timestamp(ts),
                None => Value::Text(s),
            },
            (_, value) => value,
        }
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s.trim(), format).ok())
}

/// Column metadata reported by a table store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    /// Declared length limit, if any
    pub limit: Option<u64>,
    pub primary_key: bool,
    pub nullable: bool,
}

impl Column {
    pub fn new<S: Into<String>>(name: S, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            limit: None,
            primary_key: false,
            nullable: true,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Mark as the (non-null) primary key
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// The single integer primary key column of a table, if it has one.
pub fn integer_primary_key(columns: &[Column]) -> Option<&Column> {
    let mut keys = columns.iter().filter(|c| c.primary_key);
    match (keys.next(), keys.next()) {
        (Some(key), None) if key.kind == ColumnKind::Integer => Some(key),
        _ => None,
    }
}

/// Relational backend the transfer engine reads from and writes into.
///
/// Rows are positional and follow the order of [`TableStore::columns`].
pub trait TableStore {
    /// Names of all user tables
    fn table_names(&self) -> Result<Vec<String>>;

    fn row_count(&self, table: &str) -> Result<u64>;

    fn columns(&self, table: &str) -> Result<Vec<Column>>;

    /// Up to `limit` rows with `pk_column > after`, ordered by `pk_column`
    /// ascending. `after == None` starts from the lowest key.
    fn select_chunk(
        &self,
        table: &str,
        pk_column: &str,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Every row of the table in one pass
    fn select_all(&self, table: &str) -> Result<Vec<Row>>;

    /// One multi-row insert. Any error means nothing from this batch was kept.
    fn insert_batch(&self, table: &str, columns: &[String], rows: &[Row]) -> Result<()>;

    fn insert_row(&self, table: &str, columns: &[String], row: &Row) -> Result<()>;

    fn delete_all(&self, table: &str) -> Result<()>;

    /// Opaque schema definition for the `schema.rb` entry
    fn schema_definition(&self) -> Result<Vec<u8>>;

    /// Recreate the schema from a definition captured by [`schema_definition`].
    ///
    /// [`schema_definition`]: TableStore::schema_definition
    fn load_schema_definition(&self, definition: &[u8]) -> Result<()>;

    /// Coerce a raw value read from `column` into its declared type
    fn cast(&self, column: &Column, value: Value) -> Value {
        column.kind.cast(value)
    }

    /// Whether [`TableStore::reset_sequence`] does anything
    fn supports_sequence_reset(&self) -> bool {
        false
    }

    /// Align the auto-increment sequence with the highest stored key
    fn reset_sequence(&self, _table: &str) -> Result<()> {
        Ok(())
    }
}

/// Schema migration bookkeeping of the live database.
pub trait MigrationRunner {
    /// Table whose first column lists applied versions
    fn versions_table(&self) -> &str {
        DEFAULT_VERSIONS_TABLE
    }

    fn applied_versions(&self) -> Result<Vec<String>>;

    /// Roll back one version; `DumpError::Irreversible` if it cannot be undone
    fn rollback(&self, version: &str) -> Result<()>;

    /// Drop and recreate the whole schema
    fn reset_schema(&self) -> Result<()>;
}
