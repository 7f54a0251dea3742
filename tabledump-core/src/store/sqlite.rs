/*!
SQLite table store backed by `rusqlite`.

Schema capture reads the `CREATE` statements from `sqlite_master`; column
metadata comes from `PRAGMA table_info`, with the declared type mapped onto
a [`ColumnKind`] using SQLite's affinity rules.
*/

use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use super::{integer_primary_key, Column, ColumnKind, MigrationRunner, TableStore};
use crate::codec::{Row, Value};
use crate::{DumpError, Result};

static DECLARED_LIMIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(\s*(\d+)").expect("declared limit regex is valid"));

/// Upper bound on bound parameters per statement.
const MAX_VARIABLES: usize = 32_766;

/// Table store over one SQLite connection.
pub struct SqliteTableStore {
    conn: Connection,
}

impl SqliteTableStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Connection::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Connection::open_in_memory()?))
    }

    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Migration runner sharing this connection
    pub fn migrations(&self) -> SqliteMigrations<'_> {
        SqliteMigrations { store: self }
    }

    fn has_table(&self, table: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn query_rows(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let mut stmt = self.conn.prepare(sql)?;
        let width = stmt.column_count();
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            (0..width)
                .map(|i| row.get::<_, SqlValue>(i).map(from_sql))
                .collect::<rusqlite::Result<Row>>()
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<Row>>>()?)
    }

    fn drop_user_tables(&self) -> Result<()> {
        let views: Vec<String> = self.names_of("view")?;
        for view in views {
            self.conn
                .execute_batch(&format!("DROP VIEW IF EXISTS {}", quote(&view)))?;
        }
        for table in self.table_names()? {
            self.conn
                .execute_batch(&format!("DROP TABLE IF EXISTS {}", quote(&table)))?;
        }
        Ok(())
    }

    fn names_of(&self, kind: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = ?1 AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt.query_map([kind], |row| row.get(0))?;
        Ok(names.collect::<rusqlite::Result<Vec<String>>>()?)
    }
}

impl TableStore for SqliteTableStore {
    fn table_names(&self) -> Result<Vec<String>> {
        self.names_of("table")
    }

    fn row_count(&self, table: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn columns(&self, table: &str) -> Result<Vec<Column>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote(table)))?;
        let columns = stmt.query_map([], |row| {
            let name: String = row.get("name")?;
            let declared: String = row.get::<_, Option<String>>("type")?.unwrap_or_default();
            let not_null: bool = row.get("notnull")?;
            let pk: i64 = row.get("pk")?;
            Ok((name, declared, not_null, pk > 0))
        })?;

        let mut result = Vec::new();
        for column in columns {
            let (name, declared, not_null, pk) = column?;
            let mut column = Column::new(name, kind_of(&declared));
            column.limit = declared_limit(&declared);
            column.primary_key = pk;
            column.nullable = !not_null && !pk;
            result.push(column);
        }
        if result.is_empty() {
            return Err(DumpError::store(format!("no such table: {table}")));
        }
        Ok(result)
    }

    fn select_chunk(
        &self,
        table: &str,
        pk_column: &str,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let limit = SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX));
        match after {
            Some(after) => self.query_rows(
                &format!(
                    "SELECT * FROM {table} WHERE {pk} > ?1 ORDER BY {pk} LIMIT ?2",
                    table = quote(table),
                    pk = quote(pk_column)
                ),
                &[SqlValue::Integer(after), limit],
            ),
            None => self.query_rows(
                &format!(
                    "SELECT * FROM {table} ORDER BY {pk} LIMIT ?1",
                    table = quote(table),
                    pk = quote(pk_column)
                ),
                &[limit],
            ),
        }
    }

    fn select_all(&self, table: &str) -> Result<Vec<Row>> {
        let columns = self.columns(table)?;
        let order = match integer_primary_key(&columns) {
            Some(pk) => format!(" ORDER BY {}", quote(&pk.name)),
            None => String::new(),
        };
        self.query_rows(&format!("SELECT * FROM {}{order}", quote(table)), &[])
    }

    fn insert_batch(&self, table: &str, columns: &[String], rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        if let Some(bad) = rows.iter().find(|row| row.len() != columns.len()) {
            return Err(DumpError::store(format!(
                "{table}: {} columns but {} values",
                columns.len(),
                bad.len()
            )));
        }
        let column_list = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
        let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
        let per_statement = (MAX_VARIABLES / columns.len().max(1)).max(1);

        let tx = self.conn.unchecked_transaction()?;
        for slice in rows.chunks(per_statement) {
            let sql = format!(
                "INSERT INTO {} ({column_list}) VALUES {}",
                quote(table),
                vec![placeholders.as_str(); slice.len()].join(", ")
            );
            let params: Vec<SqlValue> = slice.iter().flatten().map(to_sql).collect();
            tx.execute(&sql, params_from_iter(params.iter()))?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_row(&self, table: &str, columns: &[String], row: &Row) -> Result<()> {
        self.insert_batch(table, columns, std::slice::from_ref(row))
    }

    fn delete_all(&self, table: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("DELETE FROM {}", quote(table)))?;
        Ok(())
    }

    fn schema_definition(&self) -> Result<Vec<u8>> {
        let mut stmt = self.conn.prepare(
            "SELECT sql FROM sqlite_master
             WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%'
             ORDER BY CASE type WHEN 'table' THEN 0 WHEN 'index' THEN 1 ELSE 2 END, name",
        )?;
        let statements = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut schema = String::new();
        for statement in statements {
            schema.push_str(&statement?);
            schema.push_str(";\n");
        }
        Ok(schema.into_bytes())
    }

    fn load_schema_definition(&self, definition: &[u8]) -> Result<()> {
        let sql = std::str::from_utf8(definition)
            .map_err(|e| DumpError::store(format!("schema definition is not UTF-8: {e}")))?;
        self.drop_user_tables()?;
        self.conn.execute_batch(sql)?;
        debug!(bytes = definition.len(), "schema loaded");
        Ok(())
    }

    fn supports_sequence_reset(&self) -> bool {
        true
    }

    fn reset_sequence(&self, table: &str) -> Result<()> {
        if !self.has_table("sqlite_sequence")? {
            return Ok(());
        }
        let columns = self.columns(table)?;
        let Some(pk) = integer_primary_key(&columns) else {
            return Ok(());
        };
        self.conn.execute(
            &format!(
                "UPDATE sqlite_sequence SET seq = (SELECT COALESCE(MAX({pk}), 0) FROM {table}) WHERE name = ?1",
                pk = quote(&pk.name),
                table = quote(table)
            ),
            [table],
        )?;
        Ok(())
    }
}

/// Migration bookkeeping over the `schema_migrations` table.
///
/// SQLite databases carry no down migrations, so every rollback is
/// irreversible.
pub struct SqliteMigrations<'a> {
    store: &'a SqliteTableStore,
}

impl MigrationRunner for SqliteMigrations<'_> {
    fn applied_versions(&self) -> Result<Vec<String>> {
        if !self.store.has_table(self.versions_table())? {
            return Ok(Vec::new());
        }
        let rows = self.store.query_rows(
            &format!("SELECT version FROM {} ORDER BY version", quote(self.versions_table())),
            &[],
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .filter(|v| !v.is_null())
            .map(|v| v.to_string())
            .collect())
    }

    fn rollback(&self, version: &str) -> Result<()> {
        Err(DumpError::Irreversible {
            version: version.to_string(),
        })
    }

    fn reset_schema(&self) -> Result<()> {
        self.store.drop_user_tables()
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn kind_of(declared: &str) -> ColumnKind {
    let upper = declared.to_uppercase();
    let has = |needle: &str| upper.contains(needle);
    if has("BOOL") {
        ColumnKind::Boolean
    } else if has("INT") {
        ColumnKind::Integer
    } else if has("DATETIME") || has("TIMESTAMP") {
        ColumnKind::Timestamp
    } else if has("DATE") {
        ColumnKind::Date
    } else if has("TIME") {
        ColumnKind::Time
    } else if has("CHAR") || has("STRING") {
        ColumnKind::String
    } else if has("CLOB") || has("TEXT") {
        ColumnKind::Text
    } else if has("REAL") || has("FLOA") || has("DOUB") {
        ColumnKind::Float
    } else if has("DEC") || has("NUMERIC") {
        ColumnKind::Decimal
    } else {
        ColumnKind::Binary
    }
}

fn declared_limit(declared: &str) -> Option<u64> {
    DECLARED_LIMIT
        .captures(declared)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Decimal(d) => SqlValue::Text(d.clone()),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
        Value::Date(d) => SqlValue::Text(format_date(d)),
        Value::Time(t) => SqlValue::Text(format_time(t)),
        Value::Timestamp(ts) => SqlValue::Text(format_timestamp(ts)),
    }
}

fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Int(i),
        SqlValue::Real(f) => Value::Float(f),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Bytes(b),
    }
}

fn format_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

fn format_time(time: &NaiveTime) -> String {
    time.format("%H:%M:%S%.f").to_string()
}
