/*!
In-memory table store.

Tables live behind a shared handle, so a clone of the store observes every
change made through another clone. Column constraints (arity, NOT NULL,
unique primary key, value type) are enforced, which makes insert failures
behave like a real backend.
*/

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{integer_primary_key, Column, ColumnKind, MigrationRunner, TableStore};
use crate::codec::{Row, Value};
use crate::{DumpError, Result};

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<Column>,
    rows: Vec<Row>,
    sequence: i64,
}

impl MemoryTable {
    fn pk_index(&self) -> Option<usize> {
        let key = integer_primary_key(&self.columns)?;
        self.columns.iter().position(|c| c.name == key.name)
    }

    /// Reorder a row given in `columns` order into table order.
    fn arrange(&self, table: &str, columns: &[String], row: &Row) -> Result<Row> {
        if columns.len() != row.len() {
            return Err(DumpError::store(format!(
                "{table}: {} columns but {} values",
                columns.len(),
                row.len()
            )));
        }
        let mut arranged = vec![Value::Null; self.columns.len()];
        for (name, value) in columns.iter().zip(row) {
            let idx = self
                .columns
                .iter()
                .position(|c| &c.name == name)
                .ok_or_else(|| DumpError::store(format!("{table}: no column {name}")))?;
            arranged[idx] = value.clone();
        }
        for (column, value) in self.columns.iter().zip(&arranged) {
            if value.is_null() && !column.nullable {
                return Err(DumpError::store(format!(
                    "{table}: NOT NULL constraint failed on {}",
                    column.name
                )));
            }
            if !accepts(column.kind, value) {
                return Err(DumpError::store(format!(
                    "{table}: value {value} does not fit column {}",
                    column.name
                )));
            }
        }
        Ok(arranged)
    }

    fn ordered_rows(&self) -> Vec<Row> {
        let mut rows = self.rows.clone();
        if let Some(pk) = self.pk_index() {
            rows.sort_by_key(|row| row[pk].as_i64());
        }
        rows
    }
}

fn accepts(kind: ColumnKind, value: &Value) -> bool {
    matches!(
        (kind, value),
        (_, Value::Null)
            | (ColumnKind::Integer, Value::Int(_))
            | (ColumnKind::Float, Value::Float(_) | Value::Int(_))
            | (ColumnKind::Decimal, Value::Decimal(_) | Value::Int(_))
            | (ColumnKind::String | ColumnKind::Text, Value::Text(_))
            | (ColumnKind::Binary, Value::Bytes(_))
            | (ColumnKind::Boolean, Value::Bool(_))
            | (ColumnKind::Date, Value::Date(_))
            | (ColumnKind::Time, Value::Time(_))
            | (ColumnKind::Timestamp, Value::Timestamp(_))
    )
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, MemoryTable>,
}

/// Table store kept entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryTableStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| DumpError::store("memory store lock poisoned"))
    }

    /// Create (or replace) an empty table
    pub fn create_table(&self, name: &str, columns: Vec<Column>) -> Result<()> {
        self.lock()?.tables.insert(
            name.to_string(),
            MemoryTable {
                columns,
                ..MemoryTable::default()
            },
        );
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.lock()?.tables.remove(name);
        Ok(())
    }

    /// Rows in primary key order (or insertion order without a key)
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        self.select_all(table)
    }

    /// Current auto-increment value
    pub fn sequence(&self, table: &str) -> Result<i64> {
        let inner = self.lock()?;
        Ok(table_ref(&inner, table)?.sequence)
    }

    fn insert_arranged(&self, table: &str, rows: Vec<Row>) -> Result<()> {
        let mut inner = self.lock()?;
        let target = table_mut(&mut inner, table)?;
        if let Some(pk) = target.pk_index() {
            let mut seen: HashSet<i64> = target.rows.iter().filter_map(|r| r[pk].as_i64()).collect();
            for row in &rows {
                if let Some(key) = row[pk].as_i64() {
                    if !seen.insert(key) {
                        return Err(DumpError::store(format!(
                            "{table}: UNIQUE constraint failed on primary key {key}"
                        )));
                    }
                }
            }
            for row in &rows {
                if let Some(key) = row[pk].as_i64() {
                    target.sequence = target.sequence.max(key);
                }
            }
        }
        target.rows.extend(rows);
        Ok(())
    }
}

fn table_ref<'a>(inner: &'a Inner, table: &str) -> Result<&'a MemoryTable> {
    inner
        .tables
        .get(table)
        .ok_or_else(|| DumpError::store(format!("no such table: {table}")))
}

fn table_mut<'a>(inner: &'a mut Inner, table: &str) -> Result<&'a mut MemoryTable> {
    inner
        .tables
        .get_mut(table)
        .ok_or_else(|| DumpError::store(format!("no such table: {table}")))
}

impl TableStore for MemoryTableStore {
    fn table_names(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.tables.keys().cloned().collect())
    }

    fn row_count(&self, table: &str) -> Result<u64> {
        let inner = self.lock()?;
        Ok(table_ref(&inner, table)?.rows.len() as u64)
    }

    fn columns(&self, table: &str) -> Result<Vec<Column>> {
        let inner = self.lock()?;
        Ok(table_ref(&inner, table)?.columns.clone())
    }

    fn select_chunk(
        &self,
        table: &str,
        pk_column: &str,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let inner = self.lock()?;
        let source = table_ref(&inner, table)?;
        let pk = source
            .columns
            .iter()
            .position(|c| c.name == pk_column)
            .ok_or_else(|| DumpError::store(format!("{table}: no column {pk_column}")))?;
        let mut rows: Vec<Row> = source
            .rows
            .iter()
            .filter(|row| match (after, row[pk].as_i64()) {
                (Some(after), Some(key)) => key > after,
                (None, _) => true,
                (Some(_), None) => false,
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| row[pk].as_i64());
        rows.truncate(limit);
        Ok(rows)
    }

    fn select_all(&self, table: &str) -> Result<Vec<Row>> {
        let inner = self.lock()?;
        Ok(table_ref(&inner, table)?.ordered_rows())
    }

    fn insert_batch(&self, table: &str, columns: &[String], rows: &[Row]) -> Result<()> {
        let arranged = {
            let inner = self.lock()?;
            let target = table_ref(&inner, table)?;
            rows.iter()
                .map(|row| target.arrange(table, columns, row))
                .collect::<Result<Vec<Row>>>()?
        };
        self.insert_arranged(table, arranged)
    }

    fn insert_row(&self, table: &str, columns: &[String], row: &Row) -> Result<()> {
        self.insert_batch(table, columns, std::slice::from_ref(row))
    }

    fn delete_all(&self, table: &str) -> Result<()> {
        let mut inner = self.lock()?;
        table_mut(&mut inner, table)?.rows.clear();
        Ok(())
    }

    fn schema_definition(&self) -> Result<Vec<u8>> {
        let inner = self.lock()?;
        let schema: BTreeMap<&String, &Vec<Column>> = inner
            .tables
            .iter()
            .map(|(name, table)| (name, &table.columns))
            .collect();
        Ok(serde_json::to_vec_pretty(&schema)?)
    }

    fn load_schema_definition(&self, definition: &[u8]) -> Result<()> {
        let schema: BTreeMap<String, Vec<Column>> = serde_json::from_slice(definition)?;
        let mut inner = self.lock()?;
        inner.tables = schema
            .into_iter()
            .map(|(name, columns)| {
                (
                    name,
                    MemoryTable {
                        columns,
                        ..MemoryTable::default()
                    },
                )
            })
            .collect();
        Ok(())
    }

    fn supports_sequence_reset(&self) -> bool {
        true
    }

    fn reset_sequence(&self, table: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let target = table_mut(&mut inner, table)?;
        if let Some(pk) = target.pk_index() {
            target.sequence = target
                .rows
                .iter()
                .filter_map(|row| row[pk].as_i64())
                .max()
                .unwrap_or(0);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MigrationState {
    applied: BTreeSet<String>,
    irreversible: BTreeSet<String>,
    rolled_back: Vec<String>,
    resets: usize,
}

/// Migration runner over an in-memory version list.
#[derive(Debug, Clone, Default)]
pub struct MemoryMigrations {
    store: MemoryTableStore,
    state: Arc<Mutex<MigrationState>>,
}

impl MemoryMigrations {
    /// Runner whose schema resets clear `store`
    pub fn new(store: MemoryTableStore) -> Self {
        Self {
            store,
            state: Arc::default(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MigrationState>> {
        self.state
            .lock()
            .map_err(|_| DumpError::store("migration state lock poisoned"))
    }

    pub fn apply<S: Into<String>>(&self, version: S) -> Result<()> {
        self.lock()?.applied.insert(version.into());
        Ok(())
    }

    /// Mark a version as impossible to roll back
    pub fn mark_irreversible<S: Into<String>>(&self, version: S) -> Result<()> {
        self.lock()?.irreversible.insert(version.into());
        Ok(())
    }

    /// Versions rolled back so far, in call order
    pub fn rolled_back(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.rolled_back.clone())
    }

    pub fn resets(&self) -> Result<usize> {
        Ok(self.lock()?.resets)
    }
}

impl MigrationRunner for MemoryMigrations {
    fn applied_versions(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.applied.iter().cloned().collect())
    }

    fn rollback(&self, version: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state.irreversible.contains(version) {
            return Err(DumpError::Irreversible {
                version: version.to_string(),
            });
        }
        state.applied.remove(version);
        state.rolled_back.push(version.to_string());
        Ok(())
    }

    fn reset_schema(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.applied.clear();
        state.resets += 1;
        for table in self.store.table_names()? {
            self.store.drop_table(&table)?;
        }
        Ok(())
    }
}
