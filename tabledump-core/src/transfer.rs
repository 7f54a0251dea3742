/*!
Batch transfer engine.

Moves rows between a [`TableStore`] and `<table>.dump` record streams.

Reading a table pages through it by integer primary key when the table is
larger than one chunk, and fetches it in one pass otherwise. Restoring reads
fixed-size batches and issues one multi-row insert per batch; a batch the
store refuses is retried row by row so one bad row never costs its
neighbours.
*/

use std::io::{Read, Write};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::codec::{RecordReader, RecordWriter, Row};
use crate::config::TransferSettings;
use crate::store::{integer_primary_key, Column, ColumnKind, TableStore};
use crate::{DumpError, Result};

#[cfg(feature = "metrics")]
use crate::observability::DumpMetrics;

/// Limit assumed for a column that declares none.
const DEFAULT_COLUMN_LIMIT: u64 = 10;

/// Rows per read chunk for a table with these columns.
///
/// Text and string columns count as the square root of their limit, every
/// other column as its limit (default 10). The chunk aims at
/// `target_chunk_bytes` and is clamped to `min_chunk..=max_chunk`.
pub fn chunk_size(columns: &[Column], settings: &TransferSettings) -> usize {
    let row_bytes: f64 = columns
        .iter()
        .map(|column| {
            let limit = column.limit.unwrap_or(DEFAULT_COLUMN_LIMIT) as f64;
            match column.kind {
                ColumnKind::Text | ColumnKind::String => limit.sqrt(),
                _ => limit,
            }
        })
        .sum();
    let rows = settings.target_chunk_bytes as f64 / row_bytes.max(1.0);
    (rows.round() as usize).clamp(settings.min_chunk, settings.max_chunk)
}

/// How a table's rows are fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iteration {
    /// Ascending pages of `size` rows keyed on `pk`
    Chunked { pk: String, size: usize },
    SinglePass,
}

/// Pick the iteration strategy for a table of `row_count` rows.
pub fn plan_iteration(columns: &[Column], row_count: u64, settings: &TransferSettings) -> Iteration {
    match integer_primary_key(columns) {
        Some(pk) => {
            let size = chunk_size(columns, settings);
            if row_count > size as u64 {
                Iteration::Chunked {
                    pk: pk.name.clone(),
                    size,
                }
            } else {
                Iteration::SinglePass
            }
        }
        None => Iteration::SinglePass,
    }
}

/// Feed every row of `table` to `visit`, one chunk at a time.
///
/// Returns the number of rows visited.
pub fn for_each_chunk<S, F>(
    store: &S,
    table: &str,
    columns: &[Column],
    iteration: &Iteration,
    mut visit: F,
) -> Result<u64>
where
    S: TableStore + ?Sized,
    F: FnMut(Vec<Row>) -> Result<()>,
{
    match iteration {
        Iteration::SinglePass => {
            let rows = store.select_all(table)?;
            let count = rows.len() as u64;
            visit(rows)?;
            Ok(count)
        }
        Iteration::Chunked { pk, size } => {
            let pk_index = columns
                .iter()
                .position(|c| &c.name == pk)
                .ok_or_else(|| DumpError::store(format!("{table}: no column {pk}")))?;
            let mut after = None;
            let mut count = 0;
            loop {
                let chunk = store.select_chunk(table, pk, after, *size)?;
                if chunk.is_empty() {
                    break;
                }
                let full = chunk.len() >= *size;
                let last = chunk.last().and_then(|row| row[pk_index].as_i64());
                count += chunk.len() as u64;
                debug!(table, rows = chunk.len(), after = ?after, "chunk read");
                visit(chunk)?;
                match last {
                    Some(key) if full => after = Some(key),
                    Some(_) => break,
                    None => {
                        return Err(DumpError::store(format!(
                            "{table}: primary key {pk} is not an integer"
                        )))
                    }
                }
            }
            Ok(count)
        }
    }
}

/// Writes tables into record streams.
pub struct TableDumper<'a, S: TableStore + ?Sized> {
    store: &'a S,
    settings: &'a TransferSettings,
}

impl<'a, S: TableStore + ?Sized> TableDumper<'a, S> {
    pub fn new(store: &'a S, settings: &'a TransferSettings) -> Self {
        Self { store, settings }
    }

    /// Write the column header and every cast row of `table` to `out`.
    ///
    /// Returns the number of rows written.
    pub fn dump<W: Write>(&self, table: &str, out: W) -> Result<u64> {
        let started = Instant::now();
        let columns = self.store.columns(table)?;
        let row_count = self.store.row_count(table)?;
        let iteration = plan_iteration(&columns, row_count, self.settings);
        info!(table, rows = row_count, strategy = ?iteration, "dumping table");

        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let mut writer = RecordWriter::new(out, &names)?;
        for_each_chunk(self.store, table, &columns, &iteration, |rows| {
            for row in rows {
                let row: Row = row
                    .into_iter()
                    .zip(&columns)
                    .map(|(value, column)| self.store.cast(column, value))
                    .collect();
                writer.write_row(&row)?;
            }
            Ok(())
        })?;
        let written = writer.rows_written();
        writer.finish()?;

        #[cfg(feature = "metrics")]
        if let Some(metrics) = DumpMetrics::global() {
            metrics.rows_dumped_total.inc_by(written as f64);
            metrics.table_seconds.observe(started.elapsed().as_secs_f64());
        }
        debug!(table, rows = written, elapsed_ms = started.elapsed().as_millis() as u64, "table dumped");
        Ok(written)
    }
}

/// Result of one multi-row insert attempt.
#[derive(Debug)]
pub enum BatchOutcome {
    Inserted,
    /// The store refused the batch; retry it row by row
    Failed(DumpError),
}

/// A row that could not be inserted even on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    /// Zero-based position in the table dump
    pub row: usize,
    pub reason: String,
}

/// Outcome of restoring one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRestoreReport {
    pub table: String,
    pub rows_restored: u64,
    pub rejected: Vec<RejectedRow>,
    /// Batches that fell back to single-row inserts
    pub fallbacks: usize,
}

/// Replays record streams into a table store.
pub struct TableLoader<'a, S: TableStore + ?Sized> {
    store: &'a S,
    settings: &'a TransferSettings,
    strict_rows: bool,
    reset_sequences: bool,
}

impl<'a, S: TableStore + ?Sized> TableLoader<'a, S> {
    pub fn new(store: &'a S, settings: &'a TransferSettings, strict_rows: bool) -> Self {
        Self {
            store,
            settings,
            strict_rows,
            reset_sequences: store.supports_sequence_reset(),
        }
    }

    /// One multi-row insert, reported as a value rather than an error.
    pub fn try_batch(&self, table: &str, columns: &[String], rows: &[Row]) -> BatchOutcome {
        match self.store.insert_batch(table, columns, rows) {
            Ok(()) => BatchOutcome::Inserted,
            Err(e) => BatchOutcome::Failed(e),
        }
    }

    /// Clear `table` and insert every row of the dump read from `input`.
    pub fn restore<R: Read>(&self, table: &str, input: R) -> Result<TableRestoreReport> {
        let started = Instant::now();
        let mut reader = RecordReader::new(input)?;
        let columns = reader.columns().to_vec();
        self.store.delete_all(table)?;

        let mut report = TableRestoreReport {
            table: table.to_string(),
            ..TableRestoreReport::default()
        };
        let mut offset = 0;
        loop {
            let batch = reader.next_batch(self.settings.insert_batch)?;
            if batch.is_empty() {
                break;
            }
            match self.try_batch(table, &columns, &batch) {
                BatchOutcome::Inserted => report.rows_restored += batch.len() as u64,
                BatchOutcome::Failed(e) => {
                    warn!(table, offset, rows = batch.len(), error = %e, "batch insert failed, retrying row by row");
                    report.fallbacks += 1;
                    self.insert_rows(table, &columns, &batch, offset, &mut report)?;
                }
            }
            offset += batch.len();
        }

        if self.reset_sequences {
            self.store.reset_sequence(table)?;
        }

        #[cfg(feature = "metrics")]
        if let Some(metrics) = DumpMetrics::global() {
            metrics.rows_restored_total.inc_by(report.rows_restored as f64);
            metrics.rows_rejected_total.inc_by(report.rejected.len() as f64);
            metrics.batch_fallbacks_total.inc_by(report.fallbacks as f64);
            metrics.table_seconds.observe(started.elapsed().as_secs_f64());
        }
        info!(
            table,
            rows = report.rows_restored,
            rejected = report.rejected.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "table restored"
        );
        Ok(report)
    }

    fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        batch: &[Row],
        offset: usize,
        report: &mut TableRestoreReport,
    ) -> Result<()> {
        for (i, row) in batch.iter().enumerate() {
            match self.store.insert_row(table, columns, row) {
                Ok(()) => report.rows_restored += 1,
                Err(e) if self.strict_rows => {
                    return Err(DumpError::RowRejected {
                        table: table.to_string(),
                        row: offset + i,
                        reason: e.to_string(),
                    })
                }
                Err(e) => {
                    warn!(table, row = offset + i, error = %e, "row rejected");
                    report.rejected.push(RejectedRow {
                        row: offset + i,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
