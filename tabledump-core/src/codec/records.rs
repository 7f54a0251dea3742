/*!
Self-delimiting record stream used for `<table>.dump` entries.

The first record of a table entry is the ordered list of column names, every
following record is one positional row. Records are MessagePack values
written back to back, so each one decodes on its own and a reader only needs
to know where the enclosing entry ends.
*/

use std::io::{BufRead, BufReader, Read, Write};

use serde::{de::DeserializeOwned, Serialize};

use super::value::Row;
use crate::{DumpError, Result};

/// Streaming writer for one table dump entry.
pub struct RecordWriter<W: Write> {
    inner: W,
    columns: usize,
    rows_written: u64,
}

impl<W: Write> RecordWriter<W> {
    /// Start a table entry by writing its column header record.
    pub fn new(mut inner: W, columns: &[String]) -> Result<Self> {
        write_record(&mut inner, &columns)?;
        Ok(Self {
            inner,
            columns: columns.len(),
            rows_written: 0,
        })
    }

    /// Append one row; its arity must match the header.
    pub fn write_row(&mut self, row: &Row) -> Result<()> {
        if row.len() != self.columns {
            return Err(DumpError::archive(format!(
                "row has {} values but the header declares {} columns",
                row.len(),
                self.columns
            )));
        }
        write_record(&mut self.inner, row)?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Flush and hand back the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Streaming reader for one table dump entry.
pub struct RecordReader<R: Read> {
    inner: BufReader<R>,
    columns: Vec<String>,
    rows_read: u64,
}

impl<R: Read> RecordReader<R> {
    /// Open an entry and consume its column header record.
    pub fn new(inner: R) -> Result<Self> {
        let mut inner = BufReader::new(inner);
        let columns: Vec<String> = read_record(&mut inner)?
            .ok_or_else(|| DumpError::archive("table entry has no column header"))?;
        Ok(Self {
            inner,
            columns,
            rows_read: 0,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Next row, or `None` at the logical end of the entry.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        let row: Option<Row> = read_record(&mut self.inner)?;
        if let Some(row) = &row {
            if row.len() != self.columns.len() {
                return Err(DumpError::archive(format!(
                    "row {} has {} values but the header declares {} columns",
                    self.rows_read,
                    row.len(),
                    self.columns.len()
                )));
            }
            self.rows_read += 1;
        }
        Ok(row)
    }

    /// Read up to `size` rows; an empty batch means the entry is exhausted.
    pub fn next_batch(&mut self, size: usize) -> Result<Vec<Row>> {
        let mut batch = Vec::with_capacity(size);
        while batch.len() < size {
            match self.next_row()? {
                Some(row) => batch.push(row),
                None => break,
            }
        }
        Ok(batch)
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

fn write_record<W: Write, T: Serialize + ?Sized>(out: &mut W, record: &T) -> Result<()> {
    rmp_serde::encode::write(out, record)?;
    Ok(())
}

fn read_record<R: Read, T: DeserializeOwned>(input: &mut BufReader<R>) -> Result<Option<T>> {
    if input.fill_buf()?.is_empty() {
        return Ok(None);
    }
    Ok(Some(rmp_serde::decode::from_read(input)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value::Value;
    use chrono::NaiveDate;

    fn columns() -> Vec<String> {
        vec!["id".into(), "name".into(), "born_on".into()]
    }

    #[test]
    fn test_records_stream_in_order() {
        let mut writer = RecordWriter::new(Vec::new(), &columns()).unwrap();
        let born = NaiveDate::from_ymd_opt(2020, 2, 29).unwrap();
        writer
            .write_row(&vec![Value::Int(1), Value::from("Henrietta"), Value::Date(born)])
            .unwrap();
        writer
            .write_row(&vec![Value::Int(2), Value::Null, Value::Null])
            .unwrap();
        assert_eq!(writer.rows_written(), 2);
        let bytes = writer.finish().unwrap();

        let mut reader = RecordReader::new(bytes.as_slice()).unwrap();
        assert_eq!(reader.columns(), columns().as_slice());
        let first = reader.next_row().unwrap().unwrap();
        assert_eq!(first[1], Value::from("Henrietta"));
        assert_eq!(first[2], Value::Date(born));
        let second = reader.next_row().unwrap().unwrap();
        assert!(second[1].is_null());
        assert!(reader.next_row().unwrap().is_none());
        assert_eq!(reader.rows_read(), 2);
    }

    #[test]
    fn test_header_only_entry_has_no_rows() {
        let bytes = RecordWriter::new(Vec::new(), &columns())
            .unwrap()
            .finish()
            .unwrap();
        let mut reader = RecordReader::new(bytes.as_slice()).unwrap();
        assert!(reader.next_batch(10).unwrap().is_empty());
    }

    #[test]
    fn test_arity_mismatch_is_rejected_on_write() {
        let mut writer = RecordWriter::new(Vec::new(), &columns()).unwrap();
        let result = writer.write_row(&vec![Value::Int(1)]);
        assert!(matches!(result, Err(DumpError::Archive(_))));
    }

    #[test]
    fn test_batches_split_the_stream() {
        let mut writer = RecordWriter::new(Vec::new(), &["n".to_string()]).unwrap();
        for i in 0..7 {
            writer.write_row(&vec![Value::Int(i)]).unwrap();
        }
        let bytes = writer.finish().unwrap();

        let mut reader = RecordReader::new(bytes.as_slice()).unwrap();
        let sizes: Vec<usize> = std::iter::from_fn(|| {
            let batch = reader.next_batch(3).unwrap();
            (!batch.is_empty()).then_some(batch.len())
        })
        .collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }

    #[test]
    fn test_empty_entry_fails_without_header() {
        let result = RecordReader::new(&b""[..]);
        assert!(result.is_err());
    }
}
