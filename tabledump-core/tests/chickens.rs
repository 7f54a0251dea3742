/*!
Full create/restore cycle of a table using every supported column type.
*/

#![cfg(feature = "sqlite")]

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tabledump_core::{
    Column, ColumnKind, DumpConfig, MemoryMigrations, MemoryTableStore, Row, SnapshotReader,
    SnapshotWriter, SqliteTableStore, TableStore, Value,
};
use tempfile::TempDir;

const COLUMNS: [&str; 11] = [
    "id", "name", "notes", "weight", "price", "laying", "photo", "born_on", "feeds_at",
    "hatched_at", "coop",
];

fn names() -> Vec<String> {
    COLUMNS.iter().map(|c| c.to_string()).collect()
}

fn boundary_timestamps() -> Vec<NaiveDateTime> {
    vec![
        NaiveDate::from_ymd_opt(1970, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
        NaiveDate::from_ymd_opt(1, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
        NaiveDate::from_ymd_opt(9999, 12, 31)
            .unwrap()
            .and_hms_micro_opt(23, 59, 59, 999_999)
            .unwrap(),
        NaiveDate::from_ymd_opt(2000, 2, 29).unwrap().and_hms_opt(12, 30, 0).unwrap(),
    ]
}

/// 100 chickens; every fifth row has NULL in each nullable column.
fn chickens() -> Vec<Row> {
    let stamps = boundary_timestamps();
    (0..100i64)
        .map(|i| {
            if i % 5 == 4 {
                let mut row = vec![Value::Null; COLUMNS.len()];
                row[0] = Value::Int(i + 1);
                row[1] = Value::Text(format!("hen {i}"));
                return row;
            }
            vec![
                Value::Int(i + 1),
                Value::Text(format!("hen {i}")),
                Value::Text(format!("notes with ünïcödé, quotes ' \" and\nnewlines #{i}")),
                Value::Float(i as f64 * 0.5 + 1.25),
                Value::Decimal(format!("{i}.25")),
                Value::Bool(i % 2 == 0),
                Value::Bytes(vec![0, 255, i as u8, 10, 13]),
                Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
                Value::Time(NaiveTime::from_hms_opt(23, 59, 59).unwrap()),
                Value::Timestamp(stamps[i as usize % stamps.len()]),
                Value::Int(if i == 0 { i64::MIN } else if i == 1 { i64::MAX } else { i }),
            ]
        })
        .collect()
}

fn memory_source() -> MemoryTableStore {
    let store = MemoryTableStore::new();
    store
        .create_table(
            "chickens",
            vec![
                Column::new("id", ColumnKind::Integer).primary_key(),
                Column::new("name", ColumnKind::String).with_limit(40).not_null(),
                Column::new("notes", ColumnKind::Text),
                Column::new("weight", ColumnKind::Float),
                Column::new("price", ColumnKind::Decimal),
                Column::new("laying", ColumnKind::Boolean),
                Column::new("photo", ColumnKind::Binary),
                Column::new("born_on", ColumnKind::Date),
                Column::new("feeds_at", ColumnKind::Time),
                Column::new("hatched_at", ColumnKind::Timestamp),
                Column::new("coop", ColumnKind::Integer),
            ],
        )
        .unwrap();
    store.insert_batch("chickens", &names(), &chickens()).unwrap();
    store
}

fn sqlite_source() -> SqliteTableStore {
    let store = SqliteTableStore::open_in_memory().unwrap();
    store
        .connection()
        .execute_batch(
            "CREATE TABLE chickens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name VARCHAR(40) NOT NULL,
                notes TEXT,
                weight REAL,
                price DECIMAL(10, 2),
                laying BOOLEAN,
                photo BLOB,
                born_on DATE,
                feeds_at TIME,
                hatched_at DATETIME,
                coop BIGINT
            );
            CREATE INDEX index_chickens_on_name ON chickens (name);",
        )
        .unwrap();
    store.insert_batch("chickens", &names(), &chickens()).unwrap();
    store
}

fn typed_rows<S: TableStore>(store: &S, table: &str) -> Vec<Row> {
    let columns = store.columns(table).unwrap();
    store
        .select_all(table)
        .unwrap()
        .into_iter()
        .map(|row| {
            row.into_iter()
                .zip(&columns)
                .map(|(value, column)| store.cast(column, value))
                .collect()
        })
        .collect()
}

#[test]
fn test_chickens_restore_into_empty_memory_store() {
    let dir = TempDir::new().unwrap();
    let source = memory_source();
    let config = DumpConfig::new(dir.path());
    let written = SnapshotWriter::new(&source, &config).write().unwrap();
    assert_eq!(written.manifest.tables.get("chickens"), Some(&100));

    let target = MemoryTableStore::new();
    let migrations = MemoryMigrations::new(target.clone());
    let report = SnapshotReader::new(&target, &migrations, &config)
        .restore(&written.snapshot)
        .unwrap();

    assert!(report.schema_loaded);
    assert_eq!(report.rows_restored(), 100);
    assert_eq!(report.rows_rejected(), 0);
    assert_eq!(target.rows("chickens").unwrap(), chickens());
}

#[test]
fn test_chickens_restore_into_empty_sqlite_database() {
    let dir = TempDir::new().unwrap();
    let source = sqlite_source();
    let config = DumpConfig::new(dir.path());
    let written = SnapshotWriter::new(&source, &config).write().unwrap();

    let target = SqliteTableStore::open_in_memory().unwrap();
    let migrations = target.migrations();
    let report = SnapshotReader::new(&target, &migrations, &config)
        .restore(&written.snapshot)
        .unwrap();

    assert_eq!(report.rows_restored(), 100);
    assert_eq!(target.table_names().unwrap(), vec!["chickens".to_string()]);
    let restored = typed_rows(&target, "chickens");
    assert_eq!(restored, typed_rows(&source, "chickens"));
    assert_eq!(restored, chickens());
}
