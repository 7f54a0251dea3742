/*!
# Tabledump Core Engine

Snapshots a relational database, plus directories of file assets, into one
portable gzip+tar archive, and restores such archives back into a database.

- Snapshot identity: archive names carry a timestamp, description and tags;
  listing, tag filtering, locking and pruning work on those names
- Archive codec: deterministic container with streaming row records
- Batch transfer engine: chunked reads, batched inserts with per-row fallback
- Writer and reader orchestration, including migration reconciliation

## Architecture

The engine talks to databases only through the [`TableStore`] and
[`MigrationRunner`] traits. [`MemoryTableStore`] and (feature `sqlite`)
[`SqliteTableStore`] are the bundled adapters.

## Usage

```rust
use tabledump_core::{
    Column, ColumnKind, DumpConfig, MemoryMigrations, MemoryTableStore, SnapshotReader,
    SnapshotWriter, TableStore, Value,
};

# fn main() -> tabledump_core::Result<()> {
# let dir = tempfile::TempDir::new()?;
let store = MemoryTableStore::new();
store.create_table("users", vec![Column::new("id", ColumnKind::Integer).primary_key()])?;
store.insert_row("users", &["id".to_string()], &vec![Value::Int(1)])?;

let config = DumpConfig::new(dir.path());
let written = SnapshotWriter::new(&store, &config).write()?;

let target = MemoryTableStore::new();
let migrations = MemoryMigrations::new(target.clone());
let report = SnapshotReader::new(&target, &migrations, &config).restore(&written.snapshot)?;
assert_eq!(report.rows_restored(), 1);
# Ok(())
# }
```
*/

pub mod assets;
pub mod codec;
pub mod config;
pub mod error;
pub mod migrations;
pub mod observability;
pub mod reader;
pub mod snapshot;
pub mod store;
pub mod transfer;
pub mod writer;


pub use codec::{Manifest, Row, Value};
pub use config::{DumpConfig, MigrateDown, RestoreOptions, TransferSettings, WriteOptions};
pub use error::{DumpError, Result};
pub use reader::{RestoreReport, SnapshotReader};
pub use snapshot::{prune, FilterCache, SelectOptions, Snapshot, TagFilter, UnitFilter};
pub use store::{Column, ColumnKind, MemoryMigrations, MemoryTableStore, MigrationRunner, TableStore};
#[cfg(feature = "sqlite")]
pub use store::{SqliteMigrations, SqliteTableStore};
pub use transfer::{TableDumper, TableLoader, TableRestoreReport};
pub use writer::{SnapshotWriter, WriteReport};
