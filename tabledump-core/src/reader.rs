/*!
Snapshot restoration.

Runs under the snapshot's lock: manifest, migration reconciliation, schema,
tables, then assets. Table and asset filters are applied before a unit is
read, so excluded units cost no I/O. A table entry listed in the manifest but
absent from the archive is reported and skipped.
*/

use tracing::{info, warn};

use crate::assets::{restore_assets, AssetRestoreReport};
use crate::codec::{table_entry, ArchiveReader, Manifest, SCHEMA_ENTRY};
use crate::config::DumpConfig;
use crate::migrations::{migrate_down, MigrationReport};
use crate::snapshot::{latest, FilterCache, Snapshot};
use crate::store::{MigrationRunner, TableStore};
use crate::transfer::{TableLoader, TableRestoreReport};
use crate::{DumpError, Result};

/// Everything a restore did.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub snapshot: Snapshot,
    pub manifest: Manifest,
    pub migrations: MigrationReport,
    pub schema_loaded: bool,
    pub tables: Vec<TableRestoreReport>,
    /// Tables excluded by the filter
    pub skipped_tables: Vec<String>,
    /// Tables listed in the manifest without a dump entry
    pub missing_tables: Vec<String>,
    pub assets: AssetRestoreReport,
}

impl RestoreReport {
    pub fn rows_restored(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_restored).sum()
    }

    pub fn rows_rejected(&self) -> usize {
        self.tables.iter().map(|t| t.rejected.len()).sum()
    }
}

/// Restores snapshots into a table store.
pub struct SnapshotReader<'a, S: TableStore + ?Sized, M: MigrationRunner + ?Sized> {
    store: &'a S,
    migrations: &'a M,
    config: &'a DumpConfig,
}

impl<'a, S, M> SnapshotReader<'a, S, M>
where
    S: TableStore + ?Sized,
    M: MigrationRunner + ?Sized,
{
    pub fn new(store: &'a S, migrations: &'a M, config: &'a DumpConfig) -> Self {
        Self {
            store,
            migrations,
            config,
        }
    }

    /// Restore the newest snapshot matching the configured selection.
    pub fn restore_latest(&self) -> Result<RestoreReport> {
        self.config.validate()?;
        let snapshot = latest(&self.config.dir, &self.config.select)?.ok_or_else(|| {
            DumpError::config(format!(
                "no snapshot in {} matches the selection",
                self.config.dir.display()
            ))
        })?;
        self.restore(&snapshot)
    }

    /// Restore `snapshot`. Fails with `DumpError::Locked` if another process
    /// holds it.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<RestoreReport> {
        if !snapshot.path().is_file() {
            return Err(DumpError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("snapshot not found: {}", snapshot.path().display()),
            )));
        }
        snapshot
            .lock(|| self.restore_locked(snapshot))
            .unwrap_or_else(|| Err(DumpError::locked(snapshot.name())))
    }

    fn restore_locked(&self, snapshot: &Snapshot) -> Result<RestoreReport> {
        info!(snapshot = %snapshot, "restoring snapshot");
        let reader = ArchiveReader::open(snapshot.path(), self.config.gzip)?;
        let manifest = reader.manifest()?;
        let options = &self.config.restore;

        let migrations = migrate_down(self.migrations, &reader, options.migrate_down)?;

        let mut schema_loaded = false;
        if options.restore_schema {
            match reader.read_entry(SCHEMA_ENTRY)? {
                Some(schema) => {
                    self.store.load_schema_definition(&schema)?;
                    schema_loaded = true;
                }
                None => warn!("archive has no {SCHEMA_ENTRY} entry, keeping live schema"),
            }
        }

        let mut cache = FilterCache::new();
        let filter = cache.unit_filter(options.tables.as_deref()).clone();
        let versions_table = self.migrations.versions_table();
        let loader = TableLoader::new(self.store, &self.config.transfer, options.strict_rows);

        let mut tables = Vec::new();
        let mut skipped_tables = Vec::new();
        let mut missing_tables = Vec::new();
        for (table, expected) in &manifest.tables {
            if table != versions_table && !filter.passes(table) {
                info!(table = %table, "table skipped by filter");
                skipped_tables.push(table.clone());
                continue;
            }
            match reader.with_entry(&table_entry(table), |input| loader.restore(table, input))? {
                Some(report) => {
                    if report.rows_restored + report.rejected.len() as u64 != *expected {
                        warn!(
                            table = %table,
                            expected,
                            restored = report.rows_restored,
                            "row count differs from manifest"
                        );
                    }
                    tables.push(report);
                }
                None => {
                    warn!(table = %table, "no dump entry for table, nothing restored");
                    missing_tables.push(table.clone());
                }
            }
        }

        let asset_filter = cache.unit_filter(options.assets.as_deref()).clone();
        let assets = restore_assets(
            &reader,
            &manifest,
            &self.config.write.asset_base,
            &asset_filter,
        )?;

        let report = RestoreReport {
            snapshot: snapshot.clone(),
            manifest,
            migrations,
            schema_loaded,
            tables,
            skipped_tables,
            missing_tables,
            assets,
        };
        info!(
            snapshot = %snapshot,
            tables = report.tables.len(),
            rows = report.rows_restored(),
            rejected = report.rows_rejected(),
            "snapshot restored"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ArchiveWriter, Value, CONFIG_ENTRY};
    use crate::config::MigrateDown;
    use crate::store::{Column, ColumnKind, MemoryMigrations, MemoryTableStore};
    use crate::writer::SnapshotWriter;
    use tempfile::TempDir;

    fn source() -> MemoryTableStore {
        let store = MemoryTableStore::new();
        store
            .create_table("schema_migrations", vec![Column::new("version", ColumnKind::String)])
            .unwrap();
        store
            .create_table(
                "users",
                vec![
                    Column::new("id", ColumnKind::Integer).primary_key(),
                    Column::new("email", ColumnKind::String).not_null(),
                ],
            )
            .unwrap();
        store
            .create_table("posts", vec![Column::new("id", ColumnKind::Integer).primary_key()])
            .unwrap();
        let versions = ["version".to_string()];
        store.insert_row("schema_migrations", &versions, &vec![Value::from("1")]).unwrap();
        store.insert_row("schema_migrations", &versions, &vec![Value::from("2")]).unwrap();
        let user = ["id".to_string(), "email".to_string()];
        store.insert_row("users", &user, &vec![Value::Int(1), Value::from("a@b.c")]).unwrap();
        store.insert_row("posts", &["id".to_string()], &vec![Value::Int(7)]).unwrap();
        store
    }

    #[test]
    fn test_restore_reconciles_and_loads() {
        let dir = TempDir::new().unwrap();
        let source = source();
        let config = DumpConfig::new(dir.path());
        let written = SnapshotWriter::new(&source, &config).write().unwrap();

        let target = MemoryTableStore::new();
        let migrations = MemoryMigrations::new(target.clone());
        for version in ["1", "2", "3"] {
            migrations.apply(version).unwrap();
        }
        let report = SnapshotReader::new(&target, &migrations, &config)
            .restore(&written.snapshot)
            .unwrap();

        assert_eq!(report.migrations.rolled_back, vec!["3".to_string()]);
        assert!(report.schema_loaded);
        assert_eq!(report.rows_restored(), 4);
        assert_eq!(target.rows("users").unwrap(), source.rows("users").unwrap());
    }

    #[test]
    fn test_filtered_tables_are_not_touched() {
        let dir = TempDir::new().unwrap();
        let source = source();
        let mut config = DumpConfig::new(dir.path());
        SnapshotWriter::new(&source, &config).write().unwrap();

        let target = source.clone();
        target.insert_row("posts", &["id".to_string()], &vec![Value::Int(8)]).unwrap();
        let migrations = MemoryMigrations::new(target.clone());
        config.restore.restore_schema = false;
        config.restore.migrate_down = MigrateDown::Skip;
        config.restore.tables = Some("-posts".to_string());

        let report = SnapshotReader::new(&target, &migrations, &config)
            .restore_latest()
            .unwrap();
        assert_eq!(report.skipped_tables, vec!["posts".to_string()]);
        assert_eq!(target.row_count("posts").unwrap(), 2);
    }

    #[test]
    fn test_missing_table_entry_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("20240101000000.tgz");
        let mut archive = ArchiveWriter::create(&path, crate::codec::GzipStream::new()).unwrap();
        let manifest = Manifest::new().with_table("ghosts", 3);
        archive.append_bytes(CONFIG_ENTRY, &manifest.to_bytes().unwrap()).unwrap();
        archive.finish().unwrap();

        let target = MemoryTableStore::new();
        let migrations = MemoryMigrations::new(target.clone());
        let config = DumpConfig::new(dir.path());
        let report = SnapshotReader::new(&target, &migrations, &config)
            .restore(&Snapshot::new(&path))
            .unwrap();
        assert_eq!(report.missing_tables, vec!["ghosts".to_string()]);
        assert!(!report.schema_loaded);
    }

    #[test]
    fn test_locked_snapshot_is_refused() {
        let dir = TempDir::new().unwrap();
        let source = source();
        let config = DumpConfig::new(dir.path());
        let written = SnapshotWriter::new(&source, &config).write().unwrap();

        let migrations = MemoryMigrations::new(source.clone());
        let reader = SnapshotReader::new(&source, &migrations, &config);
        let result = written.snapshot.lock(|| reader.restore(&written.snapshot)).unwrap();
        assert!(matches!(result, Err(DumpError::Locked(_))));
    }

    #[test]
    fn test_no_matching_snapshot() {
        let dir = TempDir::new().unwrap();
        let target = MemoryTableStore::new();
        let migrations = MemoryMigrations::new(target.clone());
        let config = DumpConfig::new(dir.path());
        let result = SnapshotReader::new(&target, &migrations, &config).restore_latest();
        assert!(matches!(result, Err(DumpError::Config(_))));
    }
}
