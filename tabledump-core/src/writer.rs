/*!
Snapshot creation.

A snapshot is written under a `tmp` name in a fixed order (schema, tables,
assets, manifest) and renamed to its final `tgz` name only once the whole
archive is complete. A failed write leaves the `tmp` file behind for
inspection; pruning removes it later.
*/

use std::fs;
use std::io::BufWriter;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::assets::write_assets;
use crate::codec::{table_entry, ArchiveWriter, Manifest, CONFIG_ENTRY, SCHEMA_ENTRY};
use crate::config::DumpConfig;
use crate::snapshot::{create_locked, Extension, FilterCache, Snapshot};
use crate::store::{TableStore, DEFAULT_VERSIONS_TABLE};
use crate::transfer::TableDumper;
use crate::{DumpError, Result};

/// A finished snapshot and its table of contents.
#[derive(Debug, Clone)]
pub struct WriteReport {
    pub snapshot: Snapshot,
    pub manifest: Manifest,
}

/// Writes snapshots of one table store.
pub struct SnapshotWriter<'a, S: TableStore + ?Sized> {
    store: &'a S,
    config: &'a DumpConfig,
}

impl<'a, S: TableStore + ?Sized> SnapshotWriter<'a, S> {
    pub fn new(store: &'a S, config: &'a DumpConfig) -> Self {
        Self { store, config }
    }

    /// Write a snapshot stamped with the current time.
    pub fn write(&self) -> Result<WriteReport> {
        self.write_at(Utc::now())
    }

    /// Write a snapshot stamped with `timestamp`.
    pub fn write_at(&self, timestamp: DateTime<Utc>) -> Result<WriteReport> {
        self.config.validate()?;
        fs::create_dir_all(&self.config.dir)?;

        let options = &self.config.write;
        let tmp = Snapshot::generate_at(&self.config.dir, timestamp, &options.description, &options.tags);
        // Held from creation through the rename so a concurrent prune never
        // sees an unlocked tmp file.
        let Some(locked) = create_locked(tmp.path())? else {
            return Err(DumpError::locked(tmp.name()));
        };
        info!(snapshot = %tmp, "creating snapshot");

        let archive = ArchiveWriter::new(BufWriter::new(locked.try_clone()?), self.config.gzip);
        let manifest = match self.fill(archive) {
            Ok(manifest) => manifest,
            Err(e) => {
                error!(snapshot = %tmp, error = %e, "snapshot creation failed");
                return Err(e);
            }
        };

        let snapshot = tmp.with_ext(Extension::Tgz);
        fs::rename(tmp.path(), snapshot.path())?;
        drop(locked);
        info!(
            snapshot = %snapshot,
            tables = manifest.tables.len(),
            rows = manifest.total_rows(),
            "snapshot created"
        );
        Ok(WriteReport { snapshot, manifest })
    }

    /// Tables to dump: every table passing the filter, plus the versions
    /// table so restores can reconcile migrations.
    pub fn selected_tables(&self) -> Result<Vec<String>> {
        let mut cache = FilterCache::new();
        let filter = cache.unit_filter(self.config.write.tables.as_deref());
        Ok(self
            .store
            .table_names()?
            .into_iter()
            .filter(|t| t == DEFAULT_VERSIONS_TABLE || filter.passes(t))
            .collect())
    }

    fn fill<W: std::io::Write>(&self, mut archive: ArchiveWriter<W>) -> Result<Manifest> {
        let schema = self.store.schema_definition()?;
        archive.append_bytes(SCHEMA_ENTRY, &schema)?;

        let dumper = TableDumper::new(self.store, &self.config.transfer);
        let mut manifest = Manifest::new();
        for table in self.selected_tables()? {
            let rows = archive.append_spooled(&table_entry(&table), |out| dumper.dump(&table, out))?;
            manifest = manifest.with_table(table, rows);
        }

        let options = &self.config.write;
        if let Some(assets) =
            write_assets(&mut archive, &options.asset_base, &options.assets, options.legacy_assets_tar)?
        {
            manifest = manifest.with_assets(assets);
        }

        archive.append_bytes(CONFIG_ENTRY, &manifest.to_bytes()?)?;
        archive.finish()?;
        Ok(manifest)
    }
}
