//! Configuration for snapshot creation, restoration and pruning
//!
//! Options are gathered once at the process boundary into a [`DumpConfig`]
//! and handed to the writer, reader and transfer engine by reference. Nothing
//! here is read from the environment; the CLI does that mapping.

use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::GzipStream;
use crate::snapshot::{SelectOptions, TagFilter, DEFAULT_LEAVE};
use crate::{DumpError, Result};

/// How restore reconciles migrations applied live but absent from the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MigrateDown {
    /// Roll back extra versions, newest first
    #[default]
    Reconcile,
    /// Drop and recreate the whole schema instead
    Reset,
    /// Leave migrations alone
    Skip,
}

impl FromStr for MigrateDown {
    type Err = DumpError;

    fn from_str(value: &str) -> Result<Self> {
        Ok(match value.trim().to_lowercase().as_str() {
            "reset" => MigrateDown::Reset,
            "no" | "false" | "0" => MigrateDown::Skip,
            _ => MigrateDown::Reconcile,
        })
    }
}

/// Row transfer tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Estimated bytes per read chunk
    pub target_chunk_bytes: u64,
    pub min_chunk: usize,
    pub max_chunk: usize,
    /// Rows per multi-row INSERT on restore
    pub insert_batch: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        TransferSettings {
            target_chunk_bytes: 10_000_000,
            min_chunk: 100,
            max_chunk: 3_000,
            insert_batch: 1_000,
        }
    }
}

/// What goes into a new snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    pub description: String,
    /// Comma separated tags
    pub tags: String,
    /// Unit filter over table names; `None` dumps every table
    pub tables: Option<String>,
    /// Asset roots, relative to `asset_base`
    pub assets: Vec<String>,
    pub asset_base: PathBuf,
    /// Pack assets into a nested `assets.tar` entry
    pub legacy_assets_tar: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            description: String::new(),
            tags: String::new(),
            tables: None,
            assets: Vec::new(),
            asset_base: PathBuf::from("."),
            legacy_assets_tar: false,
        }
    }
}

/// What gets restored from a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOptions {
    pub restore_schema: bool,
    /// Unit filter over table names
    pub tables: Option<String>,
    /// Unit filter over asset roots
    pub assets: Option<String>,
    pub migrate_down: MigrateDown,
    /// Abort a table when a row fails on its own instead of skipping it
    pub strict_rows: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        RestoreOptions {
            restore_schema: true,
            tables: None,
            assets: None,
            migrate_down: MigrateDown::default(),
            strict_rows: false,
        }
    }
}

/// Complete configuration of one archive operation
#[derive(Debug, Clone)]
pub struct DumpConfig {
    /// Snapshot directory
    pub dir: PathBuf,
    pub write: WriteOptions,
    pub restore: RestoreOptions,
    pub transfer: TransferSettings,
    /// Snapshot selection for restore, listing and pruning
    pub select: SelectOptions,
    /// Finalized snapshots kept by a prune
    pub leave: usize,
    pub gzip: GzipStream,
}

impl DumpConfig {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        DumpConfig {
            dir: dir.into(),
            write: WriteOptions::default(),
            restore: RestoreOptions::default(),
            transfer: TransferSettings::default(),
            select: SelectOptions::default(),
            leave: DEFAULT_LEAVE,
            gzip: GzipStream::new(),
        }
    }

    pub fn with_write(mut self, write: WriteOptions) -> Self {
        self.write = write;
        self
    }

    pub fn with_restore(mut self, restore: RestoreOptions) -> Self {
        self.restore = restore;
        self
    }

    pub fn with_transfer(mut self, transfer: TransferSettings) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_select(mut self, select: SelectOptions) -> Self {
        self.select = select;
        self
    }

    /// Validate the configuration
    ///
    /// Tag filter expressions are parsed here so clashes surface before any
    /// archive is touched.
    pub fn validate(&self) -> Result<()> {
        let transfer = &self.transfer;
        if transfer.min_chunk == 0 || transfer.insert_batch == 0 || transfer.target_chunk_bytes == 0 {
            return Err(DumpError::config("chunk and batch sizes must be positive"));
        }
        if transfer.min_chunk > transfer.max_chunk {
            return Err(DumpError::config(format!(
                "min_chunk {} exceeds max_chunk {}",
                transfer.min_chunk, transfer.max_chunk
            )));
        }
        if let Some(tags) = &self.select.tags {
            TagFilter::parse(tags)?;
        }
        for root in &self.write.assets {
            if !is_relative_inside(Path::new(root)) {
                return Err(DumpError::config(format!(
                    "asset root {root:?} must be a relative path without '..'"
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn is_relative_inside(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DumpConfig::new("dump");
        assert_eq!(config.leave, 5);
        assert_eq!(config.transfer.insert_batch, 1_000);
        assert_eq!(config.transfer.target_chunk_bytes, 10_000_000);
        assert!(config.restore.restore_schema);
        assert_eq!(config.restore.migrate_down, MigrateDown::Reconcile);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_migrate_down_parsing() {
        assert_eq!("reset".parse::<MigrateDown>().unwrap(), MigrateDown::Reset);
        assert_eq!("No".parse::<MigrateDown>().unwrap(), MigrateDown::Skip);
        assert_eq!("0".parse::<MigrateDown>().unwrap(), MigrateDown::Skip);
        assert_eq!("yes".parse::<MigrateDown>().unwrap(), MigrateDown::Reconcile);
    }

    #[test]
    fn test_clashing_tags_fail_validation() {
        let config = DumpConfig::new("dump").with_select(SelectOptions::default().tags("+a,-a"));
        assert!(matches!(config.validate(), Err(DumpError::Config(_))));
    }

    #[test]
    fn test_chunk_bounds_are_checked() {
        let config = DumpConfig::new("dump").with_transfer(TransferSettings {
            min_chunk: 500,
            max_chunk: 10,
            ..TransferSettings::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_asset_roots_stay_inside_base() {
        let mut write = WriteOptions::default();
        write.assets = vec!["../etc".to_string()];
        assert!(DumpConfig::new("dump").with_write(write.clone()).validate().is_err());

        write.assets = vec!["public/system".to_string()];
        assert!(DumpConfig::new("dump").with_write(write).validate().is_ok());
    }

    #[test]
    fn test_options_serialize() {
        let json = serde_json::to_string(&RestoreOptions::default()).unwrap();
        let back: RestoreOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RestoreOptions::default());
    }
}
