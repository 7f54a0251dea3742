/*!
Archive manifest (`config` entry): the table of contents of a snapshot.
*/

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{DumpError, Result};

/// Current manifest format version for compatibility tracking
pub const MANIFEST_FORMAT_VERSION: u8 = 1;

/// File and entry counts recorded for one asset root.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AssetCount {
    /// Regular files under the root
    pub file_count: u64,
    /// Files plus directories under the root
    pub total_entry_count: u64,
}

/// Asset roots stored in an archive.
///
/// Archives written with a legacy `assets.tar` carry a flat list; archives
/// storing files under `assets/` carry per-root counts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum AssetsManifest {
    Paths(Vec<String>),
    Counted(BTreeMap<String, AssetCount>),
}

impl AssetsManifest {
    /// Asset root paths in manifest order.
    pub fn roots(&self) -> Vec<String> {
        match self {
            AssetsManifest::Paths(paths) => paths.clone(),
            AssetsManifest::Counted(map) => map.keys().cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            AssetsManifest::Paths(paths) => paths.is_empty(),
            AssetsManifest::Counted(map) => map.is_empty(),
        }
    }
}

/// The `config` entry, written last and read first.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Manifest {
    /// Format version for compatibility (current: 1)
    #[serde(default = "default_format_version")]
    pub format_version: u8,

    /// Row count per dumped table
    #[serde(default)]
    pub tables: BTreeMap<String, u64>,

    /// Asset roots, if any were packed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<AssetsManifest>,
}

fn default_format_version() -> u8 {
    MANIFEST_FORMAT_VERSION
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            tables: BTreeMap::new(),
            assets: None,
        }
    }

    /// Record the row count for a table
    pub fn with_table<S: Into<String>>(mut self, table: S, rows: u64) -> Self {
        self.tables.insert(table.into(), rows);
        self
    }

    /// Set the asset description
    pub fn with_assets(mut self, assets: AssetsManifest) -> Self {
        self.assets = Some(assets);
        self
    }

    /// Check if this manifest can be read by this version of the engine
    pub fn is_compatible(&self) -> bool {
        self.format_version <= MANIFEST_FORMAT_VERSION
    }

    /// Total rows over all tables.
    pub fn total_rows(&self) -> u64 {
        self.tables.values().sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(data)?;
        if !manifest.is_compatible() {
            return Err(DumpError::archive(format!(
                "Incompatible manifest format version: {} (current: {})",
                manifest.format_version, MANIFEST_FORMAT_VERSION
            )));
        }
        Ok(manifest)
    }
}
