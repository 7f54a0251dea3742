/*!
Error types for the tabledump archive engine.
*/

use thiserror::Error;

/// Result type used throughout the tabledump core.
pub type Result<T> = std::result::Result<T, DumpError>;

/// Errors that can occur while writing, reading or pruning snapshots.
#[derive(Error, Debug)]
pub enum DumpError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors (manifest)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Row record encoding errors
    #[error("Record encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Row record decoding errors
    #[error("Record decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Malformed filter expressions, clashing tag sets, invalid options
    #[error("Configuration error: {0}")]
    Config(String),

    /// Container-level failures (tar/gzip framing)
    #[error("Archive error: {0}")]
    Archive(String),

    /// A required archive entry is absent
    #[error("Missing archive entry: {0}")]
    MissingEntry(String),

    /// A row failed even when inserted on its own
    #[error("Row {row} of table {table} rejected: {reason}")]
    RowRejected {
        table: String,
        row: usize,
        reason: String,
    },

    /// The migration runner cannot roll back this version
    #[error("Irreversible migration: {version}")]
    Irreversible { version: String },

    /// Another process holds the snapshot's lock
    #[error("Snapshot is locked: {0}")]
    Locked(String),

    /// Table store adapter errors
    #[error("Store error: {0}")]
    Store(String),

    /// SQLite driver errors
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl DumpError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new archive error
    pub fn archive<S: Into<String>>(msg: S) -> Self {
        Self::Archive(msg.into())
    }

    /// Create a new store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    /// Create a new missing entry error
    pub fn missing_entry<S: Into<String>>(name: S) -> Self {
        Self::MissingEntry(name.into())
    }

    /// Create a new lock contention error
    pub fn locked<S: Into<String>>(snapshot: S) -> Self {
        Self::Locked(snapshot.into())
    }

    /// True for errors that a migration reconciler treats as "leave as-is"
    pub fn is_irreversible(&self) -> bool {
        matches!(self, Self::Irreversible { .. })
    }
}
