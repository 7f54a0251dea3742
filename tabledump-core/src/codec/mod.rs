/*!
On-disk archive format.

- [`compression`]: reproducible gzip layer
- [`archive`]: tar container of named entries
- [`records`]: self-delimiting row records inside `<table>.dump` entries
- [`manifest`]: the `config` entry
- [`value`]: typed cell values
*/

pub mod archive;
pub mod compression;
pub mod manifest;
pub mod records;
pub mod value;

pub use archive::{
    table_entry, ArchiveReader, ArchiveWriter, ASSETS_PREFIX, ASSETS_TAR_ENTRY, CONFIG_ENTRY,
    SCHEMA_ENTRY,
};
pub use compression::{GzipStream, FIXED_MTIME};
pub use manifest::{AssetCount, AssetsManifest, Manifest, MANIFEST_FORMAT_VERSION};
pub use records::{RecordReader, RecordWriter};
pub use value::{Row, Value};
