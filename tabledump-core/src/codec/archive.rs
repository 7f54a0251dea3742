/*!
Tar container of named entries inside a gzip stream.

Entries are appended in the order the writer is driven (schema, tables,
assets, then `config`) and located again by a forward scan from the start of
the file. The container is append-only, so the manifest is the table of
contents rather than any directory structure.
*/

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::{read::GzDecoder, write::GzEncoder};
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;

use super::compression::{GzipStream, FIXED_MTIME};
use super::manifest::Manifest;
use crate::{DumpError, Result};

/// Opaque schema definition blob.
pub const SCHEMA_ENTRY: &str = "schema.rb";
/// Manifest, always the last entry.
pub const CONFIG_ENTRY: &str = "config";
/// Legacy single sub-archive of all assets.
pub const ASSETS_TAR_ENTRY: &str = "assets.tar";
/// Prefix for asset files stored directly in the container.
pub const ASSETS_PREFIX: &str = "assets";

/// Entry name holding the rows of `table`.
pub fn table_entry(table: &str) -> String {
    format!("{table}.dump")
}

/// Decompressed stream the tar reader walks over.
pub type EntryStream = GzDecoder<BufReader<File>>;

/// Appends entries to a new archive.
pub struct ArchiveWriter<W: Write> {
    builder: Builder<GzEncoder<W>>,
    entries: Vec<String>,
}

impl ArchiveWriter<BufWriter<File>> {
    /// Create (or truncate) an archive file.
    pub fn create(path: &Path, gzip: GzipStream) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file), gzip))
    }
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(sink: W, gzip: GzipStream) -> Self {
        Self {
            builder: Builder::new(gzip.encoder(sink)),
            entries: Vec::new(),
        }
    }

    /// Append an in-memory entry.
    pub fn append_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.append_reader(name, data.len() as u64, data)
    }

    /// Append an entry whose size is known up front.
    pub fn append_reader<R: Read>(&mut self, name: &str, size: u64, data: R) -> Result<()> {
        let mut header = entry_header(EntryType::Regular, 0o644);
        header.set_size(size);
        self.builder
            .append_data(&mut header, name, data)
            .map_err(|e| DumpError::archive(format!("append '{name}': {e}")))?;
        debug!(entry = name, bytes = size, "archive entry written");
        self.entries.push(name.to_string());
        Ok(())
    }

    /// Append a directory marker.
    pub fn append_dir(&mut self, name: &str) -> Result<()> {
        let mut header = entry_header(EntryType::Directory, 0o755);
        header.set_size(0);
        self.builder
            .append_data(&mut header, name, std::io::empty())
            .map_err(|e| DumpError::archive(format!("append dir '{name}': {e}")))?;
        self.entries.push(name.to_string());
        Ok(())
    }

    /// Stream an entry of unknown size through a temporary spool file.
    ///
    /// Tar headers carry the entry size, so the content is produced first and
    /// copied into the container once complete.
    pub fn append_spooled<T, F>(&mut self, name: &str, produce: F) -> Result<T>
    where
        F: FnOnce(&mut BufWriter<File>) -> Result<T>,
    {
        let mut spool = BufWriter::new(tempfile::tempfile()?);
        let produced = produce(&mut spool)?;
        let mut file = spool
            .into_inner()
            .map_err(|e| DumpError::Io(e.into_error()))?;
        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        self.append_reader(name, size, BufReader::new(file))?;
        Ok(produced)
    }

    /// Entry names in write order.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Close the tar stream and the gzip member.
    pub fn finish(self) -> Result<W> {
        let encoder = self
            .builder
            .into_inner()
            .map_err(|e| DumpError::archive(format!("tar finish: {e}")))?;
        let mut sink = encoder.finish()?;
        sink.flush()?;
        Ok(sink)
    }
}

pub(crate) fn entry_header(kind: EntryType, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(u64::from(FIXED_MTIME));
    header
}

/// Locates entries in an existing archive by scanning forward.
#[derive(Debug, Clone)]
pub struct ArchiveReader {
    path: PathBuf,
    gzip: GzipStream,
}

impl ArchiveReader {
    pub fn open(path: &Path, gzip: GzipStream) -> Result<Self> {
        if !path.is_file() {
            return Err(DumpError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("archive not found: {}", path.display()),
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            gzip,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn archive(&self) -> Result<Archive<EntryStream>> {
        let file = File::open(&self.path)?;
        Ok(Archive::new(self.gzip.decoder(BufReader::new(file))))
    }

    /// Run `read` over the named entry; `None` when the entry is absent.
    pub fn with_entry<T, F>(&self, name: &str, read: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut dyn Read) -> Result<T>,
    {
        let mut archive = self.archive()?;
        let entries = archive
            .entries()
            .map_err(|e| DumpError::archive(e.to_string()))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| DumpError::archive(e.to_string()))?;
            if entry_name(&entry)? == name {
                return read(&mut entry).map(Some);
            }
        }
        Ok(None)
    }

    /// Visit every entry whose name starts with `prefix/`, in archive order.
    pub fn for_each_under<F>(&self, prefix: &str, mut visit: F) -> Result<usize>
    where
        F: FnMut(&str, &mut tar::Entry<'_, EntryStream>) -> Result<()>,
    {
        let wanted = format!("{}/", prefix.trim_end_matches('/'));
        let mut archive = self.archive()?;
        let entries = archive
            .entries()
            .map_err(|e| DumpError::archive(e.to_string()))?;
        let mut visited = 0;
        for entry in entries {
            let mut entry = entry.map_err(|e| DumpError::archive(e.to_string()))?;
            let name = entry_name(&entry)?;
            if let Some(relative) = name.strip_prefix(&wanted) {
                let relative = relative.trim_end_matches('/').to_string();
                if relative.is_empty() {
                    continue;
                }
                visit(&relative, &mut entry)?;
                visited += 1;
            }
        }
        Ok(visited)
    }

    /// Names of all entries, in archive order.
    pub fn entry_names(&self) -> Result<Vec<String>> {
        let mut archive = self.archive()?;
        let entries = archive
            .entries()
            .map_err(|e| DumpError::archive(e.to_string()))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| DumpError::archive(e.to_string()))?;
            names.push(entry_name(&entry)?);
        }
        Ok(names)
    }

    /// Read the whole named entry into memory.
    pub fn read_entry(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.with_entry(name, |reader| {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            Ok(data)
        })
    }

    /// Parse the manifest. An archive without one is unusable.
    pub fn manifest(&self) -> Result<Manifest> {
        let data = self
            .read_entry(CONFIG_ENTRY)?
            .ok_or_else(|| DumpError::missing_entry(CONFIG_ENTRY))?;
        Manifest::from_bytes(&data)
    }
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let path = entry
        .path()
        .map_err(|e| DumpError::archive(e.to_string()))?;
    Ok(path.to_string_lossy().into_owned())
}
