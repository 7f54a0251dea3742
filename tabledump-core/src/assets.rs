/*!
Asset roots packed alongside the tables.

Each configured root is a directory relative to an asset base. Files are
stored under `assets/<root>/...` in the container, or, for archives meant
for older readers, inside a single nested `assets.tar` entry.
*/

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tar::EntryType;
use tracing::{info, warn};

use crate::codec::archive::entry_header;
use crate::codec::{ArchiveReader, ArchiveWriter, AssetCount, AssetsManifest, Manifest, ASSETS_PREFIX, ASSETS_TAR_ENTRY};
use crate::config::is_relative_inside;
use crate::snapshot::UnitFilter;
use crate::{DumpError, Result};

/// One file or directory below an asset root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetEntry {
    /// Path relative to the asset base, `/` separated
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
}

fn normalize_root(root: &str) -> String {
    root.trim_start_matches("./").trim_end_matches('/').to_string()
}

/// Every entry under `root`, directories before their contents, siblings
/// sorted by name. A missing root yields nothing.
pub fn collect(base: &Path, root: &str) -> Result<Vec<AssetEntry>> {
    let root = normalize_root(root);
    let path = base.join(&root);
    let mut entries = Vec::new();
    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_dir() => walk(&path, &root, &mut entries)?,
        Ok(meta) if meta.is_file() => entries.push(AssetEntry {
            name: root,
            path,
            is_dir: false,
            size: meta.len(),
        }),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(root = %root, "asset root not found");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(entries)
}

fn walk(dir: &Path, name: &str, out: &mut Vec<AssetEntry>) -> Result<()> {
    out.push(AssetEntry {
        name: name.to_string(),
        path: dir.to_path_buf(),
        is_dir: true,
        size: 0,
    });
    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    children.sort_by_key(|entry| entry.file_name());
    for child in children {
        let child_name = format!("{name}/{}", child.file_name().to_string_lossy());
        let meta = fs::symlink_metadata(child.path())?;
        if meta.is_dir() {
            walk(&child.path(), &child_name, out)?;
        } else if meta.is_file() {
            out.push(AssetEntry {
                name: child_name,
                path: child.path(),
                is_dir: false,
                size: meta.len(),
            });
        }
    }
    Ok(())
}

/// Append the asset roots to `archive`.
///
/// Returns the manifest description, or `None` when no roots are configured.
pub fn write_assets<W: Write>(
    archive: &mut ArchiveWriter<W>,
    base: &Path,
    roots: &[String],
    legacy_tar: bool,
) -> Result<Option<AssetsManifest>> {
    if roots.is_empty() {
        return Ok(None);
    }
    let roots: Vec<String> = roots.iter().map(|r| normalize_root(r)).collect();

    if legacy_tar {
        archive.append_spooled(ASSETS_TAR_ENTRY, |out| {
            let mut builder = tar::Builder::new(out);
            for root in &roots {
                for entry in collect(base, root)? {
                    append_to_tar(&mut builder, &entry)?;
                }
            }
            builder.into_inner()?;
            Ok(())
        })?;
        info!(roots = roots.len(), "assets packed into {ASSETS_TAR_ENTRY}");
        return Ok(Some(AssetsManifest::Paths(roots)));
    }

    let mut counts = BTreeMap::new();
    for root in &roots {
        let mut count = AssetCount::default();
        for entry in collect(base, root)? {
            let name = format!("{ASSETS_PREFIX}/{}", entry.name);
            if entry.is_dir {
                archive.append_dir(&name)?;
            } else {
                archive.append_reader(&name, entry.size, File::open(&entry.path)?)?;
                count.file_count += 1;
            }
            count.total_entry_count += 1;
        }
        info!(root = %root, files = count.file_count, "assets packed");
        counts.insert(root.clone(), count);
    }
    Ok(Some(AssetsManifest::Counted(counts)))
}

fn append_to_tar<W: Write>(builder: &mut tar::Builder<W>, entry: &AssetEntry) -> Result<()> {
    if entry.is_dir {
        let mut header = entry_header(EntryType::Directory, 0o755);
        header.set_size(0);
        builder.append_data(&mut header, &entry.name, io::empty())?;
    } else {
        let mut header = entry_header(EntryType::Regular, 0o644);
        header.set_size(entry.size);
        builder.append_data(&mut header, &entry.name, File::open(&entry.path)?)?;
    }
    Ok(())
}

/// Outcome of restoring assets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetRestoreReport {
    pub roots: Vec<String>,
    /// Roots excluded by the filter
    pub skipped: Vec<String>,
    pub files: u64,
}

/// Replace each selected asset root under `base` with the archived copy.
///
/// Roots rejected by `filter` are left untouched and never read.
pub fn restore_assets(
    reader: &ArchiveReader,
    manifest: &Manifest,
    base: &Path,
    filter: &UnitFilter,
) -> Result<AssetRestoreReport> {
    let mut report = AssetRestoreReport::default();
    let Some(assets) = &manifest.assets else {
        return Ok(report);
    };
    for root in assets.roots() {
        if filter.passes(&root) {
            report.roots.push(root);
        } else {
            info!(root = %root, "asset root skipped by filter");
            report.skipped.push(root);
        }
    }
    if report.roots.is_empty() {
        return Ok(report);
    }

    for root in &report.roots {
        if !is_relative_inside(Path::new(root)) {
            return Err(DumpError::archive(format!("asset root {root:?} escapes the asset base")));
        }
        let dir = base.join(root);
        if dir.is_dir() {
            fs::remove_dir_all(&dir)?;
        }
    }

    let selected = report.roots.clone();
    let mut files = 0;
    match assets {
        AssetsManifest::Paths(_) => {
            let found = reader.with_entry(ASSETS_TAR_ENTRY, |input| {
                let mut nested = tar::Archive::new(input);
                for entry in nested.entries()? {
                    let mut entry = entry?;
                    let name = entry.path()?.to_string_lossy().trim_end_matches('/').to_string();
                    if unpack_entry(base, &selected, &name, &mut entry)? {
                        files += 1;
                    }
                }
                Ok(())
            })?;
            if found.is_none() {
                warn!("archive lists assets but has no {ASSETS_TAR_ENTRY} entry");
            }
        }
        AssetsManifest::Counted(_) => {
            reader.for_each_under(ASSETS_PREFIX, |name, entry| {
                if unpack_entry(base, &selected, name, entry)? {
                    files += 1;
                }
                Ok(())
            })?;
        }
    }
    report.files = files;
    info!(roots = report.roots.len(), files, "assets restored");
    Ok(report)
}

/// Write one archived entry below `base` if it belongs to a selected root.
/// Returns whether a file was written.
fn unpack_entry<R: Read>(
    base: &Path,
    selected: &[String],
    name: &str,
    entry: &mut tar::Entry<'_, R>,
) -> Result<bool> {
    let owned = selected
        .iter()
        .any(|root| name == root || name.starts_with(&format!("{root}/")));
    if !owned {
        return Ok(false);
    }
    if !is_relative_inside(Path::new(name)) {
        warn!(entry = name, "asset entry escapes the asset base, skipped");
        return Ok(false);
    }

    let target = base.join(name);
    if entry.header().entry_type().is_dir() {
        fs::create_dir_all(&target)?;
        return Ok(false);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(&target)?;
    io::copy(entry, &mut file)?;
    Ok(true)
}
