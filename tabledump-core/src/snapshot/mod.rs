/*!
Snapshot identity: naming, listing, filtering, locking and pruning of
archive files in a snapshot directory.
*/

pub mod filter;
pub mod lock;
pub mod name;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

pub use filter::{FilterCache, TagFilter, UnitFilter};
pub use lock::{create_locked, with_lock};
pub use name::{clean_description, clean_tag, clean_tags, Extension, NameParts};

use crate::Result;

/// Default number of newest finalized snapshots kept by a prune.
pub const DEFAULT_LEAVE: usize = 5;

/// One archive file, identified by its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    path: PathBuf,
    parts: NameParts,
}

impl Snapshot {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let parts = path
            .file_name()
            .map(|n| name::parse(&n.to_string_lossy()))
            .unwrap_or_default();
        Self { path, parts }
    }

    /// Path for a new snapshot created now, in `tmp` state.
    pub fn generate(dir: &Path, description: &str, tags: &str) -> Self {
        Self::generate_at(dir, Utc::now(), description, tags)
    }

    /// Path for a new snapshot created at `timestamp`, in `tmp` state.
    pub fn generate_at(dir: &Path, timestamp: DateTime<Utc>, description: &str, tags: &str) -> Self {
        Self::new(dir.join(name::file_name(
            timestamp,
            description,
            tags,
            Extension::Tmp,
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name including extension.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.parts.timestamp
    }

    pub fn description(&self) -> &str {
        &self.parts.description
    }

    pub fn tags(&self) -> &[String] {
        &self.parts.tags
    }

    pub fn ext(&self) -> Option<Extension> {
        self.parts.ext
    }

    pub fn is_finalized(&self) -> bool {
        self.parts.ext == Some(Extension::Tgz)
    }

    pub fn size(&self) -> Option<u64> {
        fs::metadata(&self.path).ok().map(|m| m.len())
    }

    /// The same snapshot with a different extension.
    pub fn with_ext(&self, ext: Extension) -> Self {
        Self::new(self.path.with_extension(ext.as_str()))
    }

    /// Run `f` under an exclusive, non-blocking lock on this file.
    pub fn lock<T, F: FnOnce() -> T>(&self, f: F) -> Option<T> {
        with_lock(&self.path, f)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Criteria for listing snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectOptions {
    /// Substring the file name must contain
    pub like: Option<String>,
    /// Tag filter expression
    pub tags: Option<String>,
    /// Include files of any extension, not only finalized archives
    pub all: bool,
}

impl SelectOptions {
    pub fn like<S: Into<String>>(mut self, like: S) -> Self {
        self.like = Some(like.into());
        self
    }

    pub fn tags<S: Into<String>>(mut self, tags: S) -> Self {
        self.tags = Some(tags.into());
        self
    }

    pub fn all(mut self, all: bool) -> Self {
        self.all = all;
        self
    }
}

/// Snapshots in `dir`, oldest first.
///
/// Ordering is by file name, which is chronological thanks to the fixed
/// width timestamp prefix.
pub fn list(dir: &Path, options: &SelectOptions) -> Result<Vec<Snapshot>> {
    list_cached(dir, options, &mut FilterCache::new())
}

/// [`list`] reusing parsed tag filters from `cache`.
pub fn list_cached(
    dir: &Path,
    options: &SelectOptions,
    cache: &mut FilterCache,
) -> Result<Vec<Snapshot>> {
    let tag_filter = match options.tags.as_deref() {
        Some(expression) => Some(cache.tag_filter(expression)?.clone()),
        None => None,
    };
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let keep = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => options.all || ext == Extension::Tgz.as_str(),
            None => false,
        };
        if keep {
            paths.push(path);
        }
    }
    paths.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));

    Ok(paths
        .into_iter()
        .map(Snapshot::new)
        .filter(|s| match &options.like {
            Some(like) => s.name().contains(like.as_str()),
            None => true,
        })
        .filter(|s| tag_filter.as_ref().map_or(true, |f| f.matches(s.tags())))
        .collect())
}

/// Newest snapshot matching `options`.
pub fn latest(dir: &Path, options: &SelectOptions) -> Result<Option<Snapshot>> {
    Ok(list(dir, options)?.pop())
}

/// Parse a `leave` option: a count, or `none` to keep nothing.
pub fn parse_leave(value: &str) -> Result<usize> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("none") {
        return Ok(0);
    }
    value
        .parse()
        .map_err(|_| crate::DumpError::config(format!("leave should be a number or \"none\", got {value:?}")))
}

/// Snapshots a prune would delete: every unfinished `tmp` file plus all but
/// the newest `leave` finalized archives matching `options`.
pub fn prune_candidates(dir: &Path, options: &SelectOptions, leave: usize) -> Result<Vec<Snapshot>> {
    let everything = list(dir, &options.clone().all(true))?;
    let (finalized, rest): (Vec<Snapshot>, Vec<Snapshot>) =
        everything.into_iter().partition(Snapshot::is_finalized);

    let mut doomed: Vec<Snapshot> = rest
        .into_iter()
        .filter(|s| s.ext() == Some(Extension::Tmp))
        .collect();
    let excess = finalized.len().saturating_sub(leave);
    doomed.extend(finalized.into_iter().take(excess));
    Ok(doomed)
}

/// Delete prune candidates, each under its lock. Busy or vanished files are
/// skipped. Returns the paths actually removed.
pub fn prune(dir: &Path, options: &SelectOptions, leave: usize) -> Result<Vec<PathBuf>> {
    let mut deleted = Vec::new();
    for snapshot in prune_candidates(dir, options, leave)? {
        let outcome = snapshot.lock(|| fs::remove_file(snapshot.path()));
        match outcome {
            Some(Ok(())) => {
                info!(snapshot = %snapshot, "deleted snapshot");
                deleted.push(snapshot.path().to_path_buf());
            }
            Some(Err(e)) => warn!(snapshot = %snapshot, error = %e, "cannot delete snapshot"),
            None => {}
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn test_generate_creates_tmp_path() {
        let dir = TempDir::new().unwrap();
        let at = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        let snapshot = Snapshot::generate_at(dir.path(), at, "year end", "Prod");
        assert_eq!(snapshot.name(), "20231231235959-year end@prod.tmp");
        assert_eq!(snapshot.ext(), Some(Extension::Tmp));
        assert_eq!(
            snapshot.with_ext(Extension::Tgz).name(),
            "20231231235959-year end@prod.tgz"
        );
        assert_eq!(snapshot.timestamp(), Some(at));
    }

    #[test]
    fn test_list_sorts_and_filters() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "20240102000000-second@a,d,o.tgz");
        touch(dir.path(), "20240101000000-first@a.tgz");
        touch(dir.path(), "20240103000000-third.tmp");
        touch(dir.path(), "README");

        let names: Vec<String> = list(dir.path(), &SelectOptions::default())
            .unwrap()
            .iter()
            .map(Snapshot::name)
            .collect();
        assert_eq!(
            names,
            vec!["20240101000000-first@a.tgz", "20240102000000-second@a,d,o.tgz"]
        );

        let all = list(dir.path(), &SelectOptions::default().all(true)).unwrap();
        assert_eq!(all.len(), 3);

        let like = list(dir.path(), &SelectOptions::default().like("second")).unwrap();
        assert_eq!(like.len(), 1);

        let tagged = list(dir.path(), &SelectOptions::default().tags("+a,+d")).unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].description(), "second");

        let newest = latest(dir.path(), &SelectOptions::default()).unwrap().unwrap();
        assert_eq!(newest.description(), "second");
    }

    #[test]
    fn test_list_rejects_clashing_tags() {
        let dir = TempDir::new().unwrap();
        assert!(list(dir.path(), &SelectOptions::default().tags("+x,-x")).is_err());
    }

    #[test]
    fn test_list_of_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(list(&dir.path().join("nope"), &SelectOptions::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_parse_leave() {
        assert_eq!(parse_leave("3").unwrap(), 3);
        assert_eq!(parse_leave("None").unwrap(), 0);
        assert!(parse_leave("many").is_err());
    }

    #[test]
    fn test_prune_leaves_newest() {
        let dir = TempDir::new().unwrap();
        for day in 1..=10 {
            touch(dir.path(), &format!("202401{day:02}000000.tgz"));
        }
        for day in 11..=13 {
            touch(dir.path(), &format!("202401{day:02}000000.tmp"));
        }

        let doomed = prune_candidates(dir.path(), &SelectOptions::default(), 5).unwrap();
        assert_eq!(doomed.len(), 8);
        assert_eq!(
            doomed.iter().filter(|s| s.ext() == Some(Extension::Tmp)).count(),
            3
        );
        let oldest: Vec<String> = doomed
            .iter()
            .filter(|s| s.is_finalized())
            .map(Snapshot::name)
            .collect();
        assert_eq!(oldest.first().map(String::as_str), Some("20240101000000.tgz"));
        assert_eq!(oldest.last().map(String::as_str), Some("20240105000000.tgz"));

        let deleted = prune(dir.path(), &SelectOptions::default(), 5).unwrap();
        assert_eq!(deleted.len(), 8);
        let left = list(dir.path(), &SelectOptions::default().all(true)).unwrap();
        assert_eq!(left.len(), 5);
        assert_eq!(left[0].name(), "20240106000000.tgz");
    }

    #[test]
    fn test_prune_skips_locked_archive() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "20240101000000.tgz");
        let busy = Snapshot::new(dir.path().join("20240101000000.tgz"));

        let deleted = busy
            .lock(|| prune(dir.path(), &SelectOptions::default(), 0).unwrap())
            .unwrap();
        assert!(deleted.is_empty());
        assert!(busy.path().exists());
    }

    #[test]
    fn test_prune_ignores_foreign_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "notes.txt");
        let doomed = prune_candidates(dir.path(), &SelectOptions::default(), 0).unwrap();
        assert!(doomed.is_empty());
    }
}
