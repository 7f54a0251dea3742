/*!
Non-blocking advisory locks on archive files.
*/

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use fs2::FileExt;
use tracing::debug;

/// Run `f` while holding an exclusive lock on `path`.
///
/// Returns `None` without running `f` when the file is missing or another
/// holder already has the lock. Never waits.
pub fn with_lock<T, F>(path: &Path, f: F) -> Option<T>
where
    F: FnOnce() -> T,
{
    let file = match OpenOptions::new().read(true).open(path) {
        Ok(file) => file,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "lock target unavailable");
            return None;
        }
    };
    if let Err(e) = file.try_lock_exclusive() {
        debug!(path = %path.display(), error = %e, "lock contended, skipping");
        return None;
    }
    let result = f();
    // Closing the handle releases the lock as well.
    let _ = FileExt::unlock(&file);
    Some(result)
}

/// Create (or reuse) `path` and lock it exclusively before anything is
/// written to it.
///
/// Returns `Ok(None)` when another holder has the lock; the file is left
/// untouched in that case. The lock lives as long as the returned handle,
/// including across a rename of the path.
pub fn create_locked(path: &Path) -> io::Result<Option<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    if let Err(e) = file.try_lock_exclusive() {
        debug!(path = %path.display(), error = %e, "lock contended, not creating");
        return Ok(None);
    }
    // A prune may have removed the empty file before the lock was taken.
    if !path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} vanished while being locked", path.display()),
        ));
    }
    file.set_len(0)?;
    Ok(Some(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_runs_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.tgz");
        std::fs::write(&path, b"x").unwrap();
        assert_eq!(with_lock(&path, || 7), Some(7));
    }

    #[test]
    fn test_missing_file_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let mut ran = false;
        assert!(with_lock(&dir.path().join("gone.tgz"), || ran = true).is_none());
        assert!(!ran);
    }

    #[test]
    fn test_contended_lock_skips_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("busy.tgz");
        std::fs::write(&path, b"x").unwrap();

        let inner = with_lock(&path, || with_lock(&path, || "inner ran"));
        assert_eq!(inner, Some(None));
    }

    #[test]
    fn test_lock_is_released_after_block() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.tgz");
        std::fs::write(&path, b"x").unwrap();
        with_lock(&path, || ()).unwrap();
        assert!(with_lock(&path, || ()).is_some());
    }

    #[test]
    fn test_created_file_stays_locked_until_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("new.tmp");
        let held = create_locked(&path).unwrap().unwrap();
        assert!(path.is_file());
        assert!(with_lock(&path, || ()).is_none());
        assert!(create_locked(&path).unwrap().is_none());

        let renamed = dir.path().join("new.tgz");
        std::fs::rename(&path, &renamed).unwrap();
        assert!(with_lock(&renamed, || ()).is_none());

        drop(held);
        assert!(with_lock(&renamed, || ()).is_some());
    }

    #[test]
    fn test_contended_create_leaves_content_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("busy.tmp");
        std::fs::write(&path, b"partial").unwrap();
        let contended = with_lock(&path, || create_locked(&path).unwrap().is_none());
        assert_eq!(contended, Some(true));
        assert_eq!(std::fs::read(&path).unwrap(), b"partial");
    }
}
