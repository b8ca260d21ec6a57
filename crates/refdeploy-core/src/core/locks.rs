//! Advisory file locks coordinating processes that share an installation.
//!
//! `lock` guards config and deploy-pointer changes and is always exclusive.
//! `repo-lock` is taken shared by pulls and deploys and exclusive by prune,
//! which gives up instead of waiting.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs4::FileExt;
use tracing::debug;

pub const DIR_LOCK_FILE: &str = "lock";
pub const REPO_LOCK_FILE: &str = "repo-lock";

#[derive(Debug)]
pub struct InstallationLock {
    _file: File,
    path: PathBuf,
}

impl InstallationLock {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

/// Block until the directory lock under `base` is held.
pub fn lock_dir(base: &Path) -> Result<InstallationLock> {
    let path = base.join(DIR_LOCK_FILE);
    let file = open_lock_file(&path)?;
    file.lock_exclusive()
        .with_context(|| format!("failed to lock {}", path.display()))?;
    debug!(path = %path.display(), "acquired directory lock");
    Ok(InstallationLock { _file: file, path })
}

/// Shared repo lock for pulls and deploys.
pub fn lock_repo_shared(base: &Path) -> Result<InstallationLock> {
    let path = base.join(REPO_LOCK_FILE);
    let file = open_lock_file(&path)?;
    file.lock_shared()
        .with_context(|| format!("failed to lock {}", path.display()))?;
    Ok(InstallationLock { _file: file, path })
}

/// Exclusive repo lock for prune; `None` when another process holds it.
pub fn try_lock_repo_exclusive(base: &Path) -> Result<Option<InstallationLock>> {
    let path = base.join(REPO_LOCK_FILE);
    let file = open_lock_file(&path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(InstallationLock { _file: file, path })),
        Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to lock {}", path.display())),
    }
}

/// Whether some process holds a lock on `path` (a running instance keeps one
/// on its deployment's `files/.ref`). Missing files are not locked.
#[must_use]
pub fn is_path_locked(path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
        return false;
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.unlock();
            false
        }
        Err(err) => err.kind() == ErrorKind::WouldBlock,
    }
}

/// Shared lock held while a deployment is in use.
pub fn lock_ref_shared(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.lock_shared()
        .with_context(|| format!("failed to lock {}", path.display()))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_lock_is_skipped_while_repo_is_shared() -> Result<()> {
        let base = tempfile::tempdir()?;
        let shared = lock_repo_shared(base.path())?;
        assert!(try_lock_repo_exclusive(base.path())?.is_none());
        drop(shared);
        let exclusive = try_lock_repo_exclusive(base.path())?;
        assert!(exclusive.is_some());
        Ok(())
    }

    #[test]
    fn ref_locks_are_detected() -> Result<()> {
        let base = tempfile::tempdir()?;
        let ref_file = base.path().join(".ref");
        assert!(!is_path_locked(&ref_file));
        fs::write(&ref_file, b"")?;
        assert!(!is_path_locked(&ref_file));
        let holder = lock_ref_shared(&ref_file)?;
        assert!(is_path_locked(&ref_file));
        drop(holder);
        assert!(!is_path_locked(&ref_file));
        Ok(())
    }

    #[test]
    fn dir_lock_creates_lock_file() -> Result<()> {
        let base = tempfile::tempdir()?;
        let lock = lock_dir(&base.path().join("install"))?;
        assert!(lock.path().ends_with(DIR_LOCK_FILE));
        assert!(lock.path().exists());
        Ok(())
    }
}
