use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use filetime::FileTime;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Temp dirs older than this are assumed to belong to a crashed operation.
pub const STALE_TMP_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Best-effort recursive chmod for trees checked out read-only.
#[cfg(unix)]
pub(crate) fn make_writable_recursive(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    if meta.file_type().is_symlink() {
        return;
    }
    let mode = meta.permissions().mode() | if meta.is_dir() { 0o700 } else { 0o600 };
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
    if meta.is_dir() {
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                make_writable_recursive(&entry.path());
            }
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn make_writable_recursive(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    let mut perms = meta.permissions();
    if perms.readonly() {
        perms.set_readonly(false);
        let _ = fs::set_permissions(path, perms);
    }
    if meta.is_dir() {
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                make_writable_recursive(&entry.path());
            }
        }
    }
}

pub(crate) fn remove_dir_all_writable(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("failed to stat {}", path.display())),
    };
    if meta.file_type().is_symlink() || !meta.is_dir() {
        fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))?;
        return Ok(());
    }
    make_writable_recursive(path);
    fs::remove_dir_all(path).with_context(|| format!("failed to remove {}", path.display()))?;
    Ok(())
}

/// A checkout directory created next to its final location. Dropped without
/// [`TempCheckout::publish`], the directory is removed.
pub(crate) struct TempCheckout {
    inner: Option<tempfile::TempDir>,
    path: PathBuf,
}

impl TempCheckout {
    pub(crate) fn new_in(root: &Path, prefix: &str) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
        prune_stale_tempdirs(root, prefix, STALE_TMP_AGE);
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(root)
            .with_context(|| format!("failed to create temp dir under {}", root.display()))?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            inner: Some(dir),
            path,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Flush the tree to disk, then rename it to `dest`.
    pub(crate) fn publish(mut self, dest: &Path) -> Result<()> {
        sync_tree(&self.path)?;
        fs::rename(&self.path, dest).with_context(|| {
            format!(
                "failed to move {} into place at {}",
                self.path.display(),
                dest.display()
            )
        })?;
        if let Some(dir) = self.inner.take() {
            let _ = dir.keep();
        }
        if let Some(parent) = dest.parent() {
            sync_dir(parent)?;
        }
        Ok(())
    }
}

impl Drop for TempCheckout {
    fn drop(&mut self) {
        let Some(dir) = self.inner.take() else {
            return;
        };
        let path = dir.keep();
        if let Err(err) = remove_dir_all_writable(&path) {
            warn!(path = %path.display(), %err, "failed to clean up temp checkout");
        }
    }
}

/// Remove `prefix*` directories under `root` older than `max_age`. Returns how
/// many were removed.
pub(crate) fn prune_stale_tempdirs(root: &Path, prefix: &str, max_age: Duration) -> usize {
    let Ok(entries) = fs::read_dir(root) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let Some(modified) = meta.modified().ok() else {
            continue;
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age < max_age {
            continue;
        }
        match remove_dir_all_writable(&entry.path()) {
            Ok(()) => {
                debug!(path = %entry.path().display(), "removed stale temp dir");
                removed += 1;
            }
            Err(err) => warn!(path = %entry.path().display(), %err, "failed to remove stale temp dir"),
        }
    }
    removed
}

fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)
        .and_then(|dir| dir.sync_all())
        .with_context(|| format!("failed to sync {}", path.display()))
}

/// fsync every file and directory below `root`, deepest first.
pub(crate) fn sync_tree(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            sync_dir(entry.path())?;
        } else {
            File::open(entry.path())
                .and_then(|file| file.sync_all())
                .with_context(|| format!("failed to sync {}", entry.path().display()))?;
        }
    }
    Ok(())
}

/// Write `data` to `path` through a synced sibling temp file and a rename.
pub(crate) fn write_file_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    tmp.write_all(data)
        .with_context(|| format!("failed to write {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to persist {}", path.display()))?;
    Ok(())
}

pub(crate) fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Point `link` at `target` by renaming a fresh symlink over it, so readers
/// never observe a missing link.
#[cfg(unix)]
pub(crate) fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::unix::fs::symlink;
    let parent = link
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", link.display()))?;
    let name = link
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid link path {}", link.display()))?;
    let staged = parent.join(format!(".{name}-{}", random_suffix(6)));
    symlink(target, &staged).with_context(|| {
        format!(
            "failed to create symlink {} -> {}",
            staged.display(),
            target.display()
        )
    })?;
    sync_dir(parent)?;
    if let Err(err) = fs::rename(&staged, link) {
        let _ = fs::remove_file(&staged);
        return Err(err).with_context(|| format!("failed to replace {}", link.display()));
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    Err(anyhow!(
        "symlinks are not supported on this platform ({} -> {})",
        link.display(),
        target.display()
    ))
}

/// Target of `link` as a file name, or `None` when it does not exist.
pub(crate) fn read_link_name(link: &Path) -> Result<Option<String>> {
    match fs::read_link(link) {
        Ok(target) => Ok(target
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToOwned::to_owned)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read link {}", link.display())),
    }
}

pub(crate) fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Create `path` if missing and bump its mtime.
pub(crate) fn touch(path: &Path) -> Result<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    filetime::set_file_mtime(path, FileTime::now())
        .with_context(|| format!("failed to update mtime of {}", path.display()))
}

/// Copy a directory tree, keeping symlinks as symlinks.
pub(crate) fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.with_context(|| format!("failed to walk {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("{} escapes {}", entry.path().display(), source.display()))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("failed to read link {}", entry.path().display()))?;
            remove_file_if_exists(&target)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("failed to create symlink {}", target.display()))?;
            #[cfg(not(unix))]
            let _ = link;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "failed to copy {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

/// Remove `dir` and then each empty ancestor up to (not including) `stop`.
pub(crate) fn remove_empty_dirs_up_to(dir: &Path, stop: &Path) {
    let mut current = Some(dir);
    while let Some(path) = current {
        if path == stop || !path.starts_with(stop) {
            break;
        }
        if fs::remove_dir(path).is_err() {
            break;
        }
        current = path.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_checkout_is_removed_unless_published() -> Result<()> {
        let root = tempfile::tempdir()?;
        let dir = TempCheckout::new_in(root.path(), ".checkout-")?;
        let path = dir.path().to_path_buf();
        fs::create_dir_all(path.join("files"))?;
        fs::write(path.join("files/data"), b"x")?;
        drop(dir);
        assert!(!path.exists());

        let dir = TempCheckout::new_in(root.path(), ".checkout-")?;
        fs::write(dir.path().join("deploy"), b"d")?;
        let dest = root.path().join("final");
        dir.publish(&dest)?;
        assert_eq!(fs::read(dest.join("deploy"))?, b"d");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn temp_checkout_cleans_read_only_children() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let root = tempfile::tempdir()?;
        let dir = TempCheckout::new_in(root.path(), ".checkout-")?;
        let path = dir.path().to_path_buf();
        let nested = path.join("nested");
        fs::create_dir_all(&nested)?;
        fs::write(nested.join("file"), b"hello")?;
        fs::set_permissions(&nested, fs::Permissions::from_mode(0o555))?;
        drop(dir);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn stale_tempdirs_are_pruned_after_a_day() -> Result<()> {
        let root = tempfile::tempdir()?;
        let old = root.path().join(".checkout-old");
        let fresh = root.path().join(".checkout-fresh");
        let other = root.path().join("keep-me");
        for dir in [&old, &fresh, &other] {
            fs::create_dir_all(dir)?;
        }
        let two_days_ago = FileTime::from_unix_time(
            FileTime::now().unix_seconds() - 2 * 24 * 60 * 60,
            0,
        );
        filetime::set_file_mtime(&old, two_days_ago)?;
        filetime::set_file_mtime(&other, two_days_ago)?;

        let removed = prune_stale_tempdirs(root.path(), ".checkout-", STALE_TMP_AGE);
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other.exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn replace_symlink_swaps_target() -> Result<()> {
        let root = tempfile::tempdir()?;
        fs::create_dir_all(root.path().join("a"))?;
        fs::create_dir_all(root.path().join("b"))?;
        let link = root.path().join("active");
        replace_symlink(Path::new("a"), &link)?;
        assert_eq!(read_link_name(&link)?.as_deref(), Some("a"));
        replace_symlink(Path::new("b"), &link)?;
        assert_eq!(read_link_name(&link)?.as_deref(), Some("b"));
        let leftovers: Vec<_> = fs::read_dir(root.path())?
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".active-"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(read_link_name(&root.path().join("missing"))?, None);
        Ok(())
    }

    #[test]
    fn write_file_atomic_replaces_contents() -> Result<()> {
        let root = tempfile::tempdir()?;
        let path = root.path().join("sub/deploy");
        write_file_atomic(&path, b"one")?;
        write_file_atomic(&path, b"two")?;
        assert_eq!(fs::read(&path)?, b"two");
        Ok(())
    }

    #[test]
    fn empty_parents_are_removed_up_to_stop() -> Result<()> {
        let root = tempfile::tempdir()?;
        let deep = root.path().join("app/org.test.App/x86_64/stable");
        fs::create_dir_all(&deep)?;
        fs::write(root.path().join("app/keep"), b"")?;
        remove_empty_dirs_up_to(&deep, root.path());
        assert!(!root.path().join("app/org.test.App").exists());
        assert!(root.path().join("app").exists());
        Ok(())
    }
}
