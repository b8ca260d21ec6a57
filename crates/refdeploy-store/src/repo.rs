//! Filesystem-backed content store.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use refdeploy_domain::{is_valid_checksum, KeyFile, VarDict, Variant};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cancel::Cancellable;
use crate::commit::{Commit, CommitState};
use crate::content::{
    CheckoutOptions, ContentStore, PruneOptions, PruneStats, PullOptions, PullSource, PullStats,
    TransactionStats,
};
use crate::error::{StoreError, StoreResult};
use crate::fetch::{join_uri, Fetcher};
use crate::object::{object_path, parse_object_path, relative_object_path, sha256_hex, ObjectType};
use crate::tree::{EntryKind, Tree, TreeEntry, S_IFDIR, S_IFLNK, S_IFREG};

const CONFIG_FILE: &str = "config";
const OBJECTS_DIR: &str = "objects";
const REFS_HEADS: &str = "refs/heads";
const REFS_REMOTES: &str = "refs/remotes";
const REFS_MIRRORS: &str = "refs/mirrors";
const STATE_DIR: &str = "state";
const TMP_DIR: &str = "tmp";
const STAGING_PREFIX: &str = "staging-";

#[derive(Debug)]
struct Transaction {
    staging: PathBuf,
    refs: Vec<(Option<String>, String, Option<String>)>,
    objects: u64,
}

struct PullRun<'a> {
    fetcher: &'a Fetcher,
    base: &'a str,
    options: &'a PullOptions,
    stats: PullStats,
    cancellable: &'a Cancellable,
}

/// Content-addressed store rooted at a directory.
#[derive(Debug)]
pub struct FsRepo {
    root: PathBuf,
    config: Mutex<KeyFile>,
    transaction: Mutex<Option<Transaction>>,
}

/// Checksum of the root directory's metadata as recorded in commits.
#[must_use]
pub fn root_dirmeta_checksum() -> String {
    sha256_hex(
        &Variant::tuple(vec![
            Variant::Uint32(0),
            Variant::Uint32(0),
            Variant::Uint32(S_IFDIR | 0o755),
        ])
        .to_bytes(),
    )
}

/// Parse sizes like `500MB` or `2GB` from `min-free-space-size`.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number.parse().ok()?;
    let shift = match unit.trim() {
        "" | "B" => 0,
        "KB" => 10,
        "MB" => 20,
        "GB" => 30,
        "TB" => 40,
        _ => return None,
    };
    number.checked_mul(1u64 << shift)
}

fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| StoreError::io_path("create", parent, err))?;
    let mut tmp =
        NamedTempFile::new_in(parent).map_err(|err| StoreError::io_path("write", path, err))?;
    tmp.write_all(data)
        .map_err(|err| StoreError::io_path("write", path, err))?;
    tmp.persist(path)
        .map_err(|err| StoreError::io_path("persist", path, err.error))?;
    Ok(())
}

fn split_refspec(refspec: &str) -> (Option<&str>, &str) {
    match refspec.split_once(':') {
        Some((remote, name)) => (Some(remote), name),
        None => (None, refspec),
    }
}

impl FsRepo {
    /// Open an existing repo, or initialize one when `create` is set.
    pub fn open(root: &Path, create: bool) -> StoreResult<Self> {
        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            if !create {
                return Err(StoreError::NotFound(format!("repo at {}", root.display())));
            }
            for dir in [OBJECTS_DIR, REFS_HEADS, REFS_REMOTES, REFS_MIRRORS, STATE_DIR, TMP_DIR] {
                let path = root.join(dir);
                fs::create_dir_all(&path).map_err(|err| StoreError::io_path("create", &path, err))?;
            }
            let mut config = KeyFile::new();
            config.set_integer("core", "repo_version", 1);
            config.set_string("core", "mode", "bare-user-only");
            write_atomic(&config_path, config.to_data().as_bytes())?;
            debug!(path = %root.display(), "initialized repo");
        }
        let config = Self::read_config(&config_path)?;
        Ok(Self {
            root: root.to_path_buf(),
            config: Mutex::new(config),
            transaction: Mutex::new(None),
        })
    }

    fn read_config(path: &Path) -> StoreResult<KeyFile> {
        let text = fs::read_to_string(path).map_err(|err| StoreError::io_path("read", path, err))?;
        KeyFile::parse(&text).map_err(|err| StoreError::Config(err.to_string()))
    }

    /// Re-read `config` from disk, picking up changes made by other processes.
    pub fn reload_config(&self) -> StoreResult<()> {
        let fresh = Self::read_config(&self.root.join(CONFIG_FILE))?;
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }

    fn remote_url(&self, remote: &str) -> StoreResult<String> {
        let config = self.config();
        config
            .get_string(&refdeploy_domain::remote_group(remote), "url")
            .ok_or_else(|| StoreError::UnknownRemote(remote.to_string()))
    }

    fn min_free_space(&self) -> u64 {
        self.config()
            .get_string("core", "min-free-space-size")
            .and_then(|value| parse_size(&value))
            .unwrap_or(0)
    }

    fn ensure_space(&self, needed: u64) -> StoreResult<()> {
        let reserve = self.min_free_space();
        if reserve == 0 {
            return Ok(());
        }
        let available = fs4::available_space(&self.root)
            .map_err(|err| StoreError::io_path("stat", &self.root, err))?;
        if available < reserve.saturating_add(needed) {
            return Err(StoreError::OutOfSpace(format!(
                "writing {needed} bytes would leave less than min-free-space-size ({reserve} bytes)"
            )));
        }
        Ok(())
    }

    fn ref_path(&self, remote: Option<&str>, name: &str) -> PathBuf {
        match remote {
            Some(remote) => self.root.join(REFS_REMOTES).join(remote).join(name),
            None => self.root.join(REFS_HEADS).join(name),
        }
    }

    fn apply_ref(&self, remote: Option<&str>, name: &str, checksum: Option<&str>) -> StoreResult<()> {
        let path = self.ref_path(remote, name);
        match checksum {
            Some(checksum) => write_atomic(&path, format!("{checksum}\n").as_bytes()),
            None => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(StoreError::io_path("remove", &path, err)),
            },
        }
    }

    fn staged_object_path(&self, kind: ObjectType, checksum: &str) -> Option<PathBuf> {
        let guard = self.transaction.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .map(|txn| object_path(&txn.staging, kind, checksum))
    }

    fn locate_object(&self, kind: ObjectType, checksum: &str) -> Option<PathBuf> {
        if let Some(staged) = self.staged_object_path(kind, checksum) {
            if staged.exists() {
                return Some(staged);
            }
        }
        let path = object_path(&self.root, kind, checksum);
        path.exists().then_some(path)
    }

    /// Store `data` as a content-addressed object, verifying its checksum.
    pub fn write_object(&self, kind: ObjectType, checksum: &str, data: &[u8]) -> StoreResult<()> {
        if kind.is_content_addressed() {
            let actual = sha256_hex(data);
            if actual != checksum {
                return Err(StoreError::ChecksumMismatch {
                    checksum: checksum.to_string(),
                    kind: kind.extension(),
                    actual,
                });
            }
        }
        if self.has_object(kind, checksum) {
            return Ok(());
        }
        self.ensure_space(data.len() as u64)?;
        let target = {
            let mut guard = self.transaction.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_mut() {
                Some(txn) => {
                    txn.objects += 1;
                    object_path(&txn.staging, kind, checksum)
                }
                None => object_path(&self.root, kind, checksum),
            }
        };
        write_atomic(&target, data)
    }

    fn state_marker(&self, checksum: &str) -> PathBuf {
        self.root
            .join(STATE_DIR)
            .join(format!("{checksum}.commitpartial"))
    }

    fn fetch_object(
        &self,
        run: &mut PullRun<'_>,
        kind: ObjectType,
        checksum: &str,
    ) -> StoreResult<Vec<u8>> {
        run.cancellable.check()?;
        if let Some(path) = self.locate_object(kind, checksum) {
            return fs::read(&path).map_err(|err| StoreError::io_path("read", &path, err));
        }
        for cache in &run.options.localcache_repos {
            let candidate = object_path(cache, kind, checksum);
            if let Ok(data) = fs::read(&candidate) {
                if sha256_hex(&data) == checksum {
                    self.write_object(kind, checksum, &data)?;
                    run.stats.localcache_objects += 1;
                    return Ok(data);
                }
                warn!(path = %candidate.display(), "ignoring corrupt object in local cache repo");
            }
        }
        let uri = join_uri(run.base, &relative_object_path(kind, checksum));
        let data = run.fetcher.fetch(&uri, run.cancellable).map_err(|err| match err {
            StoreError::NotFound(_) => StoreError::MissingObject {
                checksum: checksum.to_string(),
                kind: kind.extension(),
            },
            other => other,
        })?;
        run.stats.fetched_objects += 1;
        run.stats.fetched_bytes += data.len() as u64;
        self.write_object(kind, checksum, &data)?;
        Ok(data)
    }

    fn pull_commit(&self, run: &mut PullRun<'_>, checksum: &str) -> StoreResult<()> {
        let options = run.options;
        let partial_before = self.state_marker(checksum).exists();
        let complete = self.has_commit(checksum) && !partial_before;
        if complete && !options.flags.untrusted {
            debug!(checksum, "commit already present");
            return Ok(());
        }
        let data = self.fetch_object(run, ObjectType::Commit, checksum)?;
        let commit = Commit::from_bytes(checksum, &data)?;

        let meta_uri = join_uri(
            run.base,
            &relative_object_path(ObjectType::CommitMeta, checksum),
        );
        if let Some(detached) = run.fetcher.fetch_optional(&meta_uri, run.cancellable)? {
            let path = object_path(&self.root, ObjectType::CommitMeta, checksum);
            write_atomic(&path, &detached)?;
        }
        if options.flags.commit_only {
            if !self.has_tree_content(&commit) {
                self.mark_commit_partial(checksum, true)?;
            }
            return Ok(());
        }

        let tree_data = self.fetch_object(run, ObjectType::DirTree, &commit.root_tree)?;
        let tree = Tree::from_bytes(&commit.root_tree, &tree_data)?;
        for (entry, file_checksum) in tree.files() {
            if !options.subdirs.is_empty()
                && !options.subdirs.iter().any(|subdir| entry.within(subdir))
            {
                continue;
            }
            self.fetch_object(run, ObjectType::File, file_checksum)?;
        }
        self.mark_commit_partial(checksum, !options.subdirs.is_empty())?;
        Ok(())
    }

    fn has_tree_content(&self, commit: &Commit) -> bool {
        let Ok(tree) = self.load_tree(&commit.root_tree) else {
            return false;
        };
        let complete = tree
            .files()
            .all(|(_, checksum)| self.has_object(ObjectType::File, checksum));
        complete
    }

    fn resolve_source_ref(
        fetcher: &Fetcher,
        base: &str,
        name: &str,
        cancellable: &Cancellable,
    ) -> StoreResult<String> {
        let uri = join_uri(base, &format!("{REFS_HEADS}/{name}"));
        let data = fetcher.fetch(&uri, cancellable).map_err(|err| match err {
            StoreError::NotFound(_) => StoreError::RefNotFound(name.to_string()),
            other => other,
        })?;
        let checksum = String::from_utf8_lossy(&data).trim().to_string();
        if !is_valid_checksum(&checksum) {
            return Err(StoreError::Config(format!("ref {name} has invalid content")));
        }
        Ok(checksum)
    }

    fn collect_refs(dir: &Path) -> StoreResult<BTreeMap<String, String>> {
        let mut refs = BTreeMap::new();
        if !dir.exists() {
            return Ok(refs);
        }
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|err| StoreError::Io {
                context: format!("failed to walk {}", dir.display()),
                source: err.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let text = fs::read_to_string(entry.path())
                .map_err(|err| StoreError::io_path("read", entry.path(), err))?;
            refs.insert(name, text.trim().to_string());
        }
        Ok(refs)
    }

    fn all_ref_targets(&self) -> StoreResult<HashSet<String>> {
        let mut targets = HashSet::new();
        for dir in [REFS_HEADS, REFS_REMOTES, REFS_MIRRORS] {
            targets.extend(Self::collect_refs(&self.root.join(dir))?.into_values());
        }
        Ok(targets)
    }

    fn mark_reachable(&self, checksum: &str, reachable: &mut HashSet<(String, ObjectType)>) {
        reachable.insert((checksum.to_string(), ObjectType::Commit));
        reachable.insert((checksum.to_string(), ObjectType::CommitMeta));
        let Ok((commit, _)) = self.load_commit(checksum) else {
            return;
        };
        reachable.insert((commit.root_tree.clone(), ObjectType::DirTree));
        if let Ok(tree) = self.load_tree(&commit.root_tree) {
            for (_, file) in tree.files() {
                reachable.insert((file.to_string(), ObjectType::File));
            }
        }
    }

    fn write_entry(
        &self,
        entry: &TreeEntry,
        target: &Path,
        options: &CheckoutOptions,
        pending_dirs: &mut Vec<(PathBuf, u32)>,
    ) -> StoreResult<()> {
        let mode = if options.bareuseronly {
            entry.permissions() & 0o775
        } else {
            entry.permissions()
        };
        match &entry.kind {
            EntryKind::Dir => {
                fs::create_dir_all(target).map_err(|err| StoreError::io_path("create", target, err))?;
                pending_dirs.push((target.to_path_buf(), mode));
            }
            EntryKind::File { checksum } => {
                let data = self.read_object(ObjectType::File, checksum)?;
                prepare_target(target, options.overwrite_union)?;
                fs::write(target, &data).map_err(|err| StoreError::io_path("write", target, err))?;
                set_mode(target, mode)?;
            }
            EntryKind::Symlink { target: link } => {
                prepare_target(target, options.overwrite_union)?;
                make_symlink(link, target)?;
            }
        }
        Ok(())
    }
}

fn prepare_target(target: &Path, overwrite: bool) -> StoreResult<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|err| StoreError::io_path("create", parent, err))?;
    }
    if fs::symlink_metadata(target).is_ok() {
        if !overwrite {
            return Err(StoreError::CheckoutExists(target.to_path_buf()));
        }
        fs::remove_file(target).map_err(|err| StoreError::io_path("replace", target, err))?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> StoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|err| StoreError::io_path("chmod", path, err))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> StoreResult<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(link: &str, target: &Path) -> StoreResult<()> {
    std::os::unix::fs::symlink(link, target).map_err(|err| StoreError::io_path("symlink", target, err))
}

#[cfg(not(unix))]
fn make_symlink(_link: &str, target: &Path) -> StoreResult<()> {
    Err(StoreError::Io {
        context: format!("cannot create symlink {}", target.display()),
        source: std::io::Error::from(std::io::ErrorKind::Unsupported),
    })
}

#[cfg(unix)]
fn entry_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn entry_mode(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o555
    } else {
        0o755
    }
}

impl ContentStore for FsRepo {
    fn path(&self) -> &Path {
        &self.root
    }

    fn config(&self) -> KeyFile {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write_config(&self, config: &KeyFile) -> StoreResult<()> {
        write_atomic(&self.root.join(CONFIG_FILE), config.to_data().as_bytes())?;
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config.clone();
        Ok(())
    }

    fn resolve_rev(&self, refspec: &str, allow_noent: bool) -> StoreResult<Option<String>> {
        if is_valid_checksum(refspec) {
            return Ok(Some(refspec.to_string()));
        }
        let (remote, name) = split_refspec(refspec);
        let path = self.ref_path(remote, name);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text.trim().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if allow_noent {
                    Ok(None)
                } else {
                    Err(StoreError::RefNotFound(refspec.to_string()))
                }
            }
            Err(err) => Err(StoreError::io_path("read", &path, err)),
        }
    }

    fn list_refs(&self, remote: Option<&str>) -> StoreResult<BTreeMap<String, String>> {
        let dir = match remote {
            Some(remote) => self.root.join(REFS_REMOTES).join(remote),
            None => self.root.join(REFS_HEADS),
        };
        Self::collect_refs(&dir)
    }

    fn transaction_set_ref(
        &self,
        remote: Option<&str>,
        name: &str,
        checksum: Option<&str>,
    ) -> StoreResult<()> {
        let mut guard = self.transaction.lock().unwrap_or_else(PoisonError::into_inner);
        let txn = guard.as_mut().ok_or(StoreError::NoTransaction)?;
        txn.refs.push((
            remote.map(ToOwned::to_owned),
            name.to_string(),
            checksum.map(ToOwned::to_owned),
        ));
        Ok(())
    }

    fn set_ref_immediate(
        &self,
        remote: Option<&str>,
        name: &str,
        checksum: Option<&str>,
    ) -> StoreResult<()> {
        self.apply_ref(remote, name, checksum)
    }

    fn has_object(&self, kind: ObjectType, checksum: &str) -> bool {
        self.locate_object(kind, checksum).is_some()
    }

    fn read_object(&self, kind: ObjectType, checksum: &str) -> StoreResult<Vec<u8>> {
        let path = self
            .locate_object(kind, checksum)
            .ok_or_else(|| StoreError::MissingObject {
                checksum: checksum.to_string(),
                kind: kind.extension(),
            })?;
        fs::read(&path).map_err(|err| StoreError::io_path("read", &path, err))
    }

    fn object_path(&self, kind: ObjectType, checksum: &str) -> PathBuf {
        object_path(&self.root, kind, checksum)
    }

    fn load_commit(&self, checksum: &str) -> StoreResult<(Commit, CommitState)> {
        let data = self.read_object(ObjectType::Commit, checksum)?;
        let commit = Commit::from_bytes(checksum, &data)?;
        let state = if self.state_marker(checksum).exists() {
            CommitState::Partial
        } else {
            CommitState::Complete
        };
        Ok((commit, state))
    }

    fn load_tree(&self, checksum: &str) -> StoreResult<Tree> {
        let data = self.read_object(ObjectType::DirTree, checksum)?;
        Tree::from_bytes(checksum, &data)
    }

    fn mark_commit_partial(&self, checksum: &str, partial: bool) -> StoreResult<()> {
        let marker = self.state_marker(checksum);
        if partial {
            write_atomic(&marker, b"")
        } else {
            match fs::remove_file(&marker) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(StoreError::io_path("remove", &marker, err)),
            }
        }
    }

    fn begin_transaction(&self) -> StoreResult<()> {
        let mut guard = self.transaction.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Err(StoreError::TransactionActive);
        }
        let tmp = self.root.join(TMP_DIR);
        fs::create_dir_all(&tmp).map_err(|err| StoreError::io_path("create", &tmp, err))?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&tmp)
            .map_err(|err| StoreError::io_path("create staging dir in", &tmp, err))?
            .keep();
        debug!(staging = %staging.display(), "transaction started");
        *guard = Some(Transaction {
            staging,
            refs: Vec::new(),
            objects: 0,
        });
        Ok(())
    }

    fn commit_transaction(&self) -> StoreResult<TransactionStats> {
        let txn = self
            .transaction
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(StoreError::NoTransaction)?;
        let staged_objects = txn.staging.join(OBJECTS_DIR);
        if staged_objects.exists() {
            for entry in WalkDir::new(&staged_objects) {
                let entry = entry.map_err(|err| StoreError::Io {
                    context: format!("failed to walk {}", staged_objects.display()),
                    source: err.into(),
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&txn.staging) else {
                    continue;
                };
                let dest = self.root.join(relative);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|err| StoreError::io_path("create", parent, err))?;
                }
                fs::rename(entry.path(), &dest)
                    .map_err(|err| StoreError::io_path("commit object", &dest, err))?;
            }
        }
        for (remote, name, checksum) in &txn.refs {
            self.apply_ref(remote.as_deref(), name, checksum.as_deref())?;
        }
        if let Err(err) = fs::remove_dir_all(&txn.staging) {
            warn!(path = %txn.staging.display(), error = %err, "failed to remove staging dir");
        }
        debug!(objects = txn.objects, refs = txn.refs.len(), "transaction committed");
        Ok(TransactionStats {
            objects_written: txn.objects,
            refs_updated: txn.refs.len() as u64,
        })
    }

    fn abort_transaction(&self) -> StoreResult<()> {
        let Some(txn) = self
            .transaction
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };
        fs::remove_dir_all(&txn.staging)
            .map_err(|err| StoreError::io_path("remove", &txn.staging, err))?;
        debug!("transaction aborted");
        Ok(())
    }

    fn checkout(
        &self,
        checksum: &str,
        dest: &Path,
        options: &CheckoutOptions,
        cancellable: &Cancellable,
    ) -> StoreResult<()> {
        let (commit, _) = self.load_commit(checksum)?;
        let tree = self.load_tree(&commit.root_tree)?;
        let subpath = options
            .subpath
            .as_deref()
            .map(|s| s.trim_matches('/'))
            .unwrap_or_default();
        let mut pending_dirs = Vec::new();

        if !subpath.is_empty() {
            if let Some(entry) = tree.get(subpath) {
                if !matches!(entry.kind, EntryKind::Dir) {
                    return self.write_entry(entry, dest, options, &mut pending_dirs);
                }
            }
        }

        fs::create_dir_all(dest).map_err(|err| StoreError::io_path("create", dest, err))?;
        for entry in &tree.entries {
            cancellable.check()?;
            let relative = if subpath.is_empty() {
                entry.path.as_str()
            } else if let Some(rest) = entry
                .path
                .strip_prefix(subpath)
                .and_then(|rest| rest.strip_prefix('/'))
            {
                rest
            } else {
                continue;
            };
            self.write_entry(entry, &dest.join(relative), options, &mut pending_dirs)?;
        }
        for (dir, mode) in pending_dirs.into_iter().rev() {
            set_mode(&dir, mode)?;
        }
        Ok(())
    }

    fn pull(
        &self,
        source: &PullSource,
        options: &PullOptions,
        cancellable: &Cancellable,
    ) -> StoreResult<PullStats> {
        let base = match source {
            PullSource::Remote(name) => self.remote_url(name)?,
            PullSource::Uri(uri) => uri.clone(),
        };
        let fetcher = Fetcher::with_headers(options.http_headers.clone());
        let mut targets = Vec::new();
        for (index, name) in options.refs.iter().enumerate() {
            let checksum = match options.override_commit_ids.get(index) {
                Some(checksum) if !checksum.is_empty() => checksum.clone(),
                _ => Self::resolve_source_ref(&fetcher, &base, name, cancellable)?,
            };
            targets.push((name.clone(), checksum));
        }
        for collection_ref in &options.collection_refs {
            targets.push((
                collection_ref.reference.clone(),
                collection_ref.checksum.clone(),
            ));
        }

        let mut run = PullRun {
            fetcher: &fetcher,
            base: &base,
            options,
            stats: PullStats::default(),
            cancellable,
        };
        for (name, checksum) in targets {
            debug!(source = %base, reference = %name, checksum = %checksum, "pulling");
            self.pull_commit(&mut run, &checksum)?;
            run.stats.pulled.push((name, checksum));
        }
        Ok(run.stats)
    }

    fn read_commit_detached_metadata(&self, checksum: &str) -> StoreResult<Option<VarDict>> {
        let path = object_path(&self.root, ObjectType::CommitMeta, checksum);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io_path("read", &path, err)),
        };
        Variant::parse("a{sv}", &data)
            .and_then(|value| value.to_vardict())
            .map(Some)
            .map_err(|source| StoreError::Decode {
                checksum: checksum.to_string(),
                source,
            })
    }

    fn write_commit_detached_metadata(
        &self,
        checksum: &str,
        metadata: Option<&VarDict>,
    ) -> StoreResult<()> {
        let path = object_path(&self.root, ObjectType::CommitMeta, checksum);
        match metadata {
            Some(metadata) => {
                let data = Variant::vardict(metadata).to_bytes();
                self.ensure_space(data.len() as u64)?;
                write_atomic(&path, &data)
            }
            None => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(StoreError::io_path("remove", &path, err)),
            },
        }
    }

    fn write_dir(&self, source: &Path, cancellable: &Cancellable) -> StoreResult<String> {
        let mut tree = Tree::default();
        for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
            cancellable.check()?;
            let entry = entry.map_err(|err| StoreError::Io {
                context: format!("failed to walk {}", source.display()),
                source: err.into(),
            })?;
            let Ok(relative) = entry.path().strip_prefix(source) else {
                continue;
            };
            let path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let meta = fs::symlink_metadata(entry.path())
                .map_err(|err| StoreError::io_path("stat", entry.path(), err))?;
            let mode = entry_mode(&meta);
            let file_type = meta.file_type();
            let (mode, kind) = if file_type.is_symlink() {
                let target = fs::read_link(entry.path())
                    .map_err(|err| StoreError::io_path("readlink", entry.path(), err))?;
                (
                    S_IFLNK | 0o777,
                    EntryKind::Symlink {
                        target: target.to_string_lossy().into_owned(),
                    },
                )
            } else if file_type.is_dir() {
                (S_IFDIR | mode, EntryKind::Dir)
            } else {
                let data = fs::read(entry.path())
                    .map_err(|err| StoreError::io_path("read", entry.path(), err))?;
                let checksum = sha256_hex(&data);
                self.write_object(ObjectType::File, &checksum, &data)?;
                (S_IFREG | mode, EntryKind::File { checksum })
            };
            tree.entries.push(TreeEntry { path, mode, kind });
        }
        tree.sort();
        let data = tree.to_bytes();
        let checksum = sha256_hex(&data);
        self.write_object(ObjectType::DirTree, &checksum, &data)?;
        Ok(checksum)
    }

    fn write_commit(&self, commit: &Commit) -> StoreResult<String> {
        let data = commit.to_bytes();
        let checksum = sha256_hex(&data);
        self.write_object(ObjectType::Commit, &checksum, &data)?;
        Ok(checksum)
    }

    fn prune(&self, options: &PruneOptions) -> StoreResult<PruneStats> {
        if self
            .transaction
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Err(StoreError::TransactionActive);
        }
        let mut reachable = HashSet::new();
        for checksum in self.all_ref_targets()? {
            self.mark_reachable(&checksum, &mut reachable);
        }
        let objects_dir = self.root.join(OBJECTS_DIR);
        let mut objects = Vec::new();
        for entry in WalkDir::new(&objects_dir).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|err| StoreError::Io {
                context: format!("failed to walk {}", objects_dir.display()),
                source: err.into(),
            })?;
            if let Some((checksum, kind)) = parse_object_path(entry.path()) {
                objects.push((checksum, kind, entry.path().to_path_buf()));
            }
        }
        if !options.refs_only {
            for (checksum, kind, _) in &objects {
                if *kind == ObjectType::Commit {
                    self.mark_reachable(checksum, &mut reachable);
                }
            }
        }

        let mut stats = PruneStats::default();
        for (checksum, kind, path) in objects {
            stats.total += 1;
            if reachable.contains(&(checksum.clone(), kind)) {
                continue;
            }
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            stats.pruned += 1;
            stats.bytes_freed += size;
            if options.no_prune {
                continue;
            }
            fs::remove_file(&path).map_err(|err| StoreError::io_path("remove", &path, err))?;
            if kind == ObjectType::Commit {
                self.mark_commit_partial(&checksum, false)?;
            }
        }
        debug!(
            total = stats.total,
            pruned = stats.pruned,
            freed = stats.bytes_freed,
            "pruned repo"
        );
        Ok(stats)
    }

    fn commit_content_size(&self, checksum: &str) -> StoreResult<u64> {
        let (commit, _) = self.load_commit(checksum)?;
        let tree = self.load_tree(&commit.root_tree)?;
        let mut total = 0u64;
        for (_, file) in tree.files() {
            if let Some(path) = self.locate_object(ObjectType::File, file) {
                total += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }
}
