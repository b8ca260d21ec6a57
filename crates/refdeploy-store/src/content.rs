//! The narrow interface the engine uses to talk to a content store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use refdeploy_domain::{KeyFile, VarDict};

use crate::cancel::Cancellable;
use crate::commit::{Commit, CommitState};
use crate::error::{StoreError, StoreResult};
use crate::object::ObjectType;
use crate::sign::{has_signatures, SignatureVerifier, SIGN_KEY_ED25519};
use crate::tree::Tree;

#[derive(Clone, Debug, Default)]
pub struct CheckoutOptions {
    /// Only check out this path of the commit (`/metadata`, `/files/share/...`).
    pub subpath: Option<String>,
    /// Replace files that already exist in the destination.
    pub overwrite_union: bool,
    /// Strip setuid/setgid and world-writable bits.
    pub bareuseronly: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PullSource {
    /// A remote configured in this repo's config.
    Remote(String),
    /// A repo addressed directly (sideload repos, local untrusted sources).
    Uri(String),
}

/// A ref addressed through its collection, with the commit to fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionPull {
    pub collection_id: String,
    pub reference: String,
    pub checksum: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PullFlags {
    /// Fetch the commit object (and detached metadata) only.
    pub commit_only: bool,
    /// The source is not trusted; every object is re-verified and copied.
    pub untrusted: bool,
    pub no_static_deltas: bool,
    pub mirror: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PullOptions {
    pub refs: Vec<String>,
    /// Parallel to `refs`; the commit to fetch for each ref.
    pub override_commit_ids: Vec<String>,
    pub subdirs: Vec<String>,
    pub collection_refs: Vec<CollectionPull>,
    pub localcache_repos: Vec<PathBuf>,
    pub http_headers: Vec<(String, String)>,
    pub flags: PullFlags,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PullStats {
    /// `(ref, checksum)` for every ref pulled.
    pub pulled: Vec<(String, String)>,
    pub fetched_objects: u64,
    pub fetched_bytes: u64,
    pub localcache_objects: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneOptions {
    /// Only refs are roots; unreferenced commits are collected too.
    pub refs_only: bool,
    /// Count what would be removed without deleting anything.
    pub no_prune: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub total: u64,
    pub pruned: u64,
    pub bytes_freed: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub objects_written: u64,
    pub refs_updated: u64,
}

pub trait ContentStore: Send + Sync {
    fn path(&self) -> &Path;

    fn config(&self) -> KeyFile;
    fn write_config(&self, config: &KeyFile) -> StoreResult<()>;

    /// Resolve `remote:ref`, `ref` or a bare checksum. `Ok(None)` only when
    /// `allow_noent` is set and the ref does not exist.
    fn resolve_rev(&self, refspec: &str, allow_noent: bool) -> StoreResult<Option<String>>;
    /// Refs under `refs/remotes/<remote>` or, with `None`, `refs/heads`.
    fn list_refs(&self, remote: Option<&str>) -> StoreResult<BTreeMap<String, String>>;
    /// Queue a ref update in the active transaction.
    fn transaction_set_ref(
        &self,
        remote: Option<&str>,
        name: &str,
        checksum: Option<&str>,
    ) -> StoreResult<()>;
    fn set_ref_immediate(
        &self,
        remote: Option<&str>,
        name: &str,
        checksum: Option<&str>,
    ) -> StoreResult<()>;

    fn has_object(&self, kind: ObjectType, checksum: &str) -> bool;
    fn read_object(&self, kind: ObjectType, checksum: &str) -> StoreResult<Vec<u8>>;
    fn object_path(&self, kind: ObjectType, checksum: &str) -> PathBuf;

    fn load_commit(&self, checksum: &str) -> StoreResult<(Commit, CommitState)>;
    fn load_tree(&self, checksum: &str) -> StoreResult<Tree>;
    fn mark_commit_partial(&self, checksum: &str, partial: bool) -> StoreResult<()>;

    fn begin_transaction(&self) -> StoreResult<()>;
    fn commit_transaction(&self) -> StoreResult<TransactionStats>;
    fn abort_transaction(&self) -> StoreResult<()>;

    fn checkout(
        &self,
        checksum: &str,
        dest: &Path,
        options: &CheckoutOptions,
        cancellable: &Cancellable,
    ) -> StoreResult<()>;

    fn pull(
        &self,
        source: &PullSource,
        options: &PullOptions,
        cancellable: &Cancellable,
    ) -> StoreResult<PullStats>;

    fn read_commit_detached_metadata(&self, checksum: &str) -> StoreResult<Option<VarDict>>;
    fn write_commit_detached_metadata(
        &self,
        checksum: &str,
        metadata: Option<&VarDict>,
    ) -> StoreResult<()>;

    /// Write a directory tree as file and dirtree objects; returns the tree checksum.
    fn write_dir(&self, source: &Path, cancellable: &Cancellable) -> StoreResult<String>;
    fn write_commit(&self, commit: &Commit) -> StoreResult<String>;

    fn prune(&self, options: &PruneOptions) -> StoreResult<PruneStats>;

    /// Sum of the sizes of the commit's file objects present locally.
    fn commit_content_size(&self, checksum: &str) -> StoreResult<u64>;

    fn has_commit(&self, checksum: &str) -> bool {
        self.has_object(ObjectType::Commit, checksum)
    }

    /// Check the commit's detached signatures against `verifier`.
    fn verify_commit(&self, checksum: &str, verifier: &dyn SignatureVerifier) -> StoreResult<()> {
        let data = self.read_object(ObjectType::Commit, checksum)?;
        let detached = self
            .read_commit_detached_metadata(checksum)?
            .unwrap_or_default();
        if !has_signatures(&detached) {
            return Err(StoreError::Signature(format!(
                "commit {checksum} has no {SIGN_KEY_ED25519} signatures"
            )));
        }
        verifier.verify(&data, &detached)
    }
}
