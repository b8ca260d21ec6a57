//! A remote's ref listing as seen by one operation.
//!
//! A [`RemoteState`] carries either a full summary or an index plus the
//! per-arch subsummaries fetched so far, the remote's ref filter, and the
//! sideload repos that can serve the same collection. It is built once and
//! owned by the caller; only [`RemoteState::ensure_subsummary`] mutates it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use refdeploy_domain::{find_deploy_error, DeployError};
use refdeploy_store::Cancellable;
use tracing::debug;

use super::config::RemoteConfig;
use super::filter::{FilterCache, RefFilter};
use super::oci;
use super::sideload::{discover_sideload_repos, SideloadRepo};
use crate::core::config::reverse_compat_arch;
use crate::core::summary::cache::{index_cache_key, summary_cache_key};
use crate::core::summary::{
    CacheData, SparseData, SubsummaryDescriptor, Summary, SummaryBlob, SummaryCache, SummaryIndex,
    SummarySource,
};

/// Shared collaborators needed to build a state.
#[derive(Clone, Copy)]
pub struct StateContext<'a> {
    pub cache: &'a Arc<SummaryCache>,
    pub filters: &'a FilterCache,
    /// The installation's repo, where filter backups are kept.
    pub repo_path: &'a Path,
    pub sideload_dirs: &'a [PathBuf],
    pub default_arch: &'a str,
    pub cancellable: &'a Cancellable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    /// Any listing fetch failure is an error.
    Required,
    /// Fetch failures are recorded and the state stays usable for sideloads.
    Optional,
    /// Never touch the network.
    LocalOnly,
}

/// A listing fetch failure captured by an optional build.
#[derive(Clone, Debug)]
pub struct FetchFailure {
    pub message: String,
    pub kind: Option<DeployError>,
}

impl FetchFailure {
    fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: format!("{err:#}"),
            kind: find_deploy_error(err).cloned(),
        }
    }

    #[must_use]
    pub fn to_error(&self) -> anyhow::Error {
        match &self.kind {
            Some(kind) => anyhow::Error::new(kind.clone()).context(self.message.clone()),
            None => anyhow::anyhow!("{}", self.message),
        }
    }
}

/// Where a ref resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRef {
    pub checksum: String,
    pub timestamp: u64,
    pub commit_size: u64,
    /// A sideload repo holding the same commit.
    pub sideload: Option<PathBuf>,
}

#[derive(Debug)]
pub struct RemoteState {
    pub remote_name: String,
    pub collection_id: Option<String>,
    pub url: String,
    base_url: String,
    subset: Option<String>,
    pub summary: Option<Summary>,
    pub summary_bytes: Option<Vec<u8>>,
    pub summary_sig: Option<Vec<u8>>,
    pub index: Option<SummaryIndex>,
    pub index_bytes: Option<Vec<u8>>,
    pub index_sig: Option<Vec<u8>>,
    index_map: BTreeMap<String, SubsummaryDescriptor>,
    subsummaries: HashMap<String, Summary>,
    pub filter: Option<Arc<RefFilter>>,
    pub sideload_repos: Vec<SideloadRepo>,
    pub summary_fetch_error: Option<FetchFailure>,
    pub default_token_type: i32,
    pub is_oci: bool,
    cache: Option<Arc<SummaryCache>>,
    source: Option<SummarySource>,
}

/// The arch component of a ref as it appears in listings.
fn ref_arch(reference: &str) -> Option<&str> {
    let parts: Vec<&str> = reference.split('/').collect();
    match parts.as_slice() {
        ["appstream" | "appstream2", arch] | [_, _, arch, _] => Some(*arch),
        _ => None,
    }
}

fn summary_source(remote: &RemoteConfig) -> Result<SummarySource> {
    let verifier: Option<Arc<dyn refdeploy_store::SignatureVerifier>> = if remote.gpg_verify_summary {
        Some(Arc::new(remote.verifier().map_err(DeployError::from).with_context(|| {
            format!("invalid signing keys for remote '{}'", remote.name)
        })?))
    } else {
        None
    };
    Ok(SummarySource {
        remote: remote.name.clone(),
        url: remote.base_url().to_string(),
        verifier,
    })
}

impl RemoteState {
    fn empty(remote: &RemoteConfig) -> Self {
        Self {
            remote_name: remote.name.clone(),
            collection_id: remote.collection_id.clone(),
            url: remote.url.clone(),
            base_url: remote.base_url().to_string(),
            subset: remote.subset.clone(),
            summary: None,
            summary_bytes: None,
            summary_sig: None,
            index: None,
            index_bytes: None,
            index_sig: None,
            index_map: BTreeMap::new(),
            subsummaries: HashMap::new(),
            filter: None,
            sideload_repos: Vec::new(),
            summary_fetch_error: None,
            default_token_type: remote.default_token_type.unwrap_or(0),
            is_oci: remote.is_oci(),
            cache: None,
            source: None,
        }
    }

    fn load_local_parts(&mut self, remote: &RemoteConfig, ctx: &StateContext<'_>) -> Result<()> {
        if let Some(path) = &remote.filter {
            let backup = ctx.repo_path.join(format!("{}.filter", remote.name));
            self.filter = Some(ctx.filters.load(path, &backup)?);
        }
        if let Some(collection_id) = &remote.collection_id {
            self.sideload_repos = discover_sideload_repos(ctx.sideload_dirs, collection_id);
        }
        Ok(())
    }

    /// Build the state for `remote`.
    pub fn build(remote: &RemoteConfig, ctx: &StateContext<'_>, mode: BuildMode) -> Result<Self> {
        let mut state = Self::empty(remote);
        state.load_local_parts(remote, ctx)?;
        if mode == BuildMode::LocalOnly {
            state.summary_fetch_error = Some(FetchFailure {
                message: format!("remote '{}' was not contacted (local-only lookup)", remote.name),
                kind: Some(DeployError::NotCached(format!("summary for remote '{}'", remote.name))),
            });
            return Ok(state);
        }

        state.cache = Some(Arc::clone(ctx.cache));
        let fetched = if state.is_oci {
            state.fetch_oci(remote, ctx)
        } else {
            summary_source(remote).and_then(|source| {
                state.source = Some(source.clone());
                state.fetch_listing(&source, ctx)
            })
        };
        if let Err(err) = fetched {
            if mode == BuildMode::Required {
                return Err(err);
            }
            debug!(remote = %remote.name, error = %format!("{err:#}"), "continuing without a listing");
            state.summary_fetch_error = Some(FetchFailure::from_error(&err));
        }
        state.finish(remote)?;
        Ok(state)
    }

    /// Build the state from bytes fetched elsewhere, verifying them against
    /// the remote's keys when summary verification is on.
    pub fn for_bytes(
        remote: &RemoteConfig,
        ctx: &StateContext<'_>,
        blob: SummaryBlob,
        is_index: bool,
    ) -> Result<Self> {
        let mut state = Self::empty(remote);
        state.load_local_parts(remote, ctx)?;
        let source = summary_source(remote)?;
        let what = if is_index { "summary index" } else { "summary" };
        SummaryCache::verify(&source, what, &blob.data, blob.signature.as_deref())?;
        state.cache = Some(Arc::clone(ctx.cache));
        state.source = Some(source);
        if is_index {
            state.set_index(blob)?;
            state.ensure_subsummary(ctx.default_arch, false, ctx.cancellable)?;
        } else {
            state.set_summary(blob)?;
        }
        state.finish(remote)?;
        Ok(state)
    }

    fn fetch_oci(&mut self, remote: &RemoteConfig, ctx: &StateContext<'_>) -> Result<()> {
        let listing = oci::fetch_oci_summary(
            ctx.cache.fetcher(),
            remote.base_url(),
            ctx.default_arch,
            ctx.cancellable,
        )?;
        self.subsummaries.insert(ctx.default_arch.to_string(), listing);
        Ok(())
    }

    fn fetch_listing(&mut self, source: &SummarySource, ctx: &StateContext<'_>) -> Result<()> {
        let cache = ctx.cache;
        if let Some(blob) = cache.memory_lookup(&index_cache_key(&source.remote), &source.url) {
            debug!(remote = %source.remote, "using summary index from memory");
            self.set_index(blob)?;
        } else if let Some(blob) = cache.memory_lookup(&summary_cache_key(&source.remote), &source.url) {
            debug!(remote = %source.remote, "using summary from memory");
            self.set_summary(blob)?;
        } else if let Some(blob) = cache.fetch_summary_index(source, false, ctx.cancellable)? {
            self.set_index(blob)?;
        } else {
            let blob = cache.fetch_summary(source, false, ctx.cancellable)?;
            self.set_summary(blob)?;
        }
        if self.index.is_some() {
            self.ensure_subsummary(ctx.default_arch, false, ctx.cancellable)?;
        }
        Ok(())
    }

    fn set_summary(&mut self, blob: SummaryBlob) -> Result<()> {
        let summary = Summary::from_bytes(&blob.data)
            .with_context(|| format!("invalid summary for remote '{}'", self.remote_name))?;
        self.summary = Some(summary);
        self.summary_bytes = Some(blob.data);
        self.summary_sig = blob.signature;
        self.index = None;
        self.index_bytes = None;
        self.index_sig = None;
        self.index_map.clear();
        Ok(())
    }

    fn set_index(&mut self, blob: SummaryBlob) -> Result<()> {
        let index = SummaryIndex::from_bytes(&blob.data)
            .with_context(|| format!("invalid summary index for remote '{}'", self.remote_name))?;
        self.index_map = index.arch_map(self.subset.as_deref());
        self.index = Some(index);
        self.index_bytes = Some(blob.data);
        self.index_sig = blob.signature;
        self.summary = None;
        self.summary_bytes = None;
        self.summary_sig = None;
        Ok(())
    }

    fn finish(&mut self, remote: &RemoteConfig) -> Result<()> {
        if let (Some(collection_id), Some(summary)) = (&self.collection_id, &self.summary) {
            if summary.refs_for(Some(collection_id)).is_none() {
                return Err(DeployError::invalid_data(format!(
                    "configured collection ID '{collection_id}' not in summary file of remote '{}'",
                    remote.name
                ))
                .into());
            }
        }
        self.default_token_type = if self.is_oci {
            oci::OCI_TOKEN_TYPE
        } else {
            self.summary
                .as_ref()
                .and_then(Summary::default_token_type)
                .or_else(|| self.subsummaries.values().find_map(Summary::default_token_type))
                .or(remote.default_token_type)
                .unwrap_or(0)
        };
        Ok(())
    }

    /// Whether any server listing (summary, index or OCI listing) is present.
    #[must_use]
    pub fn has_listing(&self) -> bool {
        self.summary.is_some() || self.index.is_some() || !self.subsummaries.is_empty()
    }

    /// Arches described by the index.
    #[must_use]
    pub fn index_arches(&self) -> Vec<&str> {
        self.index_map.keys().map(String::as_str).collect()
    }

    /// Make sure the listing for `arch` is loaded. A no-op for full
    /// summaries, arches the index does not describe, and arches already
    /// loaded.
    pub fn ensure_subsummary(&mut self, arch: &str, only_cached: bool, cancellable: &Cancellable) -> Result<()> {
        if self.subsummaries.contains_key(arch) {
            return Ok(());
        }
        let Some(cache) = self.cache.clone() else {
            return Ok(());
        };
        if self.is_oci {
            if only_cached {
                return Ok(());
            }
            let listing = oci::fetch_oci_summary(
                cache.fetcher(),
                &self.base_url,
                arch,
                cancellable,
            )?;
            self.subsummaries.insert(arch.to_string(), listing);
            return Ok(());
        }
        let (Some(descriptor), Some(source)) = (self.index_map.get(arch), self.source.as_ref()) else {
            return Ok(());
        };
        let data = cache.fetch_indexed_summary(source, arch, descriptor, only_cached, cancellable)?;
        let summary = Summary::from_bytes(&data).with_context(|| {
            format!("invalid {arch} subsummary for remote '{}'", self.remote_name)
        })?;
        debug!(remote = %self.remote_name, arch, "loaded subsummary");
        self.subsummaries.insert(arch.to_string(), summary);
        Ok(())
    }

    /// Load the listings `reference` can be found in.
    pub fn ensure_for_ref(&mut self, reference: &str, only_cached: bool, cancellable: &Cancellable) -> Result<()> {
        let Some(arch) = ref_arch(reference).map(ToOwned::to_owned) else {
            return Ok(());
        };
        self.ensure_subsummary(&arch, only_cached, cancellable)?;
        if let Some(parent) = reverse_compat_arch(&arch) {
            if let Err(err) = self.ensure_subsummary(parent, only_cached, cancellable) {
                debug!(remote = %self.remote_name, arch = parent, error = %err, "compat subsummary unavailable");
            }
        }
        Ok(())
    }

    /// The loaded listing that should contain `reference`.
    #[must_use]
    pub fn summary_for_ref(&self, reference: &str) -> Option<&Summary> {
        if let Some(summary) = &self.summary {
            return Some(summary);
        }
        let arch = ref_arch(reference)?;
        self.subsummaries.get(arch).or_else(|| {
            reverse_compat_arch(arch).and_then(|parent| self.subsummaries.get(parent))
        })
    }

    #[must_use]
    pub fn allow_ref(&self, reference: &str) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |filter| filter.allow_ref(reference))
    }

    fn not_found(&self, reference: &str) -> anyhow::Error {
        DeployError::RefNotFound {
            reference: reference.to_string(),
            remote: Some(self.remote_name.clone()),
        }
        .into()
    }

    /// Resolve `reference` to a commit.
    pub fn lookup_ref(&self, reference: &str) -> Result<ResolvedRef> {
        if !self.allow_ref(reference) {
            return Err(self.not_found(reference));
        }
        let collection_id = self.collection_id.as_deref();
        if self.has_listing() {
            let entry = self
                .summary_for_ref(reference)
                .and_then(|summary| summary.lookup(collection_id, reference))
                .ok_or_else(|| self.not_found(reference))?;
            let sideload = collection_id.and_then(|collection_id| {
                self.sideload_repos.iter().find_map(|repo| {
                    repo.lookup(collection_id, reference)
                        .filter(|candidate| candidate.checksum == entry.checksum)
                        .map(|_| repo.path.clone())
                })
            });
            return Ok(ResolvedRef {
                checksum: entry.checksum.clone(),
                timestamp: entry.timestamp(),
                commit_size: entry.commit_size,
                sideload,
            });
        }

        let mut best: Option<ResolvedRef> = None;
        if let Some(collection_id) = collection_id {
            for repo in &self.sideload_repos {
                let Some(entry) = repo.lookup(collection_id, reference) else {
                    continue;
                };
                let timestamp = entry.timestamp();
                if best.as_ref().map_or(true, |current| timestamp > current.timestamp) {
                    best = Some(ResolvedRef {
                        checksum: entry.checksum.clone(),
                        timestamp,
                        commit_size: entry.commit_size,
                        sideload: Some(repo.path.clone()),
                    });
                }
            }
        }
        match (best, &self.summary_fetch_error) {
            (Some(found), _) => Ok(found),
            (None, Some(failure)) => Err(failure
                .to_error()
                .context(format!("failed to look up {reference} in remote '{}'", self.remote_name))),
            (None, None) => Err(self.not_found(reference)),
        }
    }

    pub fn lookup_cache(&self, reference: &str) -> Result<Option<CacheData>> {
        let Some(summary) = self.summary_for_ref(reference) else {
            return Ok(None);
        };
        Ok(summary.lookup_cache(self.collection_id.as_deref(), reference)?)
    }

    pub fn lookup_sparse_cache(&self, reference: &str) -> Result<Option<SparseData>> {
        let Some(summary) = self.summary_for_ref(reference) else {
            return Ok(None);
        };
        Ok(summary.lookup_sparse_cache(self.collection_id.as_deref(), reference)?)
    }

    /// Every allowed ref known to the loaded listings (or to the sideload
    /// repos when there is none) with its checksum.
    #[must_use]
    pub fn list_refs(&self) -> BTreeMap<String, String> {
        let collection_id = self.collection_id.as_deref();
        let mut refs = BTreeMap::new();
        let mut add = |summary: &Summary| {
            if let Some(map) = summary.refs_for(collection_id) {
                for (name, entry) in map {
                    if self.allow_ref(name) {
                        refs.entry(name.clone()).or_insert_with(|| entry.checksum.clone());
                    }
                }
            }
        };
        if self.has_listing() {
            if let Some(summary) = &self.summary {
                add(summary);
            }
            for summary in self.subsummaries.values() {
                add(summary);
            }
        } else {
            for repo in &self.sideload_repos {
                add(&repo.summary);
            }
        }
        refs
    }

    /// Fail with the captured fetch error, if any.
    pub fn ensure_listing(&self) -> Result<()> {
        if self.has_listing() {
            return Ok(());
        }
        match &self.summary_fetch_error {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn cache(&self) -> Option<&Arc<SummaryCache>> {
        self.cache.as_ref()
    }

    /// The OCI registry and repository serving `reference`.
    #[must_use]
    pub fn oci_location(&self, reference: &str) -> Option<(String, String)> {
        let summary = self.summary_for_ref(reference)?;
        let registry = summary
            .metadata
            .get(oci::KEY_OCI_REGISTRY)
            .and_then(refdeploy_domain::Variant::as_str)?;
        let repository = summary
            .lookup(None, reference)?
            .metadata
            .get(oci::KEY_OCI_REPOSITORY)
            .and_then(refdeploy_domain::Variant::as_str)?;
        Some((registry.to_string(), repository.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::summary::format::KEY_COLLECTION_ID;
    use crate::core::summary::SummaryRef;
    use refdeploy_domain::Variant;
    use refdeploy_store::{Ed25519Signer, Fetcher};
    use std::fs;
    use url::Url;

    const APP: &str = "app/org.test.App/x86_64/stable";

    fn checksum(byte: u8) -> String {
        hex::encode([byte; 32])
    }

    fn summary_with(collection_id: Option<&str>, refs: &[(&str, u8, u64)]) -> Summary {
        let mut summary = Summary::default();
        if let Some(collection_id) = collection_id {
            summary
                .metadata
                .insert(KEY_COLLECTION_ID.into(), Variant::string(collection_id));
        }
        for (name, byte, timestamp) in refs {
            summary
                .refs
                .insert((*name).to_string(), SummaryRef::new(&checksum(*byte), 10, *timestamp));
        }
        summary
    }

    fn write_sideload(path: &Path, summary: &Summary) -> Result<()> {
        fs::create_dir_all(path.join("objects"))?;
        fs::write(path.join("config"), "[core]\nrepo_version=1\n")?;
        fs::write(path.join("summary"), summary.to_bytes())?;
        Ok(())
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        cache: Arc<SummaryCache>,
        filters: FilterCache,
        cancellable: Cancellable,
        sideload_dirs: Vec<PathBuf>,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let tmp = tempfile::tempdir()?;
            let cache = Arc::new(SummaryCache::new(tmp.path().join("cache"), Fetcher::new()));
            let sideload_dirs = vec![tmp.path().join("sideload")];
            Ok(Self {
                tmp,
                cache,
                filters: FilterCache::new(),
                cancellable: Cancellable::new(),
                sideload_dirs,
            })
        }

        fn ctx(&self) -> StateContext<'_> {
            StateContext {
                cache: &self.cache,
                filters: &self.filters,
                repo_path: self.tmp.path(),
                sideload_dirs: &self.sideload_dirs,
                default_arch: "x86_64",
                cancellable: &self.cancellable,
            }
        }

        fn remote_dir(&self, summary: &Summary) -> Result<RemoteConfig> {
            let dir = self.tmp.path().join("remote");
            fs::create_dir_all(&dir)?;
            fs::write(dir.join("summary"), summary.to_bytes())?;
            let url = Url::from_directory_path(&dir).map_err(|()| anyhow::anyhow!("bad path"))?;
            let mut remote = RemoteConfig::new("origin", url.as_str());
            remote.gpg_verify = false;
            remote.gpg_verify_summary = false;
            Ok(remote)
        }
    }

    #[test]
    fn resolves_from_a_full_summary() -> Result<()> {
        let fixture = Fixture::new()?;
        let remote = fixture.remote_dir(&summary_with(None, &[(APP, 1, 100)]))?;
        let state = RemoteState::build(&remote, &fixture.ctx(), BuildMode::Required)?;
        let resolved = state.lookup_ref(APP)?;
        assert_eq!(resolved.checksum, checksum(1));
        assert_eq!(resolved.timestamp, 100);
        assert_eq!(resolved.sideload, None);
        let missing = state.lookup_ref("app/org.test.Missing/x86_64/stable").unwrap_err();
        assert!(matches!(
            find_deploy_error(&missing),
            Some(DeployError::RefNotFound { .. })
        ));
        assert_eq!(state.list_refs().len(), 1);
        Ok(())
    }

    #[test]
    fn filtered_refs_are_not_found_even_when_listed() -> Result<()> {
        let fixture = Fixture::new()?;
        let mut remote = fixture.remote_dir(&summary_with(
            None,
            &[(APP, 1, 1), ("app/org.other.App/x86_64/stable", 2, 1)],
        ))?;
        let filter = fixture.tmp.path().join("filter");
        fs::write(&filter, "deny *\nallow app/org.test.*\n")?;
        remote.filter = Some(filter);
        let state = RemoteState::build(&remote, &fixture.ctx(), BuildMode::Required)?;
        assert!(state.lookup_ref(APP).is_ok());
        let err = state.lookup_ref("app/org.other.App/x86_64/stable").unwrap_err();
        assert!(matches!(
            find_deploy_error(&err),
            Some(DeployError::RefNotFound { .. })
        ));
        assert_eq!(state.list_refs().keys().collect::<Vec<_>>(), vec![APP]);
        Ok(())
    }

    #[test]
    fn missing_collection_is_fatal() -> Result<()> {
        let fixture = Fixture::new()?;
        let mut remote = fixture.remote_dir(&summary_with(Some("org.other.Repo"), &[(APP, 1, 1)]))?;
        remote.collection_id = Some("org.test.Repo".into());
        let err = RemoteState::build(&remote, &fixture.ctx(), BuildMode::Required).unwrap_err();
        assert!(matches!(
            find_deploy_error(&err),
            Some(DeployError::InvalidData(_))
        ));
        Ok(())
    }

    #[test]
    fn optional_builds_fall_back_to_sideload_repos() -> Result<()> {
        let fixture = Fixture::new()?;
        let sideload = &fixture.sideload_dirs[0];
        write_sideload(
            &sideload.join("a"),
            &summary_with(Some("org.test.Repo"), &[(APP, 1, 50)]),
        )?;
        write_sideload(
            &sideload.join("b"),
            &summary_with(Some("org.test.Repo"), &[(APP, 2, 90)]),
        )?;
        write_sideload(
            &sideload.join("c"),
            &summary_with(Some("org.test.Repo"), &[(APP, 3, 90)]),
        )?;
        let mut remote = RemoteConfig::new("origin", "file:///nonexistent/remote/");
        remote.gpg_verify = false;
        remote.gpg_verify_summary = false;
        remote.collection_id = Some("org.test.Repo".into());

        assert!(RemoteState::build(&remote, &fixture.ctx(), BuildMode::Required).is_err());
        let state = RemoteState::build(&remote, &fixture.ctx(), BuildMode::Optional)?;
        assert!(state.summary_fetch_error.is_some());
        assert_eq!(state.sideload_repos.len(), 3);
        let resolved = state.lookup_ref(APP)?;
        assert_eq!(resolved.checksum, checksum(2), "latest timestamp wins, first on ties");
        assert!(resolved.sideload.is_some_and(|path| path.ends_with("b")));

        let missing = state.lookup_ref("app/org.test.Missing/x86_64/stable").unwrap_err();
        assert!(find_deploy_error(&missing).is_some());
        Ok(())
    }

    #[test]
    fn summary_hits_prefer_a_sideload_with_the_same_commit() -> Result<()> {
        let fixture = Fixture::new()?;
        let summary = summary_with(Some("org.test.Repo"), &[(APP, 7, 1)]);
        write_sideload(&fixture.sideload_dirs[0].join("usb"), &summary)?;
        let mut remote = fixture.remote_dir(&summary)?;
        remote.collection_id = Some("org.test.Repo".into());
        let state = RemoteState::build(&remote, &fixture.ctx(), BuildMode::Required)?;
        let resolved = state.lookup_ref(APP)?;
        assert!(resolved.sideload.is_some_and(|path| path.ends_with("usb")));
        Ok(())
    }

    #[test]
    fn local_only_builds_skip_the_network() -> Result<()> {
        let fixture = Fixture::new()?;
        let remote = RemoteConfig::new("origin", "https://unreachable.invalid/repo");
        let state = RemoteState::build(&remote, &fixture.ctx(), BuildMode::LocalOnly)?;
        assert!(!state.has_listing());
        let err = state.ensure_listing().unwrap_err();
        assert!(matches!(
            find_deploy_error(&err),
            Some(DeployError::NotCached(_))
        ));
        Ok(())
    }

    #[test]
    fn handed_over_bytes_are_verified() -> Result<()> {
        let fixture = Fixture::new()?;
        let signer = Ed25519Signer::from_seed(&[5; 32]);
        let mut remote = RemoteConfig::new("origin", "https://example.invalid/repo");
        remote.gpg_verify_summary = true;
        remote.sign_keys = vec![signer.public_key_base64()];
        let data = summary_with(None, &[(APP, 4, 1)]).to_bytes();

        let unsigned = SummaryBlob {
            data: data.clone(),
            signature: None,
        };
        let err = RemoteState::for_bytes(&remote, &fixture.ctx(), unsigned, false).unwrap_err();
        assert!(matches!(
            find_deploy_error(&err),
            Some(DeployError::NoSignature(_))
        ));

        let signature = refdeploy_store::encode_signatures(&signer.sign(&data));
        let signed = SummaryBlob {
            data,
            signature: Some(signature),
        };
        let state = RemoteState::for_bytes(&remote, &fixture.ctx(), signed, false)?;
        assert_eq!(state.lookup_ref(APP)?.checksum, checksum(4));
        Ok(())
    }

    #[test]
    fn ref_arch_understands_listing_names() {
        assert_eq!(ref_arch(APP), Some("x86_64"));
        assert_eq!(ref_arch("appstream2/aarch64"), Some("aarch64"));
        assert_eq!(ref_arch("ostree-metadata"), None);
    }
}
