//! Moving commits from remotes into the installation's store.
//!
//! Every pull marks the target commit partial before the transaction opens,
//! and aborts the transaction on any failure after that point.

pub mod extra_data;

use std::path::Path;

use anyhow::{Context, Result};
use refdeploy_domain::DeployError;
use refdeploy_store::commit::META_XA_METADATA;
use refdeploy_store::{
    Cancellable, CollectionPull, Commit, ContentStore, Fetcher, FsRepo, PullFlags, PullOptions,
    PullSource, PullStats,
};
use tracing::{debug, info, warn};
use url::Url;

pub use extra_data::{
    encode_extra_data_payloads, encode_extra_data_sources, extra_data_payloads, extra_data_sources,
    pull_extra_data, AttachMode, ExtraDataSource, META_XA_EXTRA_DATA,
};

use crate::core::remote::config::RemoteConfig;
use crate::core::remote::oci::{self, OciImage};
use crate::core::remote::load_ref_commit;
use crate::core::remote::state::{RemoteState, ResolvedRef};

pub const HEADER_REF: &str = "Flatpak-Ref";
pub const HEADER_UPGRADE_FROM: &str = "Flatpak-Upgrade-From";

/// What to pull and under which policy.
#[derive(Clone, Debug, Default)]
pub struct PullRequest<'a> {
    pub reference: &'a str,
    /// Pull this commit instead of the one the listing advertises.
    pub commit: Option<&'a str>,
    /// Restrict the pull to `metadata` plus these subpaths of `files/`.
    pub subpaths: &'a [String],
    /// Currently deployed commit, sent to the server as an upgrade hint.
    pub upgrade_from: Option<&'a str>,
    pub token: Option<&'a str>,
    pub allow_downgrade: bool,
    /// Metadata the caller saw when it planned the operation.
    pub require_metadata: Option<&'a str>,
    pub attach_mode: Option<AttachMode>,
}

/// Expected out-of-band downloads, for progress reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtraDataProgress {
    pub count: u32,
    pub total_size: u64,
}

#[derive(Debug)]
pub struct PullOutcome {
    pub checksum: String,
    pub stats: PullStats,
    pub extra_data: usize,
    pub progress: ExtraDataProgress,
    /// Set when the content came from a sideload repo.
    pub sideload: Option<std::path::PathBuf>,
}

/// Subdirectories to pull for a partial install.
#[must_use]
pub fn subdirs_for(subpaths: &[String]) -> Vec<String> {
    if subpaths.is_empty() {
        return Vec::new();
    }
    let mut subdirs = vec!["/metadata".to_string()];
    for subpath in subpaths {
        subdirs.push(format!("/files/{}", subpath.trim_start_matches('/')));
    }
    subdirs
}

fn pull_headers(request: &PullRequest<'_>) -> Vec<(String, String)> {
    let mut headers = vec![(HEADER_REF.to_string(), request.reference.to_string())];
    if let Some(from) = request.upgrade_from {
        headers.push((HEADER_UPGRADE_FROM.to_string(), from.to_string()));
    }
    if let Some(token) = request.token {
        headers.push(("Authorization".to_string(), format!("Bearer {token}")));
    }
    headers
}

/// Run `body` inside a store transaction, aborting it on failure.
pub(crate) fn in_transaction<T>(
    repo: &dyn ContentStore,
    body: impl FnOnce() -> Result<T>,
) -> Result<T> {
    repo.begin_transaction().map_err(DeployError::from)?;
    match body() {
        Ok(value) => {
            repo.commit_transaction().map_err(DeployError::from)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(abort_err) = repo.abort_transaction() {
                warn!(error = %abort_err, "failed to abort transaction");
            }
            Err(err)
        }
    }
}

/// Refuse to move `remote:reference` to a commit older than the current one.
pub fn check_downgrade(
    repo: &dyn ContentStore,
    remote: &str,
    reference: &str,
    new_checksum: &str,
) -> Result<()> {
    let Some(old_checksum) = repo
        .resolve_rev(&format!("{remote}:{reference}"), true)
        .map_err(DeployError::from)?
    else {
        return Ok(());
    };
    check_downgrade_from(repo, &old_checksum, repo, new_checksum, reference)
}

/// Compare the timestamps of two commits that may live in different repos.
/// An old commit that cannot be loaded is an error, never a pass.
pub fn check_downgrade_from(
    old_repo: &dyn ContentStore,
    old_checksum: &str,
    new_repo: &dyn ContentStore,
    new_checksum: &str,
    reference: &str,
) -> Result<()> {
    if old_checksum == new_checksum {
        return Ok(());
    }
    let (old, _) = old_repo
        .load_commit(old_checksum)
        .map_err(DeployError::from)
        .with_context(|| format!("failed to load the current commit of {reference}"))?;
    let (new, _) = new_repo.load_commit(new_checksum).map_err(DeployError::from)?;
    if new.timestamp < old.timestamp {
        return Err(DeployError::Downgrade {
            reference: reference.to_string(),
            old: old_checksum.to_string(),
            new: new_checksum.to_string(),
        }
        .into());
    }
    Ok(())
}

/// The commit must be bound to `reference` and to the remote's collection.
pub fn validate_bindings(
    commit: &Commit,
    checksum: &str,
    reference: &str,
    collection_id: Option<&str>,
    require_binding: bool,
) -> Result<()> {
    let bindings = commit.ref_bindings();
    if bindings.is_empty() {
        if require_binding {
            return Err(DeployError::invalid_data(format!(
                "commit {checksum} has no ref binding"
            ))
            .into());
        }
    } else if !bindings.iter().any(|bound| bound == reference) {
        return Err(DeployError::invalid_data(format!(
            "commit {checksum} is not bound to {reference} (bound to {})",
            bindings.join(", ")
        ))
        .into());
    }
    if let (Some(expected), Some(bound)) = (collection_id, commit.collection_binding()) {
        if expected != bound {
            return Err(DeployError::invalid_data(format!(
                "commit {checksum} is bound to collection {bound}, expected {expected}"
            ))
            .into());
        }
    }
    Ok(())
}

/// Expected extra-data downloads for `checksum`, from the sparse listing
/// data when it describes that very commit, else from the commit itself.
pub fn setup_extra_data(
    repo: &dyn ContentStore,
    state: &RemoteState,
    reference: &str,
    resolved: &ResolvedRef,
    cancellable: &Cancellable,
) -> Result<ExtraDataProgress> {
    if let Some(summary) = state.summary_for_ref(reference) {
        let listed = summary
            .lookup(state.collection_id.as_deref(), reference)
            .map(|entry| entry.checksum.as_str());
        if summary.cache_version() >= 1 && listed == Some(resolved.checksum.as_str()) {
            let sparse = state.lookup_sparse_cache(reference)?;
            let (count, total_size) = sparse.and_then(|sparse| sparse.extra_data).unwrap_or((0, 0));
            return Ok(ExtraDataProgress { count, total_size });
        }
    }
    let commit = load_ref_commit(repo, state, reference, resolved, cancellable)?;
    let sources = extra_data_sources(&commit)?;
    Ok(ExtraDataProgress {
        count: u32::try_from(sources.len()).unwrap_or(u32::MAX),
        total_size: sources.iter().map(|source| source.download_size).sum(),
    })
}

fn resolve(state: &mut RemoteState, request: &PullRequest<'_>, cancellable: &Cancellable) -> Result<ResolvedRef> {
    if let Some(commit) = request.commit {
        let sideload = state.collection_id.as_deref().and_then(|collection_id| {
            state.sideload_repos.iter().find_map(|repo| {
                repo.lookup(collection_id, request.reference)
                    .filter(|entry| entry.checksum == commit)
                    .map(|_| repo.path.clone())
            })
        });
        return Ok(ResolvedRef {
            checksum: commit.to_string(),
            timestamp: 0,
            commit_size: 0,
            sideload,
        });
    }
    state.ensure_for_ref(request.reference, false, cancellable)?;
    state.lookup_ref(request.reference)
}

/// Pull `request.reference` from `remote` into `repo` and point
/// `remote:reference` at it.
pub fn pull(
    repo: &dyn ContentStore,
    remote: &RemoteConfig,
    state: &mut RemoteState,
    request: &PullRequest<'_>,
    cancellable: &Cancellable,
) -> Result<PullOutcome> {
    let resolved = resolve(state, request, cancellable)?;
    if state.is_oci {
        return pull_oci(repo, remote, state, request, &resolved, cancellable);
    }
    let progress = match setup_extra_data(repo, state, request.reference, &resolved, cancellable) {
        Ok(progress) => progress,
        Err(err) => {
            debug!(reference = %request.reference, error = %format!("{err:#}"), "extra data size unknown");
            ExtraDataProgress::default()
        }
    };

    let checksum = resolved.checksum.clone();
    if !repo.has_commit(&checksum) {
        repo.mark_commit_partial(&checksum, true)
            .map_err(DeployError::from)?;
    }

    let headers = pull_headers(request);
    let mut options = PullOptions {
        subdirs: subdirs_for(request.subpaths),
        http_headers: headers.clone(),
        flags: PullFlags {
            no_static_deltas: !request.subpaths.is_empty(),
            ..PullFlags::default()
        },
        ..PullOptions::default()
    };
    let source = match (&resolved.sideload, state.collection_id.as_deref()) {
        (Some(path), Some(collection_id)) => {
            options.collection_refs.push(CollectionPull {
                collection_id: collection_id.to_string(),
                reference: request.reference.to_string(),
                checksum: checksum.clone(),
            });
            PullSource::Uri(file_uri(path))
        }
        _ => {
            options.refs.push(request.reference.to_string());
            options.override_commit_ids.push(checksum.clone());
            options.localcache_repos = state
                .sideload_repos
                .iter()
                .map(|repo| repo.path.clone())
                .collect();
            PullSource::Remote(remote.name.clone())
        }
    };
    let attach_mode = request.attach_mode.unwrap_or(AttachMode::Detached);
    let fetcher = Fetcher::with_headers(headers);

    let (stats, extra_data) = in_transaction(repo, || {
        let stats = repo
            .pull(&source, &options, cancellable)
            .map_err(DeployError::from)
            .with_context(|| format!("failed to pull {} from remote '{}'", request.reference, remote.name))?;
        let (commit, _) = repo.load_commit(&checksum).map_err(DeployError::from)?;
        validate_bindings(
            &commit,
            &checksum,
            request.reference,
            state.collection_id.as_deref(),
            false,
        )?;
        if let Some(expected) = request.require_metadata {
            if commit.meta_str(META_XA_METADATA).unwrap_or_default() != expected {
                return Err(DeployError::PermissionDenied(format!(
                    "commit metadata for {} does not match the expected metadata",
                    request.reference
                ))
                .into());
            }
        }
        if !request.allow_downgrade {
            check_downgrade(repo, &remote.name, request.reference, &checksum)?;
        }
        let extra = pull_extra_data(repo, &fetcher, request.reference, &checksum, attach_mode, cancellable)?;
        repo.transaction_set_ref(Some(&remote.name), request.reference, Some(&checksum))
            .map_err(DeployError::from)?;
        Ok((stats, extra))
    })?;
    info!(
        remote = %remote.name,
        reference = %request.reference,
        %checksum,
        objects = stats.fetched_objects,
        "pulled"
    );
    Ok(PullOutcome {
        checksum,
        stats,
        extra_data,
        progress,
        sideload: resolved.sideload,
    })
}

fn file_uri(path: &Path) -> String {
    Url::from_directory_path(path).map_or_else(|()| format!("file://{}", path.display()), String::from)
}

fn pull_oci(
    repo: &dyn ContentStore,
    remote: &RemoteConfig,
    state: &RemoteState,
    request: &PullRequest<'_>,
    resolved: &ResolvedRef,
    cancellable: &Cancellable,
) -> Result<PullOutcome> {
    let not_found = || DeployError::RefNotFound {
        reference: request.reference.to_string(),
        remote: Some(remote.name.clone()),
    };
    let (registry, repository) = state.oci_location(request.reference).ok_or_else(not_found)?;
    let entry = state
        .summary_for_ref(request.reference)
        .and_then(|summary| summary.lookup(None, request.reference))
        .filter(|entry| entry.checksum == resolved.checksum)
        .ok_or_else(not_found)?;
    let cache = state.lookup_cache(request.reference)?;
    let image = OciImage {
        remote: &remote.name,
        reference: request.reference,
        registry: &registry,
        repository: &repository,
        entry,
        cache: cache.as_ref(),
    };
    let checksum = in_transaction(repo, || {
        let checksum = oci::import_image(repo, &image, cancellable)?;
        if !request.allow_downgrade {
            check_downgrade(repo, &remote.name, request.reference, &checksum)?;
        }
        repo.transaction_set_ref(Some(&remote.name), request.reference, Some(&checksum))
            .map_err(DeployError::from)?;
        Ok(checksum)
    })?;
    Ok(PullOutcome {
        checksum,
        stats: PullStats::default(),
        extra_data: 0,
        progress: ExtraDataProgress::default(),
        sideload: None,
    })
}

/// Pull from a local repo that is not itself trusted. The target remote
/// must require signatures for both its summary and its commits, and the
/// source commit must be signed and bound to `reference`.
pub fn pull_untrusted_local(
    repo: &dyn ContentStore,
    remote: &RemoteConfig,
    source_path: &Path,
    reference: &str,
    allow_downgrade: bool,
    cancellable: &Cancellable,
) -> Result<String> {
    if !(remote.gpg_verify && remote.gpg_verify_summary) {
        return Err(DeployError::Untrusted(format!(
            "can't pull from untrusted local repo into remote '{}': signature verification is disabled",
            remote.name
        ))
        .into());
    }
    let source = FsRepo::open(source_path, false)
        .map_err(DeployError::from)
        .with_context(|| format!("failed to open repo {}", source_path.display()))?;
    let checksum = source
        .resolve_rev(reference, false)
        .map_err(DeployError::from)?
        .ok_or_else(|| DeployError::RefNotFound {
            reference: reference.to_string(),
            remote: None,
        })?;
    let verifier = remote.verifier().map_err(DeployError::from)?;
    source
        .verify_commit(&checksum, &verifier)
        .map_err(DeployError::from)
        .with_context(|| format!("commit {checksum} for {reference} is not trusted"))?;
    let (commit, _) = source.load_commit(&checksum).map_err(DeployError::from)?;
    validate_bindings(&commit, &checksum, reference, remote.collection_id.as_deref(), true)?;

    if !repo.has_commit(&checksum) {
        repo.mark_commit_partial(&checksum, true)
            .map_err(DeployError::from)?;
    }
    let options = PullOptions {
        refs: vec![reference.to_string()],
        override_commit_ids: vec![checksum.clone()],
        flags: PullFlags {
            untrusted: true,
            ..PullFlags::default()
        },
        ..PullOptions::default()
    };
    in_transaction(repo, || {
        repo.pull(&PullSource::Uri(file_uri(source_path)), &options, cancellable)
            .map_err(DeployError::from)?;
        repo.verify_commit(&checksum, &verifier)
            .map_err(DeployError::from)?;
        if !allow_downgrade {
            check_downgrade(repo, &remote.name, reference, &checksum)?;
        }
        repo.transaction_set_ref(Some(&remote.name), reference, Some(&checksum))
            .map_err(DeployError::from)?;
        Ok(())
    })?;
    info!(remote = %remote.name, reference, %checksum, source = %source_path.display(), "pulled from local repo");
    Ok(checksum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::remote::filter::FilterCache;
    use crate::core::remote::state::{BuildMode, StateContext};
    use crate::core::summary::{update_summary, SummaryCache, SummaryOptions};
    use refdeploy_domain::{find_deploy_error, ErrorKind, Variant};
    use refdeploy_store::commit::META_REF_BINDING;
    use refdeploy_store::{root_dirmeta_checksum, Ed25519Signer, ObjectType};
    use std::fs;
    use std::sync::Arc;

    const APP: &str = "app/org.test.App/x86_64/stable";

    struct Fixture {
        tmp: tempfile::TempDir,
        remote_repo: FsRepo,
        local: FsRepo,
        remote: RemoteConfig,
        cache: Arc<SummaryCache>,
        filters: FilterCache,
        cancellable: Cancellable,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let tmp = tempfile::tempdir()?;
            let remote_repo = FsRepo::open(&tmp.path().join("remote"), true)?;
            let local = FsRepo::open(&tmp.path().join("local"), true)?;
            let url = file_uri(&tmp.path().join("remote"));
            let mut remote = RemoteConfig::new("origin", &url);
            remote.gpg_verify = false;
            remote.gpg_verify_summary = false;
            let mut config = local.config();
            remote.apply_to(&mut config);
            local.write_config(&config)?;
            let cache = Arc::new(SummaryCache::new(tmp.path().join("cache"), Fetcher::new()));
            Ok(Self {
                tmp,
                remote_repo,
                local,
                remote,
                cache,
                filters: FilterCache::new(),
                cancellable: Cancellable::new(),
            })
        }

        fn commit(&self, reference: &str, timestamp: u64, bind: &[&str]) -> Result<String> {
            let src = self.tmp.path().join(format!("src-{timestamp}"));
            fs::create_dir_all(src.join("files/share"))?;
            fs::write(src.join("metadata"), "[Application]\nname=org.test.App\nruntime=org.test.Platform/x86_64/1\n")?;
            fs::write(src.join("files/bin"), format!("binary {timestamp}"))?;
            fs::write(src.join("files/share/data"), "data")?;
            let tree = self.remote_repo.write_dir(&src, &self.cancellable)?;
            let mut commit = Commit::new(&tree, &root_dirmeta_checksum(), timestamp);
            if !bind.is_empty() {
                commit
                    .metadata
                    .insert(META_REF_BINDING.into(), Variant::strv(bind.iter().copied()));
            }
            let checksum = self.remote_repo.write_commit(&commit)?;
            self.remote_repo
                .set_ref_immediate(None, reference, Some(&checksum))?;
            update_summary(&self.remote_repo, &SummaryOptions::default())?;
            Ok(checksum)
        }

        fn state(&self) -> Result<RemoteState> {
            let ctx = StateContext {
                cache: &self.cache,
                filters: &self.filters,
                repo_path: self.local.path(),
                sideload_dirs: &[],
                default_arch: "x86_64",
                cancellable: &self.cancellable,
            };
            RemoteState::build(&self.remote, &ctx, BuildMode::Required)
        }
    }

    #[test]
    fn pulls_and_records_the_remote_ref() -> Result<()> {
        let fixture = Fixture::new()?;
        let checksum = fixture.commit(APP, 100, &[APP])?;
        let mut state = fixture.state()?;
        let outcome = pull(
            &fixture.local,
            &fixture.remote,
            &mut state,
            &PullRequest {
                reference: APP,
                ..PullRequest::default()
            },
            &fixture.cancellable,
        )?;
        assert_eq!(outcome.checksum, checksum);
        assert_eq!(
            fixture.local.resolve_rev(&format!("origin:{APP}"), false)?,
            Some(checksum.clone())
        );
        let (_, commit_state) = fixture.local.load_commit(&checksum)?;
        assert_eq!(commit_state, refdeploy_store::CommitState::Complete);
        Ok(())
    }

    #[test]
    fn older_commits_are_rejected_as_downgrades() -> Result<()> {
        let fixture = Fixture::new()?;
        let old = fixture.commit(APP, 100, &[APP])?;
        let new = fixture.commit(APP, 200, &[APP])?;
        let mut state = fixture.state()?;
        pull(
            &fixture.local,
            &fixture.remote,
            &mut state,
            &PullRequest {
                reference: APP,
                ..PullRequest::default()
            },
            &fixture.cancellable,
        )?;

        let request = PullRequest {
            reference: APP,
            commit: Some(&old),
            ..PullRequest::default()
        };
        let err = pull(&fixture.local, &fixture.remote, &mut state, &request, &fixture.cancellable)
            .unwrap_err();
        assert_eq!(find_deploy_error(&err).map(DeployError::kind), Some(ErrorKind::Downgrade));
        assert_eq!(
            fixture.local.resolve_rev(&format!("origin:{APP}"), false)?,
            Some(new),
            "ref is unchanged"
        );

        let allowed = PullRequest {
            allow_downgrade: true,
            ..request
        };
        let outcome = pull(&fixture.local, &fixture.remote, &mut state, &allowed, &fixture.cancellable)?;
        assert_eq!(outcome.checksum, old);
        Ok(())
    }

    #[test]
    fn unreadable_current_commit_fails_the_downgrade_check() -> Result<()> {
        let fixture = Fixture::new()?;
        let new = fixture.commit(APP, 200, &[APP])?;
        let missing = "ab".repeat(32);
        fixture
            .local
            .set_ref_immediate(Some("origin"), APP, Some(&missing))?;

        let err = check_downgrade(&fixture.local, "origin", APP, &new).unwrap_err();
        assert_ne!(find_deploy_error(&err).map(DeployError::kind), Some(ErrorKind::Downgrade));
        assert!(format!("{err:#}").contains("current commit"), "{err:#}");

        let old = fixture.commit(APP, 100, &[APP])?;
        let err = check_downgrade_from(&fixture.remote_repo, &new, &fixture.remote_repo, &old, APP).unwrap_err();
        assert_eq!(find_deploy_error(&err).map(DeployError::kind), Some(ErrorKind::Downgrade));
        check_downgrade_from(&fixture.remote_repo, &old, &fixture.remote_repo, &new, APP)?;
        Ok(())
    }

    #[test]
    fn commits_bound_to_other_refs_are_rejected() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.commit(APP, 100, &["app/org.evil.App/x86_64/stable"])?;
        let mut state = fixture.state()?;
        let err = pull(
            &fixture.local,
            &fixture.remote,
            &mut state,
            &PullRequest {
                reference: APP,
                ..PullRequest::default()
            },
            &fixture.cancellable,
        )
        .unwrap_err();
        assert_eq!(find_deploy_error(&err).map(DeployError::kind), Some(ErrorKind::InvalidData));
        assert_eq!(fixture.local.resolve_rev(&format!("origin:{APP}"), true)?, None);
        Ok(())
    }

    #[test]
    fn metadata_mismatch_is_permission_denied() -> Result<()> {
        let fixture = Fixture::new()?;
        fixture.commit(APP, 100, &[APP])?;
        let mut state = fixture.state()?;
        let err = pull(
            &fixture.local,
            &fixture.remote,
            &mut state,
            &PullRequest {
                reference: APP,
                require_metadata: Some("[Application]\nname=org.other.App\n"),
                ..PullRequest::default()
            },
            &fixture.cancellable,
        )
        .unwrap_err();
        assert_eq!(
            find_deploy_error(&err).map(DeployError::kind),
            Some(ErrorKind::PermissionDenied)
        );
        Ok(())
    }

    #[test]
    fn subpath_pulls_leave_the_commit_partial() -> Result<()> {
        let fixture = Fixture::new()?;
        let checksum = fixture.commit(APP, 100, &[APP])?;
        let mut state = fixture.state()?;
        let subpaths = vec!["share".to_string()];
        pull(
            &fixture.local,
            &fixture.remote,
            &mut state,
            &PullRequest {
                reference: APP,
                subpaths: &subpaths,
                ..PullRequest::default()
            },
            &fixture.cancellable,
        )?;
        let (_, commit_state) = fixture.local.load_commit(&checksum)?;
        assert_eq!(commit_state, refdeploy_store::CommitState::Partial);
        assert_eq!(subdirs_for(&subpaths), vec!["/metadata", "/files/share"]);
        Ok(())
    }

    #[test]
    fn untrusted_local_pulls_need_verification_and_binding() -> Result<()> {
        let fixture = Fixture::new()?;
        let checksum = fixture.commit(APP, 100, &[APP])?;
        let source = fixture.tmp.path().join("remote");

        let err = pull_untrusted_local(&fixture.local, &fixture.remote, &source, APP, false, &fixture.cancellable)
            .unwrap_err();
        assert_eq!(find_deploy_error(&err).map(DeployError::kind), Some(ErrorKind::Untrusted));

        let signer = Ed25519Signer::from_seed(&[9; 32]);
        let mut remote = fixture.remote.clone();
        remote.gpg_verify = true;
        remote.gpg_verify_summary = true;
        remote.sign_keys = vec![signer.public_key_base64()];
        let mut config = fixture.local.config();
        remote.apply_to(&mut config);
        fixture.local.write_config(&config)?;

        let unsigned = pull_untrusted_local(&fixture.local, &remote, &source, APP, false, &fixture.cancellable);
        assert!(unsigned.is_err(), "unsigned commits are refused");

        let data = fixture.remote_repo.read_object(ObjectType::Commit, &checksum)?;
        fixture
            .remote_repo
            .write_commit_detached_metadata(&checksum, Some(&signer.sign(&data)))?;
        let pulled = pull_untrusted_local(&fixture.local, &remote, &source, APP, false, &fixture.cancellable)?;
        assert_eq!(pulled, checksum);
        assert_eq!(
            fixture.local.resolve_rev(&format!("origin:{APP}"), false)?,
            Some(checksum)
        );
        Ok(())
    }
}
