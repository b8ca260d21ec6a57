//! Loading a ref's commit object without pulling its content.

use anyhow::{Context, Result};
use refdeploy_domain::DeployError;
use refdeploy_store::object::relative_object_path;
use refdeploy_store::{join_uri, sha256_hex, Cancellable, Commit, ContentStore, FsRepo, ObjectType};
use tracing::debug;

use super::oci;
use super::state::{RemoteState, ResolvedRef};

/// The commit `resolved` points at, from the local store, a sideload repo,
/// or the network, in that order.
pub fn load_ref_commit(
    repo: &dyn ContentStore,
    state: &RemoteState,
    reference: &str,
    resolved: &ResolvedRef,
    cancellable: &Cancellable,
) -> Result<Commit> {
    let checksum = resolved.checksum.as_str();
    if let Ok((commit, _)) = repo.load_commit(checksum) {
        return Ok(commit);
    }

    for sideload in &state.sideload_repos {
        let Ok(local) = FsRepo::open(&sideload.path, false) else {
            continue;
        };
        if let Ok((commit, _)) = local.load_commit(checksum) {
            debug!(reference, repo = %sideload.path.display(), "commit found in sideload repo");
            return Ok(commit);
        }
    }

    if state.is_oci {
        let summary = state
            .summary_for_ref(reference)
            .ok_or_else(|| DeployError::RefNotFound {
                reference: reference.to_string(),
                remote: Some(state.remote_name.clone()),
            })?;
        let entry = summary
            .lookup(None, reference)
            .ok_or_else(|| DeployError::RefNotFound {
                reference: reference.to_string(),
                remote: Some(state.remote_name.clone()),
            })?;
        let cache = state.lookup_cache(reference)?;
        return Ok(oci::synthetic_commit(reference, entry, cache.as_ref()));
    }

    state.ensure_listing()?;
    let cache = state
        .cache()
        .ok_or_else(|| DeployError::NotCached(format!("commit {checksum}")))?;
    let uri = join_uri(
        state.url.as_str(),
        &relative_object_path(ObjectType::Commit, checksum),
    );
    let data = cache
        .fetcher()
        .fetch(&uri, cancellable)
        .with_context(|| format!("failed to fetch commit {checksum} of {reference}"))?;
    let actual = sha256_hex(&data);
    if actual != checksum {
        return Err(DeployError::invalid_data(format!(
            "commit {checksum} from remote '{}' has checksum {actual}",
            state.remote_name
        ))
        .into());
    }
    let commit = Commit::from_bytes(checksum, &data).map_err(DeployError::from)?;
    let bindings = commit.ref_bindings();
    if !bindings.is_empty() && !bindings.iter().any(|bound| bound == reference) {
        return Err(DeployError::invalid_data(format!(
            "commit {checksum} is not bound to {reference} (bound to {})",
            bindings.join(", ")
        ))
        .into());
    }
    Ok(commit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::remote::config::RemoteConfig;
    use crate::core::remote::filter::FilterCache;
    use crate::core::remote::state::{BuildMode, StateContext};
    use crate::core::summary::{Summary, SummaryCache, SummaryRef};
    use refdeploy_domain::Variant;
    use refdeploy_store::commit::META_REF_BINDING;
    use refdeploy_store::{root_dirmeta_checksum, Fetcher};
    use std::fs;
    use std::sync::Arc;
    use url::Url;

    const APP: &str = "app/org.test.App/x86_64/stable";

    #[test]
    fn fetches_and_checks_remote_commits() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let remote_repo = FsRepo::open(&tmp.path().join("remote"), true)?;
        let mut bound = Commit::new(&"a".repeat(64), &root_dirmeta_checksum(), 7);
        bound
            .metadata
            .insert(META_REF_BINDING.into(), Variant::strv([APP]));
        let good = remote_repo.write_commit(&bound)?;
        let mut other = bound.clone();
        other
            .metadata
            .insert(META_REF_BINDING.into(), Variant::strv(["app/org.other.App/x86_64/stable"]));
        let misbound = remote_repo.write_commit(&other)?;

        let mut summary = Summary::default();
        summary.refs.insert(APP.into(), SummaryRef::new(&good, 0, 7));
        fs::write(tmp.path().join("remote/summary"), summary.to_bytes())?;

        let url = Url::from_directory_path(tmp.path().join("remote"))
            .map_err(|()| anyhow::anyhow!("bad path"))?;
        let mut remote = RemoteConfig::new("origin", url.as_str());
        remote.gpg_verify = false;
        remote.gpg_verify_summary = false;
        let cache = Arc::new(SummaryCache::new(tmp.path().join("cache"), Fetcher::new()));
        let filters = FilterCache::new();
        let cancellable = Cancellable::new();
        let ctx = StateContext {
            cache: &cache,
            filters: &filters,
            repo_path: tmp.path(),
            sideload_dirs: &[],
            default_arch: "x86_64",
            cancellable: &cancellable,
        };
        let state = RemoteState::build(&remote, &ctx, BuildMode::Required)?;
        let local = FsRepo::open(&tmp.path().join("local"), true)?;

        let resolved = state.lookup_ref(APP)?;
        let commit = load_ref_commit(&local, &state, APP, &resolved, &cancellable)?;
        assert_eq!(commit.timestamp, 7);
        assert!(!local.has_commit(&good), "loading does not pull");

        let wrong = ResolvedRef {
            checksum: misbound,
            ..resolved
        };
        let err = load_ref_commit(&local, &state, APP, &wrong, &cancellable).unwrap_err();
        assert!(matches!(
            refdeploy_domain::find_deploy_error(&err),
            Some(DeployError::InvalidData(_))
        ));
        Ok(())
    }
}
