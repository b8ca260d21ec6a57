//! The on-disk deployment tree.
//!
//! Layout below an installation base:
//!
//! ```text
//! <kind>/<id>/<arch>/<branch>/active -> <checkout>
//! <kind>/<id>/<arch>/<branch>/<checkout>/{files,export,metadata,deploy}
//! app/<id>/current -> <arch>/<branch>
//! .removed/<id>-<checkout>[-<suffix>]
//! ```
//!
//! A checkout is built in a sibling temp dir, synced, and renamed into place.
//! The `active` link is only ever replaced by renaming a new link over it.
//! Callers hold the installation's directory lock.

pub mod appdata;
pub mod appstream;
pub mod data;
pub mod export;
pub mod extra;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use refdeploy_domain::{
    AppMetadata, DeployData, DeployError, InstalledContext, Ref, RefKind,
};
use refdeploy_store::commit::{META_XA_INSTALLED_SIZE, META_XA_METADATA, META_XA_REF};
use refdeploy_store::{sha256_hex, Cancellable, CheckoutOptions, Commit, ContentStore};
use tracing::{debug, info, warn};

pub use data::{load_deploy_data, read_deploy_data, DEPLOY_FILE, METADATA_FILE};

use crate::core::fs::{
    random_suffix, read_link_name, remove_dir_all_writable, remove_empty_dirs_up_to,
    remove_file_if_exists, replace_symlink, touch, TempCheckout,
};
use crate::core::locks::is_path_locked;
use crate::core::sandbox::SandboxRunner;

pub const ACTIVE_LINK: &str = "active";
pub const CURRENT_LINK: &str = "current";
pub const REMOVED_DIR: &str = ".removed";
pub const DOT_REF: &str = "files/.ref";
const TMP_PREFIX: &str = ".deploy-";

pub fn ref_dir(base: &Path, reference: &Ref) -> PathBuf {
    base.join(reference.deploy_subdir())
}

/// Directory name of a checkout; partial installs get a subpath suffix so
/// a different subset of the same commit can be deployed next to it.
pub fn checkout_name(checksum: &str, subpaths: &[String]) -> String {
    if subpaths.is_empty() {
        return checksum.to_string();
    }
    let mut sorted: Vec<&str> = subpaths.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let digest = sha256_hex(sorted.join("\n").as_bytes());
    format!("{checksum}-{}", &digest[..8])
}

/// Store ref that keeps a deployed commit reachable.
pub fn deploy_ref_name(reference: &Ref) -> String {
    format!("deploy/{reference}")
}

/// Name of the active checkout, if the link points at an existing directory.
pub fn active_checkout(base: &Path, reference: &Ref) -> Result<Option<String>> {
    let dir = ref_dir(base, reference);
    let Some(name) = read_link_name(&dir.join(ACTIVE_LINK))? else {
        return Ok(None);
    };
    Ok(dir.join(&name).is_dir().then_some(name))
}

/// Path of the active (or named) checkout when it exists.
pub fn get_if_deployed(base: &Path, reference: &Ref, checkout: Option<&str>) -> Option<PathBuf> {
    let dir = ref_dir(base, reference);
    let path = match checkout {
        Some(name) => dir.join(name),
        None => dir.join(ACTIVE_LINK),
    };
    path.join(DEPLOY_FILE).is_file().then(|| {
        fs::canonicalize(&path).unwrap_or(path)
    })
}

/// Checkout directories present for `reference`, sorted.
pub fn list_checkouts(base: &Path, reference: &Ref) -> Result<Vec<String>> {
    let dir = ref_dir(base, reference);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to list {}", dir.display())),
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|ty| ty.is_dir()))
        .filter_map(|entry| entry.file_name().to_str().map(ToOwned::to_owned))
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    Ok(names)
}

fn child_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|ty| ty.is_dir()))
        .filter_map(|entry| entry.file_name().to_str().map(ToOwned::to_owned))
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    names
}

/// Every ref with an active deployment under `base`.
pub fn list_deployed(base: &Path, kind: Option<RefKind>) -> Result<Vec<Ref>> {
    let kinds = match kind {
        Some(kind) => vec![kind],
        None => vec![RefKind::App, RefKind::Runtime],
    };
    let mut refs = Vec::new();
    for kind in kinds {
        let kind_dir = base.join(kind.as_str());
        for id in child_names(&kind_dir) {
            for arch in child_names(&kind_dir.join(&id)) {
                for branch in child_names(&kind_dir.join(&id).join(&arch)) {
                    let Ok(reference) = Ref::new(kind, &id, &arch, &branch) else {
                        debug!(%id, %arch, %branch, "skipping invalid deploy directory");
                        continue;
                    };
                    if active_checkout(base, &reference)?.is_some() {
                        refs.push(reference);
                    }
                }
            }
        }
    }
    refs.sort();
    Ok(refs)
}

/// Shared state for a batch of deploy operations.
pub struct DeployEnv<'a> {
    pub base: &'a Path,
    pub repo: &'a dyn ContentStore,
    pub sandbox: &'a dyn SandboxRunner,
    /// Other installations searched for the runtime `apply_extra` runs against.
    pub runtime_bases: &'a [PathBuf],
    /// Where already-installed launchers live, for app renames.
    pub launcher_dir: Option<&'a Path>,
    pub cancellable: &'a Cancellable,
}

#[derive(Clone, Debug)]
pub struct DeployRequest<'a> {
    pub reference: &'a Ref,
    pub origin: &'a str,
    /// Deploy this commit instead of what `origin:ref` points at.
    pub checksum: Option<&'a str>,
    /// `None` inherits the current deployment's subpaths on update.
    pub subpaths: Option<&'a [String]>,
    pub previous_ids: &'a [String],
    /// The commit was resolved from a signed listing.
    pub signed_summary: bool,
}

impl<'a> DeployRequest<'a> {
    pub fn new(reference: &'a Ref, origin: &'a str) -> Self {
        Self {
            reference,
            origin,
            checksum: None,
            subpaths: None,
            previous_ids: &[],
            signed_summary: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Deployment {
    pub reference: Ref,
    pub checksum: String,
    pub checkout: String,
    pub dir: PathBuf,
    pub data: DeployData,
}

fn resolve_checksum(repo: &dyn ContentStore, request: &DeployRequest<'_>, reference: &Ref) -> Result<String> {
    if let Some(checksum) = request.checksum {
        return Ok(checksum.to_string());
    }
    repo.resolve_rev(&format!("{}:{reference}", request.origin), true)
        .map_err(DeployError::from)?
        .ok_or_else(|| {
            DeployError::RefNotFound {
                reference: reference.to_string(),
                remote: Some(request.origin.to_string()),
            }
            .into()
        })
}

/// The commit must be bound to `reference`. A signed listing may move a
/// ref between branches, so only the branch is allowed to differ there.
fn verify_ref_binding(commit: &Commit, checksum: &str, reference: &Ref, signed_summary: bool) -> Result<()> {
    let mut bound = commit.ref_bindings();
    if let Some(xa_ref) = commit.meta_str(META_XA_REF) {
        bound.push(xa_ref.to_string());
    }
    let wanted = reference.to_string();
    if bound.is_empty() || bound.contains(&wanted) {
        return Ok(());
    }
    let branch_only = bound.iter().filter_map(|b| b.parse::<Ref>().ok()).any(|b| {
        b.kind() == reference.kind() && b.id() == reference.id() && b.arch() == reference.arch()
    });
    if signed_summary && branch_only {
        warn!(reference = %reference, %checksum, bound = %bound.join(", "), "deploying commit bound to another branch");
        return Ok(());
    }
    Err(DeployError::invalid_data(format!(
        "deployed ref {wanted} does not match commit {checksum} (bound to {})",
        bound.join(", ")
    ))
    .into())
}

fn checkout_commit(
    env: &DeployEnv<'_>,
    checksum: &str,
    dest: &Path,
    subpaths: &[String],
) -> Result<()> {
    let checkout = |subpath: Option<String>, target: &Path| -> Result<()> {
        let options = CheckoutOptions {
            subpath,
            overwrite_union: true,
            bareuseronly: true,
        };
        env.repo
            .checkout(checksum, target, &options, env.cancellable)
            .map_err(DeployError::from)
            .with_context(|| format!("failed to check out {checksum} into {}", target.display()))
    };
    if subpaths.is_empty() {
        checkout(None, dest)?;
    } else {
        checkout(Some("/metadata".into()), &dest.join(METADATA_FILE))?;
        for subpath in subpaths {
            let relative = subpath.trim_matches('/');
            let target = dest.join("files").join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            checkout(Some(format!("/files/{relative}")), &target)?;
        }
    }
    fs::create_dir_all(dest.join("files"))
        .with_context(|| format!("failed to create files dir in {}", dest.display()))?;
    Ok(())
}

fn runtime_files(env: &DeployEnv<'_>, metadata: &AppMetadata, reference: &Ref) -> Result<Option<PathBuf>> {
    if metadata.extra_data_no_runtime {
        return Ok(None);
    }
    let Some(runtime) = metadata.runtime_ref()? else {
        return Ok(None);
    };
    std::iter::once(env.base.to_path_buf())
        .chain(env.runtime_bases.iter().cloned())
        .find_map(|base| get_if_deployed(&base, &runtime, None))
        .map(|dir| Some(dir.join("files")))
        .ok_or_else(|| {
            DeployError::NotInstalled(format!(
                "runtime {runtime} needed to apply extra data for {reference}"
            ))
            .into()
        })
}

fn installed_size(repo: &dyn ContentStore, commit: &Commit, checksum: &str, partial: bool) -> u64 {
    if let Some(size) = commit.meta_u64_be(META_XA_INSTALLED_SIZE) {
        return size;
    }
    if partial {
        return 0;
    }
    repo.commit_content_size(checksum).unwrap_or_else(|err| {
        debug!(%checksum, %err, "installed size unknown");
        0
    })
}

/// Check out, verify and publish one commit, and make it active.
pub fn deploy(env: &DeployEnv<'_>, request: &DeployRequest<'_>) -> Result<Deployment> {
    let reference = request.reference;
    let checksum = resolve_checksum(env.repo, request, reference)?;
    let subpaths = request.subpaths.unwrap_or_default();
    let name = checkout_name(&checksum, subpaths);
    let dir = ref_dir(env.base, reference);
    let final_path = dir.join(&name);
    if final_path.exists() {
        return Err(DeployError::AlreadyInstalled {
            reference: reference.to_string(),
            context: InstalledContext::SameCommit,
        }
        .into());
    }
    let (commit, _) = env
        .repo
        .load_commit(&checksum)
        .map_err(DeployError::from)
        .with_context(|| format!("failed to load commit {checksum} for {reference}"))?;

    let tmp = TempCheckout::new_in(&dir, TMP_PREFIX)?;
    let staging = tmp.path();
    checkout_commit(env, &checksum, staging, subpaths)?;

    let metadata_text = fs::read_to_string(staging.join(METADATA_FILE))
        .with_context(|| format!("{reference} has no metadata"))?;
    let metadata = AppMetadata::parse(&metadata_text)?;

    if extra::extract_extra_data(env.repo, &checksum, &commit, staging)? {
        let runtime = runtime_files(env, &metadata, reference)?;
        extra::apply_extra_data(env.sandbox, staging, reference, runtime.as_deref())?;
    }

    verify_ref_binding(&commit, &checksum, reference, request.signed_summary)?;
    if let Some(declared) = commit.meta_str(META_XA_METADATA) {
        if declared != metadata_text {
            return Err(DeployError::invalid_data(format!(
                "deployed metadata of {reference} does not match commit {checksum}"
            ))
            .into());
        }
    }

    if reference.is_app() {
        export::populate_export(staging, reference.id())?;
        export::add_renamed_from(&staging.join("export"), request.previous_ids)?;
    } else {
        fs::create_dir_all(staging.join("export"))
            .with_context(|| format!("failed to create export dir for {reference}"))?;
    }
    fs::write(staging.join(DOT_REF), b"")
        .with_context(|| format!("failed to create {DOT_REF} for {reference}"))?;

    let mut deploy_data = DeployData::new(
        request.origin,
        &checksum,
        subpaths.to_vec(),
        installed_size(env.repo, &commit, &checksum, !subpaths.is_empty()),
    );
    data::derive_all(&mut deploy_data, &commit, staging, reference);
    deploy_data.set_previous_ids(request.previous_ids);
    data::write_deploy_data(staging, &deploy_data)?;

    tmp.publish(&final_path)?;
    replace_symlink(Path::new(&name), &dir.join(ACTIVE_LINK))?;
    env.repo
        .set_ref_immediate(None, &deploy_ref_name(reference), Some(&checksum))
        .map_err(DeployError::from)?;

    if reference.is_app() && !request.previous_ids.is_empty() {
        if let Some(launchers) = env.launcher_dir {
            if let Err(err) = export::rename_launchers(launchers, reference.id(), request.previous_ids) {
                warn!(reference = %reference, error = %format!("{err:#}"), "failed to migrate launchers");
            }
        }
    }
    info!(reference = %reference, %checksum, origin = %request.origin, "deployed");
    Ok(Deployment {
        reference: reference.clone(),
        checksum,
        checkout: name,
        dir: final_path,
        data: deploy_data,
    })
}

fn set_current(base: &Path, reference: &Ref) -> Result<()> {
    if !reference.is_app() {
        return Ok(());
    }
    let link = base.join("app").join(reference.id()).join(CURRENT_LINK);
    let target = Path::new(reference.arch()).join(reference.branch());
    replace_symlink(&target, &link)
}

/// Fresh install. An existing deployment is an error unless `reinstall`,
/// in which case it is removed first.
pub fn deploy_install(env: &DeployEnv<'_>, request: &DeployRequest<'_>, reinstall: bool) -> Result<Deployment> {
    let reference = request.reference;
    if let Some(active) = active_checkout(env.base, reference)? {
        if !reinstall {
            let old = read_deploy_data(&ref_dir(env.base, reference).join(&active))?;
            let wanted = resolve_checksum(env.repo, request, reference).ok();
            let context = if wanted.as_deref() == Some(old.commit.as_str()) {
                InstalledContext::SameCommit
            } else {
                InstalledContext::OtherCommit
            };
            return Err(DeployError::AlreadyInstalled {
                reference: reference.to_string(),
                context,
            }
            .into());
        }
        undeploy_all(env.base, env.repo, reference)?;
    }
    let deployment = deploy(env, request)?;
    set_current(env.base, reference)?;
    Ok(deployment)
}

/// Deploy a new commit next to the active one, then retire the old one.
pub fn deploy_update(env: &DeployEnv<'_>, request: &DeployRequest<'_>) -> Result<Deployment> {
    let reference = request.reference;
    let old_name = active_checkout(env.base, reference)?
        .ok_or_else(|| DeployError::NotInstalled(reference.to_string()))?;
    let old = read_deploy_data(&ref_dir(env.base, reference).join(&old_name))?;

    let subpaths = request.subpaths.unwrap_or(old.subpaths.as_slice());
    let mut previous_ids = old.previous_ids();
    for id in request.previous_ids {
        if !previous_ids.contains(id) {
            previous_ids.push(id.clone());
        }
    }
    let checksum = resolve_checksum(env.repo, request, reference)?;
    if checkout_name(&checksum, subpaths) == old_name {
        return Err(DeployError::AlreadyInstalled {
            reference: reference.to_string(),
            context: InstalledContext::SameCommit,
        }
        .into());
    }
    let deployment = deploy(
        env,
        &DeployRequest {
            checksum: Some(&checksum),
            subpaths: Some(subpaths),
            previous_ids: &previous_ids,
            ..request.clone()
        },
    )?;
    undeploy(env.base, env.repo, reference, &old_name, true)?;
    Ok(deployment)
}

fn quarantine_path(base: &Path, reference: &Ref, checkout: &str) -> PathBuf {
    let removed = base.join(REMOVED_DIR);
    let candidate = removed.join(format!("{}-{checkout}", reference.id()));
    if !candidate.exists() {
        return candidate;
    }
    loop {
        let candidate = removed.join(format!("{}-{checkout}-{}", reference.id(), random_suffix(6)));
        if !candidate.exists() {
            return candidate;
        }
    }
}

/// Remove one checkout. When it is the active one, `active` is first moved
/// to another checkout, or removed if none is left.
pub fn undeploy(
    base: &Path,
    repo: &dyn ContentStore,
    reference: &Ref,
    checkout: &str,
    is_update: bool,
) -> Result<()> {
    let dir = ref_dir(base, reference);
    let checkout_dir = dir.join(checkout);
    if !checkout_dir.is_dir() {
        return Err(DeployError::NotInstalled(format!("{reference} commit {checkout}")).into());
    }

    let active = active_checkout(base, reference)?;
    if active.as_deref() == Some(checkout) {
        let other = list_checkouts(base, reference)?
            .into_iter()
            .find(|name| name != checkout);
        match other {
            Some(other) => replace_symlink(Path::new(&other), &dir.join(ACTIVE_LINK))?,
            None => remove_file_if_exists(&dir.join(ACTIVE_LINK))?,
        }
    }

    let removed = quarantine_path(base, reference, checkout);
    fs::create_dir_all(base.join(REMOVED_DIR))
        .with_context(|| format!("failed to create {}", base.join(REMOVED_DIR).display()))?;
    fs::rename(&checkout_dir, &removed).with_context(|| {
        format!(
            "failed to move {} to {}",
            checkout_dir.display(),
            removed.display()
        )
    })?;
    touch(&removed.join(if is_update { ".updated" } else { ".removed" }))?;

    if is_path_locked(&removed.join(DOT_REF)) {
        info!(reference = %reference, path = %removed.display(), "deployment in use, deferring removal");
    } else {
        remove_dir_all_writable(&removed)?;
    }

    if active_checkout(base, reference)?.is_none() {
        repo.set_ref_immediate(None, &deploy_ref_name(reference), None)
            .map_err(DeployError::from)?;
        remove_file_if_exists(&dir.join(ACTIVE_LINK))?;
        remove_empty_dirs_up_to(&dir, base);
        if reference.is_app() {
            clear_current(base, reference)?;
        }
    }
    debug!(reference = %reference, checkout, is_update, "undeployed");
    Ok(())
}

fn clear_current(base: &Path, reference: &Ref) -> Result<()> {
    let app_dir = base.join("app").join(reference.id());
    let link = app_dir.join(CURRENT_LINK);
    let points_here = fs::read_link(&link)
        .is_ok_and(|target| target == Path::new(reference.arch()).join(reference.branch()));
    if points_here {
        remove_file_if_exists(&link)?;
        remove_empty_dirs_up_to(&app_dir, base);
    }
    Ok(())
}

/// Remove every checkout of `reference`, the active one last.
pub fn undeploy_all(base: &Path, repo: &dyn ContentStore, reference: &Ref) -> Result<()> {
    let active = active_checkout(base, reference)?;
    for name in list_checkouts(base, reference)? {
        if Some(&name) != active.as_ref() {
            undeploy(base, repo, reference, &name, false)?;
        }
    }
    if let Some(active) = active {
        undeploy(base, repo, reference, &active, false)?;
    }
    Ok(())
}

/// Delete quarantined checkouts no process holds open anymore.
pub fn cleanup_removed(base: &Path) -> Result<usize> {
    let removed_dir = base.join(REMOVED_DIR);
    let entries = match fs::read_dir(&removed_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("failed to list {}", removed_dir.display())),
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if is_path_locked(&path.join(DOT_REF)) {
            debug!(path = %path.display(), "still in use");
            continue;
        }
        match remove_dir_all_writable(&path) {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %path.display(), error = %format!("{err:#}"), "failed to remove quarantined deployment"),
        }
    }
    Ok(removed)
}
