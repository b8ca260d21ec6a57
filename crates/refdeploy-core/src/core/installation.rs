//! One installation directory and every operation on it.
//!
//! ```text
//! <base>/repo/            content store and its config
//! <base>/lock             directory lock (deploy pointers, config)
//! <base>/repo-lock        shared by pulls and deploys, exclusive for prune
//! <base>/.changed         touched after every change
//! <base>/{app,runtime}/   deployments
//! <base>/appstream/       checked-out appstream data
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use refdeploy_domain::{
    find_deploy_error, AppMetadata, DeployData, DeployError, ErrorKind, Ref, RefKind,
    DEPLOY_VERSION_CURRENT,
};
use refdeploy_store::{Cancellable, ContentStore, Fetcher, FsRepo, PruneStats};
use tracing::{debug, info, warn};

use crate::core::config::{summary_cache_dir, CoreConfig, Environment, CORE_GROUP};
use crate::core::deploy::{self, appstream, DeployEnv, Deployment};
use crate::core::deps::{self, UnusedRefsQuery};
use crate::core::fs::{prune_stale_tempdirs, touch, STALE_TMP_AGE};
use crate::core::installer::{DeployArgs, DeployFlags, Installer, LocalInstaller};
use crate::core::locks::{lock_dir, lock_repo_shared, try_lock_repo_exclusive};
use crate::core::pull::{self, PullOutcome, PullRequest};
use crate::core::ref_file::{origin_remote_name, RefFile};
use crate::core::remote::{
    load_remotes, sideload_dirs, BuildMode, FilterCache, RefGlobs, RemoteConfig, RemoteState,
    StateContext,
};
use crate::core::sandbox::{BwrapRunner, SandboxRunner};
use crate::core::summary::SummaryCache;

const REPO_DIR: &str = "repo";
const CHANGED_FILE: &str = ".changed";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    System,
    User,
    /// An extra installation at an arbitrary path.
    Custom,
}

/// Options shared by install and update.
#[derive(Clone, Debug, Default)]
pub struct InstallOptions<'a> {
    pub commit: Option<&'a str>,
    /// `None` installs everything (update: keeps the current subpaths).
    pub subpaths: Option<&'a [String]>,
    pub previous_ids: &'a [String],
    pub no_pull: bool,
    pub no_deploy: bool,
    pub reinstall: bool,
    pub allow_downgrade: bool,
    pub token: Option<&'a str>,
}

#[derive(Clone, Debug, Default)]
pub struct UnusedOptions<'a> {
    pub eol_only: bool,
    pub injected: HashMap<Ref, AppMetadata>,
    pub excluded: &'a [Ref],
}

pub struct Installation {
    base: PathBuf,
    scope: Scope,
    id: String,
    environment: Arc<Environment>,
    repo: FsRepo,
    installer: Arc<dyn Installer>,
    sandbox: Arc<dyn SandboxRunner>,
    cache_root: PathBuf,
    summary_cache: Arc<SummaryCache>,
    filters: FilterCache,
    core_config: Mutex<Option<Arc<CoreConfig>>>,
    cancellable: Cancellable,
}

impl Installation {
    /// Open (creating if needed) the installation at `base`.
    pub fn open(base: &Path, scope: Scope, environment: Arc<Environment>) -> Result<Self> {
        let repo = ensure_repo_at(base)?;
        let cache_root = match scope {
            Scope::User => environment.user_cache_dir.clone(),
            Scope::System | Scope::Custom => base.join(REPO_DIR).join("tmp/cache"),
        };
        let summary_cache = Arc::new(SummaryCache::new(
            summary_cache_dir(&cache_root),
            Fetcher::new(),
        ));
        Ok(Self {
            base: base.to_path_buf(),
            scope,
            id: match scope {
                Scope::System => "default".to_string(),
                Scope::User => "user".to_string(),
                Scope::Custom => base
                    .file_name()
                    .map_or_else(|| "custom".to_string(), |name| name.to_string_lossy().into_owned()),
            },
            environment,
            repo,
            installer: Arc::new(LocalInstaller),
            sandbox: Arc::new(BwrapRunner::default()),
            cache_root,
            summary_cache,
            filters: FilterCache::new(),
            core_config: Mutex::new(None),
            cancellable: Cancellable::new(),
        })
    }

    pub fn system(environment: Arc<Environment>) -> Result<Self> {
        let base = environment.system_dir.clone();
        Self::open(&base, Scope::System, environment)
    }

    pub fn user(environment: Arc<Environment>) -> Result<Self> {
        let base = environment.user_dir.clone();
        Self::open(&base, Scope::User, environment)
    }

    #[must_use]
    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = installer;
        self
    }

    #[must_use]
    pub fn with_sandbox(mut self, sandbox: Arc<dyn SandboxRunner>) -> Self {
        self.sandbox = sandbox;
        self
    }

    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Fetcher) -> Self {
        self.summary_cache = Arc::new(SummaryCache::new(summary_cache_dir(&self.cache_root), fetcher));
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn repo(&self) -> &dyn ContentStore {
        &self.repo
    }

    pub fn cancellable(&self) -> &Cancellable {
        &self.cancellable
    }

    /// Create the repo if it is missing.
    pub fn ensure_repo(&self) -> Result<()> {
        ensure_repo_at(&self.base).map(|_| ())
    }

    /// Parsed `[core]` values, cached until the config is written again.
    pub fn core_config(&self) -> Arc<CoreConfig> {
        let mut guard = self
            .core_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = guard.as_ref() {
            return Arc::clone(cached);
        }
        let parsed = Arc::new(CoreConfig::from_keyfile(&self.repo.config()));
        *guard = Some(Arc::clone(&parsed));
        parsed
    }

    fn invalidate_config(&self) {
        *self
            .core_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Set a `[core]` list value such as `xa.pinned`.
    pub fn set_core_list(&self, key: &str, values: &[String]) -> Result<()> {
        let _lock = lock_dir(&self.base)?;
        let mut config = self.repo.config();
        if values.is_empty() {
            config.remove_key(CORE_GROUP, key);
        } else {
            config.set_string_list(CORE_GROUP, key, values);
        }
        self.repo
            .write_config(&config)
            .map_err(DeployError::from)?;
        self.invalidate_config();
        Ok(())
    }

    pub fn remotes(&self) -> Vec<RemoteConfig> {
        load_remotes(&self.repo.config())
    }

    pub fn remote(&self, name: &str) -> Result<RemoteConfig> {
        RemoteConfig::from_keyfile(&self.repo.config(), name)
            .ok_or_else(|| DeployError::RemoteNotFound(name.to_string()).into())
    }

    /// Touch `.changed` so watchers notice.
    pub fn mark_changed(&self) -> Result<()> {
        touch(&self.base.join(CHANGED_FILE))
    }

    fn runtime_bases(&self) -> Vec<PathBuf> {
        match self.scope {
            Scope::User => vec![self.environment.system_dir.clone()],
            Scope::System | Scope::Custom => Vec::new(),
        }
    }

    fn launcher_dir(&self) -> Option<PathBuf> {
        match self.scope {
            Scope::User => self
                .environment
                .user_dir
                .parent()
                .map(|data_home| data_home.join("applications")),
            Scope::System | Scope::Custom => None,
        }
    }

    fn with_deploy_env<T>(&self, body: impl FnOnce(&DeployEnv<'_>) -> Result<T>) -> Result<T> {
        let runtime_bases = self.runtime_bases();
        let launcher_dir = self.launcher_dir();
        let env = DeployEnv {
            base: &self.base,
            repo: &self.repo,
            sandbox: self.sandbox.as_ref(),
            runtime_bases: &runtime_bases,
            launcher_dir: launcher_dir.as_deref(),
            cancellable: &self.cancellable,
        };
        body(&env)
    }

    fn remote_state(&self, remote: &RemoteConfig) -> Result<RemoteState> {
        let sideloads = sideload_dirs(&self.base, &self.environment.sideload_run_dir());
        let ctx = StateContext {
            cache: &self.summary_cache,
            filters: &self.filters,
            repo_path: self.repo.path(),
            sideload_dirs: &sideloads,
            default_arch: &self.environment.default_arch,
            cancellable: &self.cancellable,
        };
        RemoteState::build(remote, &ctx, BuildMode::Required)
    }

    /// Pull into the installation repo, or into a child repo when the
    /// installer needs one. Returns the child repo alongside the outcome.
    fn pull_ref(
        &self,
        remote: &RemoteConfig,
        request: &PullRequest<'_>,
    ) -> Result<(PullOutcome, Option<tempfile::TempDir>)> {
        let mut state = self.remote_state(remote)?;
        if !self.installer.needs_child_repo() {
            let outcome = pull::pull(&self.repo, remote, &mut state, request, &self.cancellable)?;
            return Ok((outcome, None));
        }
        fs::create_dir_all(&self.cache_root)
            .with_context(|| format!("failed to create {}", self.cache_root.display()))?;
        let child_dir = tempfile::Builder::new()
            .prefix("repo-")
            .tempdir_in(&self.cache_root)
            .with_context(|| format!("failed to create child repo in {}", self.cache_root.display()))?;
        let child = FsRepo::open(child_dir.path(), true).map_err(DeployError::from)?;
        let mut config = child.config();
        remote.apply_to(&mut config);
        child.write_config(&config).map_err(DeployError::from)?;
        match pull::pull(&child, remote, &mut state, request, &self.cancellable) {
            Ok(outcome) => {
                if !request.allow_downgrade {
                    self.check_child_downgrade(&child, remote, request, &outcome.checksum)?;
                }
                Ok((outcome, Some(child_dir)))
            }
            Err(err) => {
                if find_deploy_error(&err).map(DeployError::kind) == Some(ErrorKind::Cancelled) {
                    if let Err(cancel_err) = self.installer.cancel_pull(child_dir.path(), false) {
                        warn!(error = %format!("{cancel_err:#}"), "failed to cancel helper pull");
                    }
                }
                Err(err)
            }
        }
    }

    /// Child repos start empty; compare against the installation repo.
    fn check_child_downgrade(
        &self,
        child: &FsRepo,
        remote: &RemoteConfig,
        request: &PullRequest<'_>,
        new_checksum: &str,
    ) -> Result<()> {
        let current = match request.upgrade_from {
            Some(commit) => Some(commit.to_string()),
            None => self
                .repo
                .resolve_rev(&format!("{}:{}", remote.name, request.reference), true)
                .map_err(DeployError::from)?,
        };
        match current {
            Some(current) => pull::check_downgrade_from(&self.repo, &current, child, new_checksum, request.reference),
            None => Ok(()),
        }
    }

    fn refuse_helper_downgrade(&self, reference: &Ref, options: &InstallOptions<'_>) -> Result<()> {
        if options.allow_downgrade && self.installer.needs_child_repo() {
            return Err(DeployError::PermissionDenied(format!(
                "downgrading {reference} is not allowed through the system helper"
            ))
            .into());
        }
        Ok(())
    }

    /// Pull `reference` from `remote` and deploy it.
    pub fn install(&self, remote_name: &str, reference: &Ref, options: &InstallOptions<'_>) -> Result<Option<DeployData>> {
        let remote = self.remote(remote_name)?;
        if remote.disabled {
            return Err(DeployError::RemoteNotFound(format!("{remote_name} (disabled)")).into());
        }
        self.refuse_helper_downgrade(reference, options)?;
        let _repo_lock = lock_repo_shared(&self.base)?;
        let reference_text = reference.to_string();
        let subpaths = options.subpaths.unwrap_or_default();

        let mut checksum = options.commit.map(ToOwned::to_owned);
        let mut child = None;
        let mut signed_summary = false;
        if !options.no_pull {
            let request = PullRequest {
                reference: &reference_text,
                commit: options.commit,
                subpaths,
                token: options.token,
                allow_downgrade: options.allow_downgrade,
                ..PullRequest::default()
            };
            let (outcome, child_dir) = self.pull_ref(&remote, &request)?;
            info!(reference = %reference, remote = remote_name, checksum = %outcome.checksum, "pulled");
            checksum = Some(outcome.checksum);
            child = child_dir;
            signed_summary = remote.gpg_verify_summary;
        }
        if options.no_deploy {
            return Ok(None);
        }

        let _dir_lock = lock_dir(&self.base)?;
        let old_origin = self.deployed_origin(reference);
        let flags = DeployFlags {
            reinstall: options.reinstall,
            signed_summary,
            ..DeployFlags::default()
        };
        let args = DeployArgs {
            source_repo: child.as_ref().map(tempfile::TempDir::path),
            reference,
            origin: remote_name,
            checksum: checksum.as_deref(),
            subpaths: options.subpaths,
            previous_ids: options.previous_ids,
            flags,
        };
        self.with_deploy_env(|env| self.installer.deploy(env, &args))?;

        if let Some(old_origin) = old_origin.filter(|old| old != remote_name) {
            self.installer
                .remove_local_ref(&self.repo, &old_origin, &reference_text)?;
            self.prune_origin_remote(&old_origin)?;
        }
        self.mark_changed()?;
        self.load_deploy_data(reference, DEPLOY_VERSION_CURRENT).map(Some)
    }

    /// Pull the newest commit of an installed ref from its origin and
    /// deploy it. `None` means it was already current.
    pub fn update(&self, reference: &Ref, options: &InstallOptions<'_>) -> Result<Option<DeployData>> {
        self.refuse_helper_downgrade(reference, options)?;
        let current = self.load_deploy_data(reference, DEPLOY_VERSION_CURRENT)?;
        let remote = self.remote(&current.origin)?;
        let _repo_lock = lock_repo_shared(&self.base)?;
        let reference_text = reference.to_string();
        let subpaths = options.subpaths.unwrap_or(current.subpaths.as_slice());

        let mut checksum = options.commit.map(ToOwned::to_owned);
        let mut child = None;
        let mut signed_summary = false;
        if !options.no_pull {
            let request = PullRequest {
                reference: &reference_text,
                commit: options.commit,
                subpaths,
                upgrade_from: Some(&current.commit),
                token: options.token,
                allow_downgrade: options.allow_downgrade,
                ..PullRequest::default()
            };
            let (outcome, child_dir) = self.pull_ref(&remote, &request)?;
            checksum = Some(outcome.checksum);
            child = child_dir;
            signed_summary = remote.gpg_verify_summary;
        }
        if options.no_deploy {
            return Ok(None);
        }

        let _dir_lock = lock_dir(&self.base)?;
        let args = DeployArgs {
            source_repo: child.as_ref().map(tempfile::TempDir::path),
            reference,
            origin: &current.origin,
            checksum: checksum.as_deref(),
            subpaths: Some(subpaths),
            previous_ids: options.previous_ids,
            flags: DeployFlags {
                update: true,
                signed_summary,
                ..DeployFlags::default()
            },
        };
        match self.with_deploy_env(|env| self.installer.deploy(env, &args)) {
            Ok(()) => {}
            Err(err) if find_deploy_error(&err).map(DeployError::kind) == Some(ErrorKind::AlreadyInstalled) => {
                debug!(reference = %reference, "already up to date");
                return Ok(None);
            }
            Err(err) => return Err(err),
        }
        self.mark_changed()?;
        self.load_deploy_data(reference, DEPLOY_VERSION_CURRENT).map(Some)
    }

    /// Remove a deployed ref. Runtimes still used by an installed app are
    /// refused unless `force_remove`.
    pub fn uninstall(&self, reference: &Ref, force_remove: bool) -> Result<()> {
        let _dir_lock = lock_dir(&self.base)?;
        let data = self.load_deploy_data(reference, DEPLOY_VERSION_CURRENT)?;
        if reference.kind() == RefKind::Runtime && !force_remove {
            let used_by = deps::apps_using_runtime(&[self.base.as_path()], reference);
            if !used_by.is_empty() {
                return Err(DeployError::RuntimeUsed {
                    runtime: reference.to_string(),
                    used_by: used_by.iter().map(ToString::to_string).collect(),
                }
                .into());
            }
        }
        self.with_deploy_env(|env| self.installer.uninstall(env, reference))?;
        self.installer
            .remove_local_ref(&self.repo, &data.origin, &reference.to_string())?;
        self.prune_origin_remote(&data.origin)?;
        self.mark_changed()?;
        info!(reference = %reference, "uninstalled");
        Ok(())
    }

    fn deployed_origin(&self, reference: &Ref) -> Option<String> {
        let dir = deploy::get_if_deployed(&self.base, reference, None)?;
        deploy::read_deploy_data(&dir).ok().map(|data| data.origin)
    }

    pub fn list_deployed(&self, kind: Option<RefKind>) -> Result<Vec<Ref>> {
        deploy::list_deployed(&self.base, kind)
    }

    pub fn get_if_deployed(&self, reference: &Ref, checkout: Option<&str>) -> Option<PathBuf> {
        deploy::get_if_deployed(&self.base, reference, checkout)
    }

    pub fn load_deploy_data(&self, reference: &Ref, required_version: i32) -> Result<DeployData> {
        let dir = self
            .get_if_deployed(reference, None)
            .ok_or_else(|| DeployError::NotInstalled(reference.to_string()))?;
        deploy::load_deploy_data(&self.repo, &dir, reference, required_version)
    }

    /// Every checkout of `reference`, active or not.
    pub fn deployments(&self, reference: &Ref) -> Result<Vec<Deployment>> {
        let mut found = Vec::new();
        for checkout in deploy::list_checkouts(&self.base, reference)? {
            let dir = deploy::ref_dir(&self.base, reference).join(&checkout);
            let data = deploy::read_deploy_data(&dir)?;
            found.push(Deployment {
                reference: reference.clone(),
                checksum: data.commit.clone(),
                checkout,
                dir,
                data,
            });
        }
        Ok(found)
    }

    /// Installed runtimes nothing needs anymore.
    pub fn list_unused_refs(&self, options: &UnusedOptions<'_>) -> Result<Vec<Ref>> {
        let config = self.core_config();
        let pinned = RefGlobs::compile(&config.pinned)?;
        let marker_base = match self.scope {
            Scope::System => Some(self.environment.user_dir.as_path()),
            Scope::User | Scope::Custom => None,
        };
        deps::list_unused_refs(&UnusedRefsQuery {
            base: &self.base,
            pinned: &pinned,
            all_runtimes_are_roots: false,
            marker_base,
            injected: &options.injected,
            excluded: options.excluded,
            eol_only: options.eol_only,
            environment: &self.environment,
        })
    }

    /// Prune unreachable objects. `None` when another process holds the
    /// repo and pruning was skipped.
    pub fn prune(&self) -> Result<Option<PruneStats>> {
        let Some(_lock) = try_lock_repo_exclusive(&self.base)? else {
            info!(base = %self.base.display(), "repo busy, skipping prune");
            return Ok(None);
        };
        self.installer.prune_local_repo(&self.repo).map(Some)
    }

    pub fn cleanup_removed(&self) -> Result<usize> {
        deploy::cleanup_removed(&self.base)
    }

    /// Remove temp dirs left behind by interrupted operations.
    pub fn cleanup_stale_tmp(&self) -> Result<usize> {
        let mut removed = prune_stale_tempdirs(&self.base.join(REPO_DIR).join("tmp"), "staging-", STALE_TMP_AGE);
        for kind in [RefKind::App, RefKind::Runtime] {
            let kind_dir = self.base.join(kind.as_str());
            if !kind_dir.is_dir() {
                continue;
            }
            for entry in walkdir::WalkDir::new(&kind_dir).min_depth(3).max_depth(3) {
                let entry = entry.with_context(|| format!("failed to walk {}", kind_dir.display()))?;
                if entry.file_type().is_dir() {
                    removed += prune_stale_tempdirs(entry.path(), ".deploy-", STALE_TMP_AGE);
                }
            }
        }
        let appstream_dir = self.base.join(appstream::APPSTREAM_DIR);
        if appstream_dir.is_dir() {
            for entry in walkdir::WalkDir::new(&appstream_dir).min_depth(2).max_depth(2) {
                let entry = entry.with_context(|| format!("failed to walk {}", appstream_dir.display()))?;
                if entry.file_type().is_dir() {
                    removed += prune_stale_tempdirs(entry.path(), ".appstream-", STALE_TMP_AGE);
                }
            }
        }
        Ok(removed)
    }

    pub fn remove_local_ref(&self, remote: &str, reference: &str) -> Result<()> {
        self.installer.remove_local_ref(&self.repo, remote, reference)
    }

    /// Pull and check out `appstream2/<arch>` from `remote`.
    pub fn deploy_appstream(&self, remote_name: &str, arch: &str) -> Result<bool> {
        let remote = self.remote(remote_name)?;
        let _repo_lock = lock_repo_shared(&self.base)?;
        let reference = appstream::appstream_ref(arch);
        let request = PullRequest {
            reference: &reference,
            allow_downgrade: true,
            ..PullRequest::default()
        };
        let (_, child) = self.pull_ref(&remote, &request)?;
        let _dir_lock = lock_dir(&self.base)?;
        let changed = self.with_deploy_env(|env| {
            self.installer.deploy_appstream(
                env,
                child.as_ref().map(tempfile::TempDir::path),
                remote_name,
                arch,
            )
        })?;
        if changed {
            self.mark_changed()?;
        }
        Ok(changed)
    }

    /// Add or replace a remote.
    pub fn configure_remote(&self, remote: &RemoteConfig) -> Result<()> {
        let _dir_lock = lock_dir(&self.base)?;
        self.installer
            .configure_remote(&self.repo, &remote.name, Some(remote))?;
        self.invalidate_config();
        Ok(())
    }

    /// Remove a remote. Refused while installed refs come from it unless
    /// `force`.
    pub fn remove_remote(&self, name: &str, force: bool) -> Result<()> {
        self.remote(name)?;
        let used = self.refs_from_origin(name)?;
        if !used.is_empty() && !force {
            return Err(DeployError::RemoteUsed {
                remote: name.to_string(),
                refs: used.iter().map(ToString::to_string).collect(),
            }
            .into());
        }
        let _dir_lock = lock_dir(&self.base)?;
        self.drop_remote(name)
    }

    fn drop_remote(&self, name: &str) -> Result<()> {
        for reference in self.repo.list_refs(Some(name)).map_err(DeployError::from)?.keys() {
            self.installer.remove_local_ref(&self.repo, name, reference)?;
        }
        self.installer.configure_remote(&self.repo, name, None)?;
        self.invalidate_config();
        if let Err(err) = self.summary_cache.remove_remote(name) {
            warn!(remote = name, error = %format!("{err:#}"), "failed to drop cached summaries");
        }
        info!(remote = name, "removed remote");
        Ok(())
    }

    fn refs_from_origin(&self, remote: &str) -> Result<Vec<Ref>> {
        let mut used = Vec::new();
        for reference in self.list_deployed(None)? {
            if self.deployed_origin(&reference).as_deref() == Some(remote) {
                used.push(reference);
            }
        }
        Ok(used)
    }

    /// Remove an automatically created origin remote once nothing uses it.
    fn prune_origin_remote(&self, name: &str) -> Result<()> {
        let Some(remote) = RemoteConfig::from_keyfile(&self.repo.config(), name) else {
            return Ok(());
        };
        if !remote.is_origin_remote() || !self.refs_from_origin(name)?.is_empty() {
            return Ok(());
        }
        debug!(remote = name, "origin remote no longer used");
        self.drop_remote(name)
    }

    /// Configure the origin remote a ref file describes. Returns the ref and
    /// the remote to install it from.
    pub fn install_ref_file(&self, text: &str) -> Result<(Ref, String)> {
        let file = RefFile::parse(text)?;
        let reference = file.reference(&self.environment.default_arch)?;
        let (name, existing) = origin_remote_name(&self.repo.config(), reference.id(), &file.url);
        if !existing {
            self.configure_remote(&file.origin_remote(&name))?;
            info!(remote = %name, reference = %reference, "created origin remote");
        }
        Ok((reference, name))
    }
}

fn ensure_repo_at(base: &Path) -> Result<FsRepo> {
    fs::create_dir_all(base).with_context(|| format!("failed to create {}", base.display()))?;
    let repo = FsRepo::open(&base.join(REPO_DIR), true)
        .map_err(DeployError::from)
        .with_context(|| format!("failed to open repo in {}", base.display()))?;
    Ok(repo)
}

impl std::fmt::Debug for Installation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installation")
            .field("base", &self.base)
            .field("scope", &self.scope)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{EnvSnapshot, KEY_PINNED};
    use crate::core::deps::tests::fake_deploy;
    use crate::core::installer::tests::RecordingHelper;
    use crate::core::installer::RemoteHelperInstaller;

    fn open(tmp: &Path, scope: Scope) -> Result<Installation> {
        let environment = Arc::new(Environment::from_snapshot(&EnvSnapshot::testing(&[
            ("FLATPAK_SYSTEM_DIR", tmp.join("system").to_str().unwrap_or_default()),
            ("FLATPAK_USER_DIR", tmp.join("user").to_str().unwrap_or_default()),
            ("XDG_CACHE_HOME", tmp.join("cache").to_str().unwrap_or_default()),
            ("FLATPAK_DEFAULT_ARCH", "x86_64"),
        ])));
        match scope {
            Scope::System => Installation::system(environment),
            Scope::User => Installation::user(environment),
            Scope::Custom => Installation::open(&tmp.join("extra"), Scope::Custom, environment),
        }
    }

    fn unsigned(name: &str, url: &str) -> RemoteConfig {
        let mut remote = RemoteConfig::new(name, url);
        remote.gpg_verify = false;
        remote.gpg_verify_summary = false;
        remote
    }

    #[test]
    fn core_config_cache_is_invalidated_on_write() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let installation = open(tmp.path(), Scope::User)?;
        assert!(installation.core_config().pinned.is_empty());
        installation.set_core_list(KEY_PINNED, &["runtime/org.test.Platform".to_string()])?;
        assert_eq!(installation.core_config().pinned, vec!["runtime/org.test.Platform".to_string()]);
        Ok(())
    }

    #[test]
    fn runtimes_used_by_apps_need_force() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let installation = open(tmp.path(), Scope::User)?;
        let runtime = Ref::runtime("org.test.Platform", "x86_64", "1")?;
        let app = Ref::app("org.test.App", "x86_64", "stable")?;
        fake_deploy(installation.base(), &runtime, "[Runtime]\nname=org.test.Platform\n", false)?;
        fake_deploy(
            installation.base(),
            &app,
            "[Application]\nname=org.test.App\nruntime=org.test.Platform/x86_64/1\n",
            false,
        )?;

        let err = installation.uninstall(&runtime, false).unwrap_err();
        match find_deploy_error(&err) {
            Some(DeployError::RuntimeUsed { used_by, .. }) => {
                assert_eq!(used_by, &vec![app.to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        installation.uninstall(&runtime, true)?;
        assert!(installation.get_if_deployed(&runtime, None).is_none());
        assert!(installation.base().join(".changed").exists());
        Ok(())
    }

    #[test]
    fn remotes_in_use_need_force() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let installation = open(tmp.path(), Scope::User)?;
        installation.configure_remote(&unsigned("origin", "https://dl.example.com/repo/"))?;
        let app = Ref::app("org.test.App", "x86_64", "stable")?;
        fake_deploy(installation.base(), &app, "[Application]\nname=org.test.App\n", false)?;

        let err = installation.remove_remote("origin", false).unwrap_err();
        assert_eq!(find_deploy_error(&err).map(DeployError::kind), Some(ErrorKind::RemoteUsed));
        installation.remove_remote("origin", true)?;
        assert!(installation.remotes().is_empty());
        let missing = installation.remove_remote("origin", true).unwrap_err();
        assert_eq!(find_deploy_error(&missing).map(DeployError::kind), Some(ErrorKind::RemoteNotFound));
        Ok(())
    }

    #[test]
    fn ref_files_reuse_their_origin_remote() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let installation = open(tmp.path(), Scope::User)?;
        let text = "[Flatpak Ref]\nName=org.test.App\nBranch=stable\nUrl=https://dl.example.com/repo/\n";
        let (reference, remote) = installation.install_ref_file(text)?;
        assert_eq!(reference.to_string(), "app/org.test.App/x86_64/stable");
        assert_eq!(remote, "org.test.App-origin");
        let (_, again) = installation.install_ref_file(text)?;
        assert_eq!(again, remote);
        assert_eq!(installation.remotes().len(), 1);

        installation.prune_origin_remote(&remote)?;
        assert!(installation.remotes().is_empty(), "unused origin remotes are dropped");
        Ok(())
    }

    #[test]
    fn prune_is_skipped_while_the_repo_is_busy() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let installation = open(tmp.path(), Scope::System)?;
        let held = lock_repo_shared(installation.base())?;
        assert!(installation.prune()?.is_none());
        drop(held);
        assert!(installation.prune()?.is_some());
        Ok(())
    }

    #[test]
    fn helper_installations_forward_uninstalls() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let helper = Arc::new(RecordingHelper::default());
        let installation = open(tmp.path(), Scope::System)?
            .with_installer(Arc::new(RemoteHelperInstaller::new(helper.clone(), "default")));
        let app = Ref::app("org.test.App", "x86_64", "stable")?;
        fake_deploy(installation.base(), &app, "[Application]\nname=org.test.App\n", false)?;
        installation.uninstall(&app, false)?;
        assert_eq!(
            helper.calls(),
            vec![
                "uninstall app/org.test.App/x86_64/stable default".to_string(),
                "remove-local-ref origin:app/org.test.App/x86_64/stable default".to_string(),
            ]
        );
        Ok(())
    }

    #[test]
    fn stale_temp_dirs_are_swept() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let installation = open(tmp.path(), Scope::User)?;
        let branch_dir = installation.base().join("app/org.test.App/x86_64/stable");
        let stale = branch_dir.join(".deploy-old");
        let fresh = branch_dir.join(".deploy-new");
        fs::create_dir_all(&stale)?;
        fs::create_dir_all(&fresh)?;
        let old = filetime::FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&stale, old)?;

        assert_eq!(installation.cleanup_stale_tmp()?, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
        Ok(())
    }
}
