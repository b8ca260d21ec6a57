//! Who performs mutations of an installation.
//!
//! [`LocalInstaller`] changes the tree directly. [`RemoteHelperInstaller`]
//! forwards every verb to a privileged [`SystemHelper`] that owns the
//! installation; content is then pulled into a child repo the helper imports
//! from.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use refdeploy_domain::{DeployError, KeyFile, Ref};
use refdeploy_store::{ContentStore, PruneOptions, PruneStats};
use tracing::{debug, info};

use crate::core::deploy::{self, appstream, DeployEnv, DeployRequest};
use crate::core::remote::RemoteConfig;

/// Options forwarded with a deploy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeployFlags {
    pub update: bool,
    pub reinstall: bool,
    /// The commit came from a signed listing.
    pub signed_summary: bool,
    pub no_interaction: bool,
}

/// A deploy of `reference` from `origin`.
#[derive(Clone, Debug)]
pub struct DeployArgs<'a> {
    /// Child repo holding the pulled commit, when the installation's own repo
    /// is not writable by this process.
    pub source_repo: Option<&'a Path>,
    pub reference: &'a Ref,
    pub origin: &'a str,
    pub checksum: Option<&'a str>,
    pub subpaths: Option<&'a [String]>,
    pub previous_ids: &'a [String],
    pub flags: DeployFlags,
}

impl DeployArgs<'_> {
    fn request(&self) -> DeployRequest<'_> {
        DeployRequest {
            checksum: self.checksum,
            subpaths: self.subpaths,
            previous_ids: self.previous_ids,
            signed_summary: self.flags.signed_summary,
            ..DeployRequest::new(self.reference, self.origin)
        }
    }
}

pub trait Installer: Send + Sync {
    /// Pulls must land in a child repo instead of the installation's repo.
    fn needs_child_repo(&self) -> bool {
        false
    }
    fn deploy(&self, env: &DeployEnv<'_>, args: &DeployArgs<'_>) -> Result<()>;
    fn uninstall(&self, env: &DeployEnv<'_>, reference: &Ref) -> Result<()>;
    fn configure_remote(&self, repo: &dyn ContentStore, remote: &str, config: Option<&RemoteConfig>) -> Result<()>;
    fn remove_local_ref(&self, repo: &dyn ContentStore, remote: &str, reference: &str) -> Result<()>;
    fn prune_local_repo(&self, repo: &dyn ContentStore) -> Result<PruneStats>;
    fn deploy_appstream(&self, env: &DeployEnv<'_>, source_repo: Option<&Path>, remote: &str, arch: &str) -> Result<bool>;
    /// Abandon a pull into `child_repo`, keeping what was fetched when `preserve`.
    fn cancel_pull(&self, child_repo: &Path, preserve: bool) -> Result<()>;
}

/// Mutates the installation from this process.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalInstaller;

impl Installer for LocalInstaller {
    fn deploy(&self, env: &DeployEnv<'_>, args: &DeployArgs<'_>) -> Result<()> {
        let request = args.request();
        if args.flags.update {
            deploy::deploy_update(env, &request)?;
        } else {
            deploy::deploy_install(env, &request, args.flags.reinstall)?;
        }
        Ok(())
    }

    fn uninstall(&self, env: &DeployEnv<'_>, reference: &Ref) -> Result<()> {
        if deploy::active_checkout(env.base, reference)?.is_none() {
            return Err(DeployError::NotInstalled(reference.to_string()).into());
        }
        deploy::undeploy_all(env.base, env.repo, reference)
    }

    fn configure_remote(&self, repo: &dyn ContentStore, remote: &str, config: Option<&RemoteConfig>) -> Result<()> {
        let mut keyfile = repo.config();
        match config {
            Some(config) => {
                config.validate()?;
                config.apply_to(&mut keyfile);
            }
            None => {
                keyfile.remove_group(&refdeploy_domain::remote_group(remote));
            }
        }
        repo.write_config(&keyfile)
            .map_err(DeployError::from)
            .with_context(|| format!("failed to write configuration for remote '{remote}'"))?;
        debug!(remote, removed = config.is_none(), "configured remote");
        Ok(())
    }

    fn remove_local_ref(&self, repo: &dyn ContentStore, remote: &str, reference: &str) -> Result<()> {
        repo.set_ref_immediate(Some(remote), reference, None)
            .map_err(DeployError::from)?;
        Ok(())
    }

    fn prune_local_repo(&self, repo: &dyn ContentStore) -> Result<PruneStats> {
        let stats = repo
            .prune(&PruneOptions::default())
            .map_err(DeployError::from)?;
        info!(
            total = stats.total,
            pruned = stats.pruned,
            freed = stats.bytes_freed,
            "pruned local repo"
        );
        Ok(stats)
    }

    fn deploy_appstream(&self, env: &DeployEnv<'_>, _source_repo: Option<&Path>, remote: &str, arch: &str) -> Result<bool> {
        appstream::deploy_appstream(env.repo, env.base, remote, arch, env.cancellable)
    }

    fn cancel_pull(&self, _child_repo: &Path, _preserve: bool) -> Result<()> {
        Ok(())
    }
}

/// Flags every helper call carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HelperFlags {
    pub no_interaction: bool,
    pub update: bool,
    pub reinstall: bool,
    pub force: bool,
    pub preserve_pull: bool,
}

/// The privileged side of a system installation. Each verb names the
/// installation it targets by id.
pub trait SystemHelper: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn deploy(
        &self,
        repo_path: &Path,
        flags: HelperFlags,
        reference: &str,
        origin: &str,
        subpaths: &[String],
        previous_ids: &[String],
        installation: &str,
    ) -> Result<()>;
    fn uninstall(&self, flags: HelperFlags, reference: &str, installation: &str) -> Result<()>;
    fn configure_remote(&self, flags: HelperFlags, remote: &str, config: &str, installation: &str) -> Result<()>;
    fn remove_local_ref(&self, flags: HelperFlags, remote: &str, reference: &str, installation: &str) -> Result<()>;
    fn prune_local_repo(&self, flags: HelperFlags, installation: &str) -> Result<PruneStats>;
    fn deploy_appstream(&self, repo_path: &Path, flags: HelperFlags, origin: &str, arch: &str, installation: &str) -> Result<bool>;
    fn cancel_pull(&self, flags: HelperFlags, installation: &str, src_dir: &Path) -> Result<()>;
}

/// Forwards to a [`SystemHelper`].
#[derive(Clone)]
pub struct RemoteHelperInstaller {
    helper: Arc<dyn SystemHelper>,
    installation: String,
    no_interaction: bool,
}

impl RemoteHelperInstaller {
    pub fn new(helper: Arc<dyn SystemHelper>, installation: impl Into<String>) -> Self {
        Self {
            helper,
            installation: installation.into(),
            no_interaction: false,
        }
    }

    #[must_use]
    pub fn with_no_interaction(mut self, no_interaction: bool) -> Self {
        self.no_interaction = no_interaction;
        self
    }

    fn flags(&self) -> HelperFlags {
        HelperFlags {
            no_interaction: self.no_interaction,
            ..HelperFlags::default()
        }
    }
}

impl Installer for RemoteHelperInstaller {
    fn needs_child_repo(&self) -> bool {
        true
    }

    fn deploy(&self, env: &DeployEnv<'_>, args: &DeployArgs<'_>) -> Result<()> {
        let source = args.source_repo.unwrap_or_else(|| env.repo.path());
        let flags = HelperFlags {
            update: args.flags.update,
            reinstall: args.flags.reinstall,
            no_interaction: self.no_interaction || args.flags.no_interaction,
            ..HelperFlags::default()
        };
        self.helper
            .deploy(
                source,
                flags,
                &args.reference.to_string(),
                args.origin,
                args.subpaths.unwrap_or_default(),
                args.previous_ids,
                &self.installation,
            )
            .with_context(|| format!("system helper failed to deploy {}", args.reference))
    }

    fn uninstall(&self, _env: &DeployEnv<'_>, reference: &Ref) -> Result<()> {
        self.helper
            .uninstall(self.flags(), &reference.to_string(), &self.installation)
            .with_context(|| format!("system helper failed to uninstall {reference}"))
    }

    fn configure_remote(&self, _repo: &dyn ContentStore, remote: &str, config: Option<&RemoteConfig>) -> Result<()> {
        let mut keyfile = KeyFile::new();
        let flags = match config {
            Some(config) => {
                config.validate()?;
                config.apply_to(&mut keyfile);
                self.flags()
            }
            None => HelperFlags {
                force: true,
                ..self.flags()
            },
        };
        self.helper
            .configure_remote(flags, remote, &keyfile.to_data(), &self.installation)
            .with_context(|| format!("system helper failed to configure remote '{remote}'"))
    }

    fn remove_local_ref(&self, _repo: &dyn ContentStore, remote: &str, reference: &str) -> Result<()> {
        self.helper
            .remove_local_ref(self.flags(), remote, reference, &self.installation)
    }

    fn prune_local_repo(&self, _repo: &dyn ContentStore) -> Result<PruneStats> {
        self.helper.prune_local_repo(self.flags(), &self.installation)
    }

    fn deploy_appstream(&self, env: &DeployEnv<'_>, source_repo: Option<&Path>, remote: &str, arch: &str) -> Result<bool> {
        let source = source_repo.unwrap_or_else(|| env.repo.path());
        self.helper
            .deploy_appstream(source, self.flags(), remote, arch, &self.installation)
    }

    fn cancel_pull(&self, child_repo: &Path, preserve: bool) -> Result<()> {
        let flags = HelperFlags {
            preserve_pull: preserve,
            ..self.flags()
        };
        self.helper.cancel_pull(flags, &self.installation, child_repo)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Mutex, PoisonError};

    /// Records helper calls as `verb args...` lines.
    #[derive(Default)]
    pub(crate) struct RecordingHelper {
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl RecordingHelper {
        fn record(&self, line: String) {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(line);
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl SystemHelper for RecordingHelper {
        fn deploy(
            &self,
            repo_path: &Path,
            flags: HelperFlags,
            reference: &str,
            origin: &str,
            subpaths: &[String],
            previous_ids: &[String],
            installation: &str,
        ) -> Result<()> {
            self.record(format!(
                "deploy {} update={} {reference} {origin} [{}] [{}] {installation}",
                repo_path.display(),
                flags.update,
                subpaths.join(","),
                previous_ids.join(",")
            ));
            Ok(())
        }

        fn uninstall(&self, _flags: HelperFlags, reference: &str, installation: &str) -> Result<()> {
            self.record(format!("uninstall {reference} {installation}"));
            Ok(())
        }

        fn configure_remote(&self, flags: HelperFlags, remote: &str, config: &str, installation: &str) -> Result<()> {
            self.record(format!(
                "configure-remote {remote} force={} has-url={} {installation}",
                flags.force,
                config.contains("url=")
            ));
            Ok(())
        }

        fn remove_local_ref(&self, _flags: HelperFlags, remote: &str, reference: &str, installation: &str) -> Result<()> {
            self.record(format!("remove-local-ref {remote}:{reference} {installation}"));
            Ok(())
        }

        fn prune_local_repo(&self, _flags: HelperFlags, installation: &str) -> Result<PruneStats> {
            self.record(format!("prune {installation}"));
            Ok(PruneStats::default())
        }

        fn deploy_appstream(&self, repo_path: &Path, _flags: HelperFlags, origin: &str, arch: &str, installation: &str) -> Result<bool> {
            self.record(format!("deploy-appstream {} {origin} {arch} {installation}", repo_path.display()));
            Ok(true)
        }

        fn cancel_pull(&self, flags: HelperFlags, installation: &str, src_dir: &Path) -> Result<()> {
            self.record(format!(
                "cancel-pull preserve={} {installation} {}",
                flags.preserve_pull,
                src_dir.display()
            ));
            Ok(())
        }
    }

    fn unsigned_remote(name: &str) -> RemoteConfig {
        let mut remote = RemoteConfig::new(name, "https://dl.example.com/repo/");
        remote.gpg_verify = false;
        remote.gpg_verify_summary = false;
        remote
    }

    #[test]
    fn helper_installer_forwards_verbs() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let repo = refdeploy_store::FsRepo::open(&tmp.path().join("repo"), true)?;
        let sandbox = crate::core::sandbox::BwrapRunner::default();
        let cancellable = refdeploy_store::Cancellable::new();
        let env = DeployEnv {
            base: tmp.path(),
            repo: &repo,
            sandbox: &sandbox,
            runtime_bases: &[],
            launcher_dir: None,
            cancellable: &cancellable,
        };
        let helper = Arc::new(RecordingHelper::default());
        let installer = RemoteHelperInstaller::new(helper.clone(), "default");
        assert!(installer.needs_child_repo());

        let reference = Ref::app("org.test.App", "x86_64", "stable")?;
        let child = tmp.path().join("child");
        let subpaths = vec!["/share".to_string()];
        installer.deploy(
            &env,
            &DeployArgs {
                source_repo: Some(&child),
                reference: &reference,
                origin: "flathub",
                checksum: None,
                subpaths: Some(&subpaths),
                previous_ids: &[],
                flags: DeployFlags {
                    update: true,
                    ..DeployFlags::default()
                },
            },
        )?;
        installer.uninstall(&env, &reference)?;
        installer.configure_remote(&repo, "flathub", Some(&unsigned_remote("flathub")))?;
        installer.configure_remote(&repo, "flathub", None)?;
        installer.cancel_pull(&child, false)?;

        let calls = helper.calls();
        assert_eq!(
            calls[0],
            format!(
                "deploy {} update=true app/org.test.App/x86_64/stable flathub [/share] [] default",
                child.display()
            )
        );
        assert_eq!(calls[1], "uninstall app/org.test.App/x86_64/stable default");
        assert_eq!(calls[2], "configure-remote flathub force=false has-url=true default");
        assert_eq!(calls[3], "configure-remote flathub force=true has-url=false default");
        assert!(calls[4].starts_with("cancel-pull preserve=false default"));
        Ok(())
    }

    #[test]
    fn local_installer_edits_remote_groups() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let repo = refdeploy_store::FsRepo::open(&tmp.path().join("repo"), true)?;
        let remote = unsigned_remote("flathub");
        LocalInstaller.configure_remote(&repo, "flathub", Some(&remote))?;
        let group = refdeploy_domain::remote_group("flathub");
        assert_eq!(
            repo.config().get_string(&group, "url").as_deref(),
            Some("https://dl.example.com/repo/")
        );
        LocalInstaller.configure_remote(&repo, "flathub", None)?;
        assert!(!repo.config().has_group(&group));
        Ok(())
    }
}
