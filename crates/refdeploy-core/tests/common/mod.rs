#![allow(dead_code)]

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use refdeploy_core::summary::{update_summary, SummaryOptions, SummaryReport};
use refdeploy_core::{
    EnvSnapshot, Environment, Installation, Ref, RemoteConfig, RemoteHelperInstaller, SystemHelper,
};
use refdeploy_domain::Variant;
use refdeploy_store::commit::{META_REF_BINDING, META_XA_METADATA};
use refdeploy_store::{root_dirmeta_checksum, Cancellable, Commit, ContentStore, FsRepo};
use tempfile::TempDir;
use url::Url;

pub const REMOTE: &str = "origin";
pub const PLATFORM: &str = "runtime/org.test.Platform/x86_64/1";
pub const APP: &str = "app/org.test.App/x86_64/stable";

/// A remote repo served from a local directory and an empty user
/// installation configured to pull from it.
pub struct Fixture {
    pub tmp: TempDir,
    pub remote_repo: FsRepo,
    pub environment: Arc<Environment>,
    pub installation: Installation,
    counter: Cell<u32>,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let remote_repo = FsRepo::open(&tmp.path().join("remote"), true)?;
        let environment = Arc::new(Environment::from_snapshot(&EnvSnapshot::from_pairs([
            ("FLATPAK_SYSTEM_DIR", path_str(&tmp.path().join("system"))?),
            ("FLATPAK_USER_DIR", path_str(&tmp.path().join("data/flatpak"))?),
            ("XDG_CACHE_HOME", path_str(&tmp.path().join("cache"))?),
            ("FLATPAK_DEFAULT_ARCH", "x86_64".to_string()),
        ])));
        let installation = Installation::user(environment.clone())?;

        let mut remote = RemoteConfig::new(REMOTE, &file_url(&tmp.path().join("remote"))?);
        remote.gpg_verify = false;
        remote.gpg_verify_summary = false;
        installation.configure_remote(&remote)?;
        Ok(Self {
            tmp,
            remote_repo,
            environment,
            installation,
            counter: Cell::new(0),
        })
    }

    /// The same installation, with deploys forwarded to `helper`.
    pub fn through_helper(&self, helper: Arc<dyn SystemHelper>) -> Result<Installation> {
        Ok(Installation::user(self.environment.clone())?
            .with_installer(Arc::new(RemoteHelperInstaller::new(helper, "user"))))
    }

    pub fn path(&self) -> &Path {
        self.tmp.path()
    }

    /// Commit a tree for `reference` with `metadata`, point the remote ref
    /// at it and regenerate the remote's summary.
    pub fn publish(&self, reference: &str, metadata: &str, timestamp: u64) -> Result<String> {
        let checksum = self.commit(reference, metadata, timestamp)?;
        self.remote_repo
            .set_ref_immediate(None, reference, Some(&checksum))?;
        self.update_summary()?;
        Ok(checksum)
    }

    /// Commit without moving any ref.
    pub fn commit(&self, reference: &str, metadata: &str, timestamp: u64) -> Result<String> {
        let serial = self.counter.get() + 1;
        self.counter.set(serial);
        let src = self.tmp.path().join(format!("src-{serial}"));
        fs::create_dir_all(src.join("files/bin"))?;
        fs::write(src.join("metadata"), metadata)?;
        fs::write(src.join("files/bin/tool"), format!("{reference} @ {timestamp}"))?;
        let tree = self.remote_repo.write_dir(&src, &Cancellable::new())?;
        let mut commit = Commit::new(&tree, &root_dirmeta_checksum(), timestamp);
        commit
            .metadata
            .insert(META_REF_BINDING.into(), Variant::strv([reference]));
        commit
            .metadata
            .insert(META_XA_METADATA.into(), Variant::string(metadata));
        Ok(self.remote_repo.write_commit(&commit)?)
    }

    pub fn update_summary(&self) -> Result<SummaryReport> {
        update_summary(&self.remote_repo, &SummaryOptions::default())
    }

    pub fn install(&self, reference: &str) -> Result<Ref> {
        let reference: Ref = reference.parse()?;
        self.installation
            .install(REMOTE, &reference, &refdeploy_core::InstallOptions::default())?;
        Ok(reference)
    }

    pub fn branch_dir(&self, reference: &Ref) -> PathBuf {
        refdeploy_core::deploy::ref_dir(self.installation.base(), reference)
    }

    pub fn active(&self, reference: &Ref) -> Result<Option<String>> {
        refdeploy_core::deploy::active_checkout(self.installation.base(), reference)
    }
}

pub fn platform_metadata() -> String {
    "[Runtime]\nname=org.test.Platform\nruntime=org.test.Platform/x86_64/1\n".to_string()
}

pub fn app_metadata() -> String {
    "[Application]\nname=org.test.App\nruntime=org.test.Platform/x86_64/1\n".to_string()
}

pub fn runtime_metadata(id: &str) -> String {
    format!("[Runtime]\nname={id}\n")
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| anyhow!("non-utf8 path {}", path.display()))
}

fn file_url(path: &Path) -> Result<String> {
    Url::from_directory_path(path)
        .map(String::from)
        .map_err(|()| anyhow!("not an absolute path: {}", path.display()))
}
