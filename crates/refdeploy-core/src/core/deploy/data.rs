//! Deploy-data derivation and load-time upgrades.
//!
//! Each schema version adds fields that can be re-derived from the commit,
//! the deployed metadata or the appstream data. Older files are upgraded in
//! place on load, so `deploy-version` always names the current schema.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use refdeploy_domain::deploy_data::{
    KEY_ALT_ID, KEY_EOL, KEY_EOL_REBASE, KEY_EXTENSION_OF, KEY_RUNTIME,
};
use refdeploy_domain::{
    AppMetadata, DeployData, DeployError, Ref, RefKind, DEPLOY_VERSION_CURRENT,
};
use refdeploy_store::commit::{META_ENDOFLIFE, META_ENDOFLIFE_REBASE, META_XA_ALT_ID};
use refdeploy_store::{Commit, ContentStore};
use tracing::{debug, warn};

use super::appdata::load_appdata;
use crate::core::fs::write_file_atomic;

pub const DEPLOY_FILE: &str = "deploy";
pub const METADATA_FILE: &str = "metadata";

/// Commit-derived fields (version 1).
pub fn apply_commit_fields(data: &mut DeployData, commit: &Commit) {
    data.set_timestamp(commit.timestamp);
    for (commit_key, data_key) in [
        (META_XA_ALT_ID, KEY_ALT_ID),
        (META_ENDOFLIFE, KEY_EOL),
        (META_ENDOFLIFE_REBASE, KEY_EOL_REBASE),
    ] {
        if let Some(value) = commit.meta_str(commit_key) {
            data.set_string(data_key, value);
        }
    }
}

/// Metadata-derived fields (version 2).
pub fn apply_metadata_fields(data: &mut DeployData, metadata: &AppMetadata) {
    if metadata.kind == RefKind::App {
        if let Some(runtime) = &metadata.runtime {
            data.set_string(KEY_RUNTIME, runtime);
        }
    }
    if let Some(extension_of) = &metadata.extension_of {
        data.set_string(KEY_EXTENSION_OF, &extension_of.reference);
    }
}

/// Appstream-derived fields (versions 3 and 4). Missing appdata is not an error.
pub fn apply_appdata_fields(data: &mut DeployData, deploy_dir: &Path, reference: &Ref) {
    match load_appdata(&deploy_dir.join("files"), reference.id()) {
        Ok(Some(appdata)) => appdata.apply(data),
        Ok(None) => debug!(reference = %reference, "no appdata"),
        Err(err) => warn!(reference = %reference, error = %format!("{err:#}"), "failed to read appdata"),
    }
}

pub fn read_metadata(deploy_dir: &Path) -> Result<AppMetadata> {
    let path = deploy_dir.join(METADATA_FILE);
    let text = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(AppMetadata::parse(&text)?)
}

/// Fill every derivable field of a fresh deploy-data record.
pub fn derive_all(data: &mut DeployData, commit: &Commit, deploy_dir: &Path, reference: &Ref) {
    apply_commit_fields(data, commit);
    match read_metadata(deploy_dir) {
        Ok(metadata) => apply_metadata_fields(data, &metadata),
        Err(err) => warn!(reference = %reference, error = %format!("{err:#}"), "failed to read metadata"),
    }
    apply_appdata_fields(data, deploy_dir, reference);
    data.set_version(DEPLOY_VERSION_CURRENT);
}

/// Bring `data` up to the current schema. Returns whether anything changed.
pub fn upgrade(
    data: &mut DeployData,
    repo: &dyn ContentStore,
    deploy_dir: &Path,
    reference: &Ref,
) -> bool {
    let old_version = data.version();
    if old_version >= DEPLOY_VERSION_CURRENT {
        return false;
    }
    if old_version < 1 {
        match repo.load_commit(&data.commit) {
            Ok((commit, _)) => apply_commit_fields(data, &commit),
            Err(err) => warn!(reference = %reference, commit = %data.commit, %err, "commit unavailable for deploy data upgrade"),
        }
    }
    if old_version < 2 {
        match read_metadata(deploy_dir) {
            Ok(metadata) => apply_metadata_fields(data, &metadata),
            Err(err) => warn!(reference = %reference, error = %format!("{err:#}"), "metadata unavailable for deploy data upgrade"),
        }
    }
    if old_version < 4 {
        apply_appdata_fields(data, deploy_dir, reference);
    }
    data.set_version(DEPLOY_VERSION_CURRENT);
    debug!(reference = %reference, from = old_version, to = DEPLOY_VERSION_CURRENT, "upgraded deploy data");
    true
}

pub fn read_deploy_data(deploy_dir: &Path) -> Result<DeployData> {
    let path = deploy_dir.join(DEPLOY_FILE);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(DeployError::NotInstalled(format!(
                "no deploy data at {}",
                path.display()
            ))
            .into())
        }
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    DeployData::from_bytes(&raw)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("invalid deploy data in {}", path.display()))
}

pub fn write_deploy_data(deploy_dir: &Path, data: &DeployData) -> Result<()> {
    write_file_atomic(&deploy_dir.join(DEPLOY_FILE), &data.to_bytes())
}

/// Load deploy data, upgrading it when older than `required_version`.
/// The upgraded record is written back when the deployment is writable.
pub fn load_deploy_data(
    repo: &dyn ContentStore,
    deploy_dir: &Path,
    reference: &Ref,
    required_version: i32,
) -> Result<DeployData> {
    let mut data = read_deploy_data(deploy_dir)?;
    if data.version() < required_version && upgrade(&mut data, repo, deploy_dir, reference) {
        if let Err(err) = write_deploy_data(deploy_dir, &data) {
            debug!(reference = %reference, error = %format!("{err:#}"), "keeping upgraded deploy data in memory");
        }
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use refdeploy_domain::Variant;
    use refdeploy_store::{root_dirmeta_checksum, FsRepo};

    #[test]
    fn old_deploy_data_is_upgraded_idempotently() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let repo = FsRepo::open(&tmp.path().join("repo"), true)?;
        let mut commit = Commit::new(&"a".repeat(64), &root_dirmeta_checksum(), 1234);
        commit
            .metadata
            .insert(META_ENDOFLIFE.into(), Variant::string("use something else"));
        let checksum = repo.write_commit(&commit)?;

        let deploy_dir = tmp.path().join("deploy");
        fs::create_dir_all(deploy_dir.join("files/share/metainfo"))?;
        fs::write(
            deploy_dir.join(METADATA_FILE),
            "[Application]\nname=org.test.App\nruntime=org.test.Platform/x86_64/1\n",
        )?;
        fs::write(
            deploy_dir.join("files/share/metainfo/org.test.App.metainfo.xml"),
            "<component><id>org.test.App</id><name>Tester</name></component>",
        )?;
        let mut old = DeployData::new("origin", &checksum, Vec::new(), 10);
        old.set_string("custom-key", "kept");
        write_deploy_data(&deploy_dir, &old)?;

        let reference = Ref::app("org.test.App", "x86_64", "stable")?;
        let loaded = load_deploy_data(&repo, &deploy_dir, &reference, DEPLOY_VERSION_CURRENT)?;
        assert_eq!(loaded.version(), DEPLOY_VERSION_CURRENT);
        assert_eq!(loaded.timestamp(), 1234);
        assert_eq!(loaded.eol(), Some("use something else"));
        assert_eq!(loaded.runtime(), Some("org.test.Platform/x86_64/1"));
        assert_eq!(loaded.appdata_name(&[]), Some("Tester"));
        assert_eq!(
            loaded.metadata.get("custom-key").and_then(Variant::as_str),
            Some("kept")
        );

        let reloaded = load_deploy_data(&repo, &deploy_dir, &reference, DEPLOY_VERSION_CURRENT)?;
        assert_eq!(reloaded, loaded);
        assert_eq!(read_deploy_data(&deploy_dir)?, loaded, "upgrade was persisted");
        Ok(())
    }

    #[test]
    fn missing_deploy_file_is_not_installed() {
        let tmp = tempfile::tempdir().unwrap();
        let err = read_deploy_data(tmp.path()).unwrap_err();
        assert!(matches!(
            refdeploy_domain::find_deploy_error(&err),
            Some(DeployError::NotInstalled(_))
        ));
    }
}
