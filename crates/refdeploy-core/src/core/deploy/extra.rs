//! Extra data inside a checkout: extraction and the `apply_extra` script.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use refdeploy_domain::{DeployError, Ref};
use refdeploy_store::{sha256_hex, Commit, ContentStore};
use tracing::{debug, info};

use crate::core::fs::{copy_tree, remove_dir_all_writable};
use crate::core::pull::{extra_data_payloads, extra_data_sources};
use crate::core::sandbox::{run_confined, Bind, SandboxManifest, SandboxRunner};

pub const APPLY_EXTRA: &str = "files/bin/apply_extra";
const EXTRA_DIR: &str = "files/extra";

/// Write the commit's attached extra data into `checkout/files/extra`.
/// Returns whether the commit has any.
pub fn extract_extra_data(
    repo: &dyn ContentStore,
    checksum: &str,
    commit: &Commit,
    checkout: &Path,
) -> Result<bool> {
    let sources = extra_data_sources(commit)?;
    if sources.is_empty() {
        return Ok(false);
    }
    let detached = repo
        .read_commit_detached_metadata(checksum)
        .map_err(DeployError::from)?
        .ok_or_else(|| DeployError::invalid_data(format!("extra data missing for commit {checksum}")))?;
    let payloads = extra_data_payloads(&detached)?;

    let extra_dir = checkout.join(EXTRA_DIR);
    fs::create_dir_all(&extra_dir)
        .with_context(|| format!("failed to create {}", extra_dir.display()))?;
    for source in &sources {
        if source.name.is_empty() || source.name.contains('/') || source.name.starts_with('.') {
            return Err(DeployError::invalid_data(format!(
                "invalid extra data name '{}'",
                source.name
            ))
            .into());
        }
        let data = payloads
            .iter()
            .find(|(name, _)| *name == source.name)
            .map(|(_, data)| data)
            .ok_or_else(|| {
                DeployError::invalid_data(format!("extra data '{}' missing in detached metadata", source.name))
            })?;
        if data.len() as u64 != source.download_size || sha256_hex(data) != source.sha256 {
            return Err(DeployError::invalid_data(format!(
                "extra data '{}' does not match its declared size or checksum",
                source.name
            ))
            .into());
        }
        let path = extra_dir.join(&source.name);
        fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))?;
        debug!(name = %source.name, size = data.len(), "extracted extra data");
    }
    Ok(true)
}

/// Run `apply_extra` confined, with the checkout's `files/extra` as the only
/// writable path, then merge anything it put under `extra/export` into the
/// checkout's `export` tree. A non-zero exit status fails the deploy.
pub fn apply_extra_data(
    runner: &dyn SandboxRunner,
    checkout: &Path,
    reference: &Ref,
    runtime_files: Option<&Path>,
) -> Result<()> {
    if !checkout.join(APPLY_EXTRA).is_file() {
        return Ok(());
    }
    let files = checkout.join("files");
    let extra = checkout.join(EXTRA_DIR);
    fs::create_dir_all(&extra).with_context(|| format!("failed to create {}", extra.display()))?;

    let mut binds = Vec::new();
    if let Some(runtime) = runtime_files {
        binds.push(Bind::read_only(runtime, "/usr"));
    }
    binds.push(Bind::read_only(&files, "/app"));
    binds.push(Bind::writable(&extra, "/app/extra"));
    let manifest = SandboxManifest {
        argv: vec!["/app/bin/apply_extra".into()],
        binds,
        cwd: "/app/extra".into(),
        envs: vec![
            ("PATH".into(), "/app/bin:/usr/bin".into()),
            ("FLATPAK_ID".into(), reference.id().to_string()),
            ("FLATPAK_ARCH".into(), reference.arch().to_string()),
        ],
        share_network: false,
        keep_caps: false,
    };
    let output = run_confined(runner, &manifest)?;
    if !output.success() {
        return Err(anyhow::anyhow!(
            "apply_extra script for {reference} failed with exit status {}: {}",
            output.code,
            output.stderr.trim()
        ));
    }

    let exported = extra.join("export");
    if exported.is_dir() {
        copy_tree(&exported, &checkout.join("export"))?;
        remove_dir_all_writable(&exported)?;
    }
    info!(reference = %reference, "applied extra data");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pull::{encode_extra_data_payloads, encode_extra_data_sources, ExtraDataSource};
    use crate::core::sandbox::RunOutput;
    use refdeploy_domain::VarDict;
    use refdeploy_store::commit::META_XA_EXTRA_DATA_SOURCES;
    use refdeploy_store::{root_dirmeta_checksum, FsRepo};

    struct ScriptedRunner {
        code: i32,
    }

    impl SandboxRunner for ScriptedRunner {
        fn run(&self, manifest: &SandboxManifest) -> Result<RunOutput> {
            let extra = manifest
                .binds
                .iter()
                .find(|bind| bind.dest == "/app/extra")
                .map(|bind| bind.source.clone())
                .ok_or_else(|| anyhow::anyhow!("extra not bound"))?;
            let payload = fs::read(extra.join("payload.bin"))?;
            fs::create_dir_all(extra.join("export/share/applications"))?;
            fs::write(extra.join("unpacked"), payload)?;
            fs::write(extra.join("export/share/applications/org.test.Extra.desktop"), "[Desktop Entry]\n")?;
            Ok(RunOutput {
                code: self.code,
                stdout: String::new(),
                stderr: "boom".into(),
            })
        }
    }

    #[test]
    fn extracts_verifies_and_applies() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let repo = FsRepo::open(&tmp.path().join("repo"), true)?;
        let data = b"payload".to_vec();
        let mut commit = Commit::new(&"a".repeat(64), &root_dirmeta_checksum(), 1);
        commit.metadata.insert(
            META_XA_EXTRA_DATA_SOURCES.into(),
            encode_extra_data_sources(&[ExtraDataSource {
                name: "payload.bin".into(),
                download_size: data.len() as u64,
                installed_size: 0,
                sha256: sha256_hex(&data),
                uri: "https://example.com/payload.bin".into(),
            }]),
        );
        let checksum = repo.write_commit(&commit)?;
        let checkout = tmp.path().join("checkout");
        fs::create_dir_all(checkout.join("files/bin"))?;
        fs::write(checkout.join(APPLY_EXTRA), "#!/bin/sh\n")?;

        let missing = extract_extra_data(&repo, &checksum, &commit, &checkout);
        assert!(missing.is_err(), "nothing attached yet");

        let mut detached = VarDict::new();
        detached.insert(
            crate::core::pull::META_XA_EXTRA_DATA.into(),
            encode_extra_data_payloads(&[("payload.bin".into(), data.clone())]),
        );
        repo.write_commit_detached_metadata(&checksum, Some(&detached))?;
        assert!(extract_extra_data(&repo, &checksum, &commit, &checkout)?);
        assert_eq!(fs::read(checkout.join("files/extra/payload.bin"))?, data);

        let reference = Ref::app("org.test.Extra", "x86_64", "stable")?;
        let err = apply_extra_data(&ScriptedRunner { code: 1 }, &checkout, &reference, None).unwrap_err();
        assert!(format!("{err:#}").contains("exit status 1"));

        apply_extra_data(&ScriptedRunner { code: 0 }, &checkout, &reference, None)?;
        assert!(checkout.join("files/extra/unpacked").exists());
        assert!(checkout
            .join("export/share/applications/org.test.Extra.desktop")
            .exists());
        assert!(!checkout.join("files/extra/export").exists());
        Ok(())
    }
}
