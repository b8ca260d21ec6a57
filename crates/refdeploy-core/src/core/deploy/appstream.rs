//! Checked-out appstream data per remote and arch.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use refdeploy_domain::DeployError;
use refdeploy_store::{Cancellable, CheckoutOptions, ContentStore};
use tracing::{debug, info, warn};

use super::ACTIVE_LINK;
use crate::core::fs::{read_link_name, remove_dir_all_writable, replace_symlink, touch, TempCheckout};

pub const APPSTREAM_DIR: &str = "appstream";
const TIMESTAMP_FILE: &str = ".timestamp";
const TMP_PREFIX: &str = ".appstream-";

pub fn appstream_ref(arch: &str) -> String {
    format!("appstream2/{arch}")
}

pub fn appstream_dir(base: &Path, remote: &str, arch: &str) -> PathBuf {
    base.join(APPSTREAM_DIR).join(remote).join(arch)
}

/// Check out `remote:appstream2/<arch>` and make it active. Returns whether
/// the active checkout changed.
pub fn deploy_appstream(
    repo: &dyn ContentStore,
    base: &Path,
    remote: &str,
    arch: &str,
    cancellable: &Cancellable,
) -> Result<bool> {
    let reference = appstream_ref(arch);
    let checksum = repo
        .resolve_rev(&format!("{remote}:{reference}"), true)
        .map_err(DeployError::from)?
        .ok_or_else(|| DeployError::RefNotFound {
            reference: reference.clone(),
            remote: Some(remote.to_string()),
        })?;

    let dir = appstream_dir(base, remote, arch);
    let active_link = dir.join(ACTIVE_LINK);
    let current = read_link_name(&active_link)?;
    let changed = current.as_deref() != Some(checksum.as_str()) || !dir.join(&checksum).is_dir();

    if changed {
        let target = dir.join(&checksum);
        if !target.is_dir() {
            let tmp = TempCheckout::new_in(&dir, TMP_PREFIX)?;
            let options = CheckoutOptions {
                subpath: None,
                overwrite_union: true,
                bareuseronly: true,
            };
            repo.checkout(&checksum, tmp.path(), &options, cancellable)
                .map_err(DeployError::from)
                .with_context(|| format!("failed to check out {remote}:{reference}"))?;
            tmp.publish(&target)?;
        }
        replace_symlink(Path::new(&checksum), &active_link)?;
        info!(remote, arch, %checksum, "deployed appstream data");
    } else {
        debug!(remote, arch, %checksum, "appstream data unchanged");
    }
    touch(&dir.join(TIMESTAMP_FILE))?;
    remove_old_checkouts(&dir, &checksum);
    Ok(changed)
}

fn remove_old_checkouts(dir: &Path, keep: &str) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(ToOwned::to_owned) else {
            continue;
        };
        if name == keep || name.starts_with('.') || name == ACTIVE_LINK {
            continue;
        }
        if !entry.file_type().is_ok_and(|ty| ty.is_dir()) {
            continue;
        }
        if let Err(err) = remove_dir_all_writable(&entry.path()) {
            warn!(path = %entry.path().display(), error = %format!("{err:#}"), "failed to remove old appstream checkout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refdeploy_store::{root_dirmeta_checksum, Commit, FsRepo};

    fn commit_appstream(repo: &FsRepo, src: &Path, body: &str, timestamp: u64) -> Result<String> {
        fs::create_dir_all(src)?;
        fs::write(src.join("appstream.xml"), body)?;
        let tree = repo.write_dir(src, &Cancellable::new())?;
        let checksum = repo.write_commit(&Commit::new(&tree, &root_dirmeta_checksum(), timestamp))?;
        repo.set_ref_immediate(Some("origin"), &appstream_ref("x86_64"), Some(&checksum))?;
        Ok(checksum)
    }

    #[test]
    fn switches_checkouts_and_drops_old_ones() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let base = tmp.path().join("base");
        let repo = FsRepo::open(&base.join("repo"), true)?;
        let cancel = Cancellable::new();

        let missing = deploy_appstream(&repo, &base, "origin", "x86_64", &cancel).unwrap_err();
        assert!(matches!(
            refdeploy_domain::find_deploy_error(&missing),
            Some(DeployError::RefNotFound { .. })
        ));

        let first = commit_appstream(&repo, &tmp.path().join("one"), "<components/>", 1)?;
        assert!(deploy_appstream(&repo, &base, "origin", "x86_64", &cancel)?);
        assert!(!deploy_appstream(&repo, &base, "origin", "x86_64", &cancel)?);
        let dir = appstream_dir(&base, "origin", "x86_64");
        assert!(dir.join(".timestamp").exists());
        assert!(dir.join("active/appstream.xml").exists());

        let second = commit_appstream(&repo, &tmp.path().join("two"), "<components></components>", 2)?;
        assert!(deploy_appstream(&repo, &base, "origin", "x86_64", &cancel)?);
        assert_eq!(read_link_name(&dir.join(ACTIVE_LINK))?, Some(second));
        assert!(!dir.join(&first).exists());
        Ok(())
    }
}
