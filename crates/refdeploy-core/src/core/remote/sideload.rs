//! Local repos (USB drives, pre-seeded directories) that can stand in for a
//! remote when they carry the same collection.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use url::Url;

use crate::core::summary::{Summary, SummaryRef};

pub const SIDELOAD_REPOS_DIR: &str = "sideload-repos";

#[derive(Clone, Debug)]
pub struct SideloadRepo {
    pub path: PathBuf,
    pub summary: Summary,
}

impl SideloadRepo {
    /// `file://` URI the store can pull from.
    #[must_use]
    pub fn uri(&self) -> String {
        Url::from_directory_path(&self.path)
            .map_or_else(|()| format!("file://{}", self.path.display()), String::from)
    }

    #[must_use]
    pub fn lookup(&self, collection_id: &str, reference: &str) -> Option<&SummaryRef> {
        self.summary.lookup(Some(collection_id), reference)
    }
}

/// Directories whose entries are sideload repos for `installation_base`.
#[must_use]
pub fn sideload_dirs(installation_base: &Path, run_dir_sideload: &Path) -> Vec<PathBuf> {
    vec![
        installation_base.join(SIDELOAD_REPOS_DIR),
        run_dir_sideload.to_path_buf(),
    ]
}

fn is_repo(path: &Path) -> bool {
    path.join("config").is_file() && path.join("objects").is_dir()
}

/// Repos reachable from one entry: the entry itself, `.ostree/repo`, or every
/// repo under `.ostree/repos.d`.
fn repos_in(entry: &Path) -> Vec<PathBuf> {
    if is_repo(entry) {
        return vec![entry.to_path_buf()];
    }
    let mut repos = Vec::new();
    let nested = entry.join(".ostree/repo");
    if is_repo(&nested) {
        repos.push(nested);
    }
    if let Ok(children) = fs::read_dir(entry.join(".ostree/repos.d")) {
        let mut children: Vec<PathBuf> = children.flatten().map(|child| child.path()).collect();
        children.sort();
        repos.extend(children.into_iter().filter(|child| is_repo(child)));
    }
    repos
}

/// Every sideload repo under `dirs` whose summary lists refs of `collection_id`,
/// in discovery order.
#[must_use]
pub fn discover_sideload_repos(dirs: &[PathBuf], collection_id: &str) -> Vec<SideloadRepo> {
    let mut found = Vec::new();
    for dir in dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        let mut entries: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();
        entries.sort();
        for repo in entries.iter().flat_map(|entry| repos_in(entry)) {
            let summary_path = repo.join("summary");
            let summary = match fs::read(&summary_path)
                .map_err(anyhow::Error::from)
                .and_then(|data| Summary::from_bytes(&data).map_err(anyhow::Error::from))
            {
                Ok(summary) => summary,
                Err(err) => {
                    debug!(repo = %repo.display(), %err, "ignoring sideload repo without a usable summary");
                    continue;
                }
            };
            if summary
                .refs_for(Some(collection_id))
                .map_or(true, |refs| refs.is_empty())
            {
                debug!(
                    repo = %repo.display(),
                    collection_id,
                    "sideload repo does not carry this collection"
                );
                continue;
            }
            debug!(repo = %repo.display(), collection_id, "using sideload repo");
            found.push(SideloadRepo {
                path: repo,
                summary,
            });
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::summary::format::KEY_COLLECTION_ID;
    use refdeploy_domain::Variant;

    fn write_repo(path: &Path, collection_id: &str, refs: &[(&str, u8)]) -> anyhow::Result<()> {
        fs::create_dir_all(path.join("objects"))?;
        fs::write(path.join("config"), "[core]\nrepo_version=1\n")?;
        let mut summary = Summary::default();
        summary
            .metadata
            .insert(KEY_COLLECTION_ID.into(), Variant::string(collection_id));
        for (name, byte) in refs {
            summary
                .refs
                .insert((*name).to_string(), SummaryRef::new(&hex::encode([*byte; 32]), 1, 1));
        }
        fs::write(path.join("summary"), summary.to_bytes())?;
        Ok(())
    }

    #[test]
    fn finds_repos_in_all_layouts() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("sideload-repos");
        write_repo(&dir.join("a-plain"), "org.test.Repo", &[("app/org.test.App/x86_64/stable", 1)])?;
        write_repo(
            &dir.join("b-usb/.ostree/repo"),
            "org.test.Repo",
            &[("app/org.test.App/x86_64/stable", 2)],
        )?;
        write_repo(
            &dir.join("c-usb/.ostree/repos.d/other"),
            "org.other.Repo",
            &[("app/org.other.App/x86_64/stable", 3)],
        )?;
        fs::create_dir_all(dir.join("d-empty"))?;

        let found = discover_sideload_repos(&[dir.clone(), tmp.path().join("missing")], "org.test.Repo");
        assert_eq!(found.len(), 2);
        assert!(found[0].path.ends_with("a-plain"));
        assert!(found[1].path.ends_with(".ostree/repo"));
        assert!(found[0].uri().starts_with("file://"));
        assert_eq!(
            found[1].lookup("org.test.Repo", "app/org.test.App/x86_64/stable").map(|e| e.checksum.clone()),
            Some(hex::encode([2; 32]))
        );

        let other = discover_sideload_repos(&[dir], "org.other.Repo");
        assert_eq!(other.len(), 1);
        Ok(())
    }
}
