//! `.flatpakref` files and the origin remotes created for them.

use anyhow::{Context, Result};
use refdeploy_domain::{DeployError, KeyFile, Ref, RefKind};

use crate::core::remote::{remote_names, RemoteConfig};

const GROUP: &str = "Flatpak Ref";
const ORIGIN_SUFFIX: &str = "-origin";

/// The `[Flatpak Ref]` group of a ref file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefFile {
    pub name: String,
    pub branch: String,
    pub url: String,
    pub is_runtime: bool,
    pub collection_id: Option<String>,
    pub sign_key: Option<String>,
    pub title: Option<String>,
}

impl RefFile {
    pub fn parse(text: &str) -> Result<Self> {
        let keyfile = KeyFile::parse(text).context("invalid ref file")?;
        if !keyfile.has_group(GROUP) {
            return Err(DeployError::invalid_data(format!("ref file has no [{GROUP}] group")).into());
        }
        let required = |key: &str| {
            keyfile
                .get_string(GROUP, key)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| DeployError::invalid_data(format!("ref file has no {key}")))
        };
        Ok(Self {
            name: required("Name")?,
            branch: keyfile
                .get_string(GROUP, "Branch")
                .unwrap_or_else(|| "master".to_string()),
            url: required("Url")?,
            is_runtime: keyfile.bool_or(GROUP, "IsRuntime", false),
            collection_id: keyfile
                .get_string(GROUP, "CollectionID")
                .filter(|value| !value.is_empty()),
            sign_key: keyfile
                .get_string(GROUP, "SignKey")
                .filter(|value| !value.is_empty()),
            title: keyfile.get_string(GROUP, "Title"),
        })
    }

    pub fn reference(&self, arch: &str) -> Result<Ref, DeployError> {
        let kind = if self.is_runtime {
            RefKind::Runtime
        } else {
            RefKind::App
        };
        Ref::new(kind, self.name.as_str(), arch, self.branch.as_str())
    }

    /// Settings of the origin remote for this file, named `name`.
    pub fn origin_remote(&self, name: &str) -> RemoteConfig {
        let mut remote = RemoteConfig::new(name, &self.url);
        remote.collection_id.clone_from(&self.collection_id);
        remote.title.clone_from(&self.title);
        remote.noenumerate = true;
        remote.prio = 0;
        remote.sign_keys = self.sign_key.iter().cloned().collect();
        remote.gpg_verify = self.sign_key.is_some();
        remote.gpg_verify_summary = self.sign_key.is_some();
        remote
    }
}

/// An existing origin remote serving `url`, or a free `<id>-origin[-N]` name.
pub fn origin_remote_name(config: &KeyFile, id: &str, url: &str) -> (String, bool) {
    let names = remote_names(config);
    for name in &names {
        let Some(remote) = RemoteConfig::from_keyfile(config, name) else {
            continue;
        };
        if remote.is_origin_remote() && remote.url == url && name.starts_with(id) {
            return (name.clone(), true);
        }
    }
    let base = format!("{id}{ORIGIN_SUFFIX}");
    let mut candidate = base.clone();
    let mut counter = 1;
    while names.contains(&candidate) {
        candidate = format!("{base}-{counter}");
        counter += 1;
    }
    (candidate, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REF_FILE: &str = "[Flatpak Ref]\nTitle=Test App\nName=org.test.App\nBranch=stable\nUrl=https://dl.example.com/repo/\nIsRuntime=false\nCollectionID=org.example.Apps\n";

    #[test]
    fn parses_and_builds_an_origin_remote() -> Result<()> {
        let file = RefFile::parse(REF_FILE)?;
        assert_eq!(file.reference("x86_64")?.to_string(), "app/org.test.App/x86_64/stable");
        let remote = file.origin_remote("org.test.App-origin");
        assert!(remote.noenumerate);
        assert_eq!(remote.prio, 0);
        assert!(!remote.gpg_verify);
        assert!(remote.is_origin_remote());
        remote.validate()?;

        assert!(RefFile::parse("[Flatpak Ref]\nName=org.test.App\n").is_err());
        Ok(())
    }

    #[test]
    fn origin_names_are_reused_or_numbered() -> Result<()> {
        let file = RefFile::parse(REF_FILE)?;
        let mut config = KeyFile::new();
        assert_eq!(
            origin_remote_name(&config, "org.test.App", &file.url),
            ("org.test.App-origin".to_string(), false)
        );

        file.origin_remote("org.test.App-origin").apply_to(&mut config);
        assert_eq!(
            origin_remote_name(&config, "org.test.App", &file.url),
            ("org.test.App-origin".to_string(), true)
        );
        assert_eq!(
            origin_remote_name(&config, "org.test.App", "https://mirror.example.com/repo/"),
            ("org.test.App-origin-1".to_string(), false)
        );
        Ok(())
    }
}
