//! The `metadata` file shipped at the top of every deployed commit.

use crate::error::DeployError;
use crate::keyfile::{KeyFile, KeyFileError};
use crate::refs::{Ref, RefKind};

pub const GROUP_APPLICATION: &str = "Application";
pub const GROUP_RUNTIME: &str = "Runtime";
pub const GROUP_EXTENSION_OF: &str = "ExtensionOf";
pub const GROUP_EXTRA_DATA: &str = "Extra Data";
const EXTENSION_PREFIX: &str = "Extension ";

/// `[ExtensionOf]`: the ref this runtime extends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionOf {
    pub reference: String,
    pub runtime: Option<String>,
    pub tag: Option<String>,
}

/// One `[Extension <id>]` group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionPoint {
    pub id: String,
    pub directory: Option<String>,
    /// Explicit branches; empty means "same branch as the parent ref".
    pub versions: Vec<String>,
    pub autodelete: bool,
    pub no_autodownload: bool,
    pub autoprune_unless: Option<String>,
    pub locale_subset: bool,
    pub subdirectories: bool,
    pub download_if: Option<String>,
    pub enable_if: Option<String>,
}

impl ExtensionPoint {
    fn from_group(keyfile: &KeyFile, group: &str, id: &str) -> Self {
        let versions = keyfile
            .get_string_list(group, "versions")
            .or_else(|| keyfile.get_string(group, "version").map(|v| vec![v]))
            .unwrap_or_default();
        Self {
            id: id.to_string(),
            directory: keyfile.get_string(group, "directory"),
            versions,
            autodelete: keyfile.bool_or(group, "autodelete", false),
            no_autodownload: keyfile.bool_or(group, "no-autodownload", false),
            autoprune_unless: keyfile.get_string(group, "autoprune-unless"),
            locale_subset: keyfile.bool_or(group, "locale-subset", false),
            subdirectories: keyfile.bool_or(group, "subdirectories", false),
            download_if: keyfile.get_string(group, "download-if"),
            enable_if: keyfile.get_string(group, "enable-if"),
        }
    }

    /// Branches this extension point accepts for a parent on `default_branch`.
    #[must_use]
    pub fn branches<'a>(&'a self, default_branch: &'a str) -> Vec<&'a str> {
        if self.versions.is_empty() {
            vec![default_branch]
        } else {
            self.versions.iter().map(String::as_str).collect()
        }
    }

    /// Whether `candidate_id` is provided by this extension point.
    #[must_use]
    pub fn matches_id(&self, candidate_id: &str) -> bool {
        if candidate_id == self.id {
            return true;
        }
        self.subdirectories
            && candidate_id
                .strip_prefix(self.id.as_str())
                .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppMetadata {
    pub kind: RefKind,
    pub name: Option<String>,
    pub runtime: Option<String>,
    pub sdk: Option<String>,
    pub extension_of: Option<ExtensionOf>,
    pub extensions: Vec<ExtensionPoint>,
    pub extra_data_no_runtime: bool,
    keyfile: KeyFile,
}

impl AppMetadata {
    pub fn parse(text: &str) -> Result<Self, DeployError> {
        let keyfile = KeyFile::parse(text)
            .map_err(|err| DeployError::invalid_data(format!("metadata: {err}")))?;
        Self::from_keyfile(keyfile)
    }

    pub fn from_keyfile(keyfile: KeyFile) -> Result<Self, DeployError> {
        let (kind, group) = if keyfile.has_group(GROUP_APPLICATION) {
            (RefKind::App, GROUP_APPLICATION)
        } else if keyfile.has_group(GROUP_RUNTIME) {
            (RefKind::Runtime, GROUP_RUNTIME)
        } else {
            return Err(DeployError::invalid_data(
                "metadata has neither [Application] nor [Runtime] group",
            ));
        };
        let extension_of = keyfile
            .get_string(GROUP_EXTENSION_OF, "ref")
            .map(|reference| ExtensionOf {
                reference,
                runtime: keyfile.get_string(GROUP_EXTENSION_OF, "runtime"),
                tag: keyfile.get_string(GROUP_EXTENSION_OF, "tag"),
            });
        let extensions = keyfile
            .groups()
            .into_iter()
            .filter_map(|group| {
                let id = group.strip_prefix(EXTENSION_PREFIX)?;
                Some(ExtensionPoint::from_group(&keyfile, group, id))
            })
            .collect();
        Ok(Self {
            kind,
            name: keyfile.get_string(group, "name"),
            runtime: keyfile.get_string(group, "runtime"),
            sdk: keyfile.get_string(group, "sdk"),
            extension_of,
            extensions,
            extra_data_no_runtime: keyfile.bool_or(GROUP_EXTRA_DATA, "NoRuntime", false),
            keyfile,
        })
    }

    #[must_use]
    pub fn keyfile(&self) -> &KeyFile {
        &self.keyfile
    }

    pub fn runtime_ref(&self) -> Result<Option<Ref>, DeployError> {
        self.runtime
            .as_deref()
            .map(|r| Ref::parse_partial(RefKind::Runtime, r))
            .transpose()
    }

    pub fn sdk_ref(&self) -> Result<Option<Ref>, DeployError> {
        self.sdk
            .as_deref()
            .map(|r| Ref::parse_partial(RefKind::Runtime, r))
            .transpose()
    }

    /// The ref named by `[ExtensionOf] ref=`, if any.
    pub fn extension_of_ref(&self) -> Result<Option<Ref>, DeployError> {
        self.extension_of
            .as_ref()
            .map(|ext| ext.reference.parse())
            .transpose()
    }

    /// Whether this metadata declares out-of-band extra data.
    #[must_use]
    pub fn has_extra_data_group(&self) -> bool {
        self.keyfile.has_group(GROUP_EXTRA_DATA)
    }
}

impl From<KeyFileError> for DeployError {
    fn from(err: KeyFileError) -> Self {
        DeployError::invalid_data(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = "\
[Application]
name=org.test.App
runtime=org.test.Platform/x86_64/1.0
sdk=org.test.Sdk/x86_64/1.0

[Extension org.test.App.Locale]
directory=share/runtime/locale
autodelete=true
locale-subset=true

[Extension org.test.App.Plugin]
directory=plugins
subdirectories=true
versions=1.0;beta;
autoprune-unless=active-gl-driver
";

    #[test]
    fn parses_application_metadata() {
        let meta = AppMetadata::parse(APP).unwrap();
        assert_eq!(meta.kind, RefKind::App);
        assert_eq!(
            meta.runtime_ref().unwrap().unwrap().to_string(),
            "runtime/org.test.Platform/x86_64/1.0"
        );
        assert_eq!(
            meta.sdk_ref().unwrap().unwrap().to_string(),
            "runtime/org.test.Sdk/x86_64/1.0"
        );
        assert_eq!(meta.extensions.len(), 2);
        let locale = &meta.extensions[0];
        assert!(locale.autodelete && locale.locale_subset);
        assert_eq!(locale.branches("stable"), vec!["stable"]);
        let plugin = &meta.extensions[1];
        assert_eq!(plugin.branches("stable"), vec!["1.0", "beta"]);
        assert!(plugin.matches_id("org.test.App.Plugin.Foo"));
        assert!(!plugin.matches_id("org.test.App.PluginFoo"));
        assert_eq!(plugin.autoprune_unless.as_deref(), Some("active-gl-driver"));
    }

    #[test]
    fn parses_runtime_extension_with_extra_data() {
        let meta = AppMetadata::parse(
            "[Runtime]\nname=org.test.Platform.GL.nvidia\n\n[ExtensionOf]\nref=runtime/org.test.Platform/x86_64/1.0\n\n[Extra Data]\nNoRuntime=true\n",
        )
        .unwrap();
        assert_eq!(meta.kind, RefKind::Runtime);
        assert!(meta.has_extra_data_group());
        assert!(meta.extra_data_no_runtime);
        assert_eq!(
            meta.extension_of_ref().unwrap().unwrap().id(),
            "org.test.Platform"
        );
    }

    #[test]
    fn requires_a_kind_group() {
        assert!(AppMetadata::parse("[Other]\nx=1\n").is_err());
    }
}
