//! The `deploy` file written next to every checkout.
//!
//! Wire type is `(ssasta{sv})`: origin, commit, subpaths, installed size
//! (big-endian), and an ordered metadata dictionary. Keys this crate does not
//! know about are carried through untouched.

use crate::error::DeployError;
use crate::variant::{VarDict, Variant, VariantType};

pub const DEPLOY_DATA_TYPE: &str = "(ssasta{sv})";

/// Schema version written by this build.
pub const DEPLOY_VERSION_CURRENT: i32 = 4;
/// Callers that do not need any derived field.
pub const DEPLOY_VERSION_ANY: i32 = 0;

pub const KEY_DEPLOY_VERSION: &str = "deploy-version";
pub const KEY_TIMESTAMP: &str = "timestamp";
pub const KEY_PREVIOUS_IDS: &str = "previous-ids";
pub const KEY_ALT_ID: &str = "alt-id";
pub const KEY_EOL: &str = "eol";
pub const KEY_EOL_REBASE: &str = "eolr";
pub const KEY_RUNTIME: &str = "runtime";
pub const KEY_EXTENSION_OF: &str = "extension-of";
pub const KEY_APPDATA_NAME: &str = "appdata-name";
pub const KEY_APPDATA_SUMMARY: &str = "appdata-summary";
pub const KEY_APPDATA_VERSION: &str = "appdata-version";
pub const KEY_APPDATA_LICENSE: &str = "appdata-license";
pub const KEY_APPDATA_CONTENT_RATING: &str = "appdata-content-rating";

#[derive(Clone, Debug, PartialEq)]
pub struct DeployData {
    pub origin: String,
    pub commit: String,
    pub subpaths: Vec<String>,
    pub installed_size: u64,
    pub metadata: VarDict,
}

/// OARS-style rating: a type plus category → level map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentRating {
    pub rating_type: String,
    pub values: Vec<(String, String)>,
}

impl DeployData {
    #[must_use]
    pub fn new(origin: &str, commit: &str, subpaths: Vec<String>, installed_size: u64) -> Self {
        Self {
            origin: origin.to_string(),
            commit: commit.to_string(),
            subpaths,
            installed_size,
            metadata: VarDict::new(),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DeployError> {
        let value = Variant::parse(DEPLOY_DATA_TYPE, data)
            .map_err(|err| DeployError::invalid_data(format!("deploy data: {err}")))?;
        let field = |index: usize| {
            value
                .child(index)
                .ok_or_else(|| DeployError::invalid_data("deploy data is truncated"))
        };
        let origin = field(0)?.as_str().unwrap_or_default().to_string();
        let commit = field(1)?.as_str().unwrap_or_default().to_string();
        let subpaths = field(2)?.as_strv().unwrap_or_default();
        let installed_size = u64::from_be_bytes(field(3)?.as_u64().unwrap_or(0).to_le_bytes());
        let metadata = field(4)?
            .to_vardict()
            .map_err(|err| DeployError::invalid_data(format!("deploy metadata: {err}")))?;
        Ok(Self {
            origin,
            commit,
            subpaths,
            installed_size,
            metadata,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        Variant::tuple(vec![
            Variant::string(&self.origin),
            Variant::string(&self.commit),
            Variant::strv(self.subpaths.iter().map(String::as_str)),
            Variant::Uint64(u64::from_le_bytes(self.installed_size.to_be_bytes())),
            Variant::vardict(&self.metadata),
        ])
        .to_bytes()
    }

    #[must_use]
    pub fn version(&self) -> i32 {
        self.metadata
            .get(KEY_DEPLOY_VERSION)
            .and_then(Variant::as_i32)
            .unwrap_or(0)
    }

    pub fn set_version(&mut self, version: i32) {
        self.metadata
            .insert(KEY_DEPLOY_VERSION.to_string(), Variant::Int32(version));
    }

    fn string(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Variant::as_str)
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.metadata
            .insert(key.to_string(), Variant::string(value));
    }

    /// Commit timestamp in seconds since the epoch.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.metadata
            .get(KEY_TIMESTAMP)
            .and_then(Variant::as_u64)
            .map_or(0, |raw| u64::from_be_bytes(raw.to_le_bytes()))
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.metadata.insert(
            KEY_TIMESTAMP.to_string(),
            Variant::Uint64(u64::from_le_bytes(timestamp.to_be_bytes())),
        );
    }

    #[must_use]
    pub fn previous_ids(&self) -> Vec<String> {
        self.metadata
            .get(KEY_PREVIOUS_IDS)
            .and_then(Variant::as_strv)
            .unwrap_or_default()
    }

    pub fn set_previous_ids(&mut self, ids: &[String]) {
        if ids.is_empty() {
            self.metadata.shift_remove(KEY_PREVIOUS_IDS);
        } else {
            self.metadata.insert(
                KEY_PREVIOUS_IDS.to_string(),
                Variant::strv(ids.iter().map(String::as_str)),
            );
        }
    }

    #[must_use]
    pub fn alt_id(&self) -> Option<&str> {
        self.string(KEY_ALT_ID)
    }

    #[must_use]
    pub fn eol(&self) -> Option<&str> {
        self.string(KEY_EOL)
    }

    #[must_use]
    pub fn eol_rebase(&self) -> Option<&str> {
        self.string(KEY_EOL_REBASE)
    }

    /// Short `id/arch/branch` runtime for apps.
    #[must_use]
    pub fn runtime(&self) -> Option<&str> {
        self.string(KEY_RUNTIME)
    }

    #[must_use]
    pub fn extension_of(&self) -> Option<&str> {
        self.string(KEY_EXTENSION_OF)
    }

    /// Localized display name, trying each language before the untranslated value.
    #[must_use]
    pub fn appdata_name(&self, languages: &[String]) -> Option<&str> {
        self.localized(KEY_APPDATA_NAME, languages)
    }

    #[must_use]
    pub fn appdata_summary(&self, languages: &[String]) -> Option<&str> {
        self.localized(KEY_APPDATA_SUMMARY, languages)
    }

    fn localized(&self, key: &str, languages: &[String]) -> Option<&str> {
        languages
            .iter()
            .find_map(|lang| self.string(&format!("{key}@{lang}")))
            .or_else(|| self.string(key))
    }

    #[must_use]
    pub fn appdata_version(&self) -> Option<&str> {
        self.string(KEY_APPDATA_VERSION)
    }

    #[must_use]
    pub fn appdata_license(&self) -> Option<&str> {
        self.string(KEY_APPDATA_LICENSE)
    }

    #[must_use]
    pub fn content_rating(&self) -> Option<ContentRating> {
        let value = self.metadata.get(KEY_APPDATA_CONTENT_RATING)?;
        let rating_type = value.child(0)?.as_str()?.to_string();
        let values = value
            .child(1)?
            .as_array()?
            .iter()
            .filter_map(|entry| {
                Some((
                    entry.child(0)?.as_str()?.to_string(),
                    entry.child(1)?.as_str()?.to_string(),
                ))
            })
            .collect();
        Some(ContentRating {
            rating_type,
            values,
        })
    }

    pub fn set_content_rating(&mut self, rating: &ContentRating) {
        let map = Variant::string_dict(
            VariantType::String,
            rating
                .values
                .iter()
                .map(|(k, v)| (k.clone(), Variant::string(v)))
                .collect(),
        );
        self.metadata.insert(
            KEY_APPDATA_CONTENT_RATING.to_string(),
            Variant::tuple(vec![Variant::string(&rating.rating_type), map]),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installed_size_is_big_endian_on_disk() {
        let data = DeployData::new("origin", "abc", vec![], 0x0102);
        let bytes = data.to_bytes();
        // origin\0 abc\0 (empty as) pad to 8, then the size.
        let size_at = 16;
        assert_eq!(&bytes[size_at..size_at + 8], &[0, 0, 0, 0, 0, 0, 1, 2]);
        let decoded = DeployData::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.installed_size, 0x0102);
    }

    #[test]
    fn keeps_unknown_metadata_keys() {
        let mut data = DeployData::new(
            "flathub",
            "c1",
            vec!["/share/locale/de".into()],
            4096,
        );
        data.set_version(DEPLOY_VERSION_CURRENT);
        data.set_timestamp(1_700_000_000);
        data.metadata
            .insert("x-future-key".into(), Variant::Uint32(9));
        data.set_string(&format!("{KEY_APPDATA_NAME}@de"), "Testanwendung");
        data.set_string(KEY_APPDATA_NAME, "Test App");
        data.set_content_rating(&ContentRating {
            rating_type: "oars-1.1".into(),
            values: vec![("violence-cartoon".into(), "mild".into())],
        });

        let decoded = DeployData::from_bytes(&data.to_bytes()).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(decoded.version(), DEPLOY_VERSION_CURRENT);
        assert_eq!(decoded.timestamp(), 1_700_000_000);
        assert_eq!(
            decoded.metadata.get("x-future-key").and_then(Variant::as_u32),
            Some(9)
        );
        assert_eq!(decoded.appdata_name(&["de".into()]), Some("Testanwendung"));
        assert_eq!(decoded.appdata_name(&["fr".into()]), Some("Test App"));
        assert_eq!(
            decoded.content_rating().map(|r| r.values),
            Some(vec![("violence-cartoon".to_string(), "mild".to_string())])
        );
    }

    #[test]
    fn garbage_is_invalid_data() {
        let err = DeployData::from_bytes(b"\x01\x02").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidData);
    }
}
