//! Typed view of `[remote "<name>"]` groups in the installation's repo config.

use std::path::PathBuf;

use anyhow::{bail, Result};
use refdeploy_domain::{parse_remote_group, remote_group, KeyFile};
use refdeploy_store::{Ed25519Verifier, StoreResult};

pub const KEY_URL: &str = "url";
pub const KEY_COLLECTION_ID: &str = "collection-id";
pub const KEY_GPG_VERIFY: &str = "gpg-verify";
pub const KEY_GPG_VERIFY_SUMMARY: &str = "gpg-verify-summary";
pub const KEY_TITLE: &str = "xa.title";
pub const KEY_NOENUMERATE: &str = "xa.noenumerate";
pub const KEY_NODEPS: &str = "xa.nodeps";
pub const KEY_DISABLE: &str = "xa.disable";
pub const KEY_PRIO: &str = "xa.prio";
pub const KEY_FILTER: &str = "xa.filter";
pub const KEY_SUBSET: &str = "xa.subset";
pub const KEY_MAIN_REF: &str = "xa.main-ref";
pub const KEY_SIGN_KEYS: &str = "xa.sign-keys";
pub const KEY_DEFAULT_TOKEN_TYPE: &str = "xa.default-token-type";

pub const OCI_URL_PREFIX: &str = "oci+";
const DEFAULT_PRIO: i64 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteConfig {
    pub name: String,
    pub url: String,
    pub collection_id: Option<String>,
    pub gpg_verify: bool,
    pub gpg_verify_summary: bool,
    pub title: Option<String>,
    pub noenumerate: bool,
    pub nodeps: bool,
    pub disabled: bool,
    pub prio: i64,
    pub filter: Option<PathBuf>,
    pub subset: Option<String>,
    pub main_ref: Option<String>,
    pub sign_keys: Vec<String>,
    pub default_token_type: Option<i32>,
}

impl RemoteConfig {
    #[must_use]
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            collection_id: None,
            gpg_verify: true,
            gpg_verify_summary: true,
            title: None,
            noenumerate: false,
            nodeps: false,
            disabled: false,
            prio: DEFAULT_PRIO,
            filter: None,
            subset: None,
            main_ref: None,
            sign_keys: Vec::new(),
            default_token_type: None,
        }
    }

    /// Read the remote `name` from `config`; `None` if it is not configured.
    #[must_use]
    pub fn from_keyfile(config: &KeyFile, name: &str) -> Option<Self> {
        let group = remote_group(name);
        let url = config.get_string(&group, KEY_URL)?;
        let defaults = Self::new(name, &url);
        let integer = |key: &str| config.get_integer(&group, key).ok().flatten();
        Some(Self {
            collection_id: config
                .get_string(&group, KEY_COLLECTION_ID)
                .filter(|id| !id.is_empty()),
            gpg_verify: config.bool_or(&group, KEY_GPG_VERIFY, defaults.gpg_verify),
            gpg_verify_summary: config.bool_or(
                &group,
                KEY_GPG_VERIFY_SUMMARY,
                defaults.gpg_verify_summary,
            ),
            title: config.get_string(&group, KEY_TITLE),
            noenumerate: config.bool_or(&group, KEY_NOENUMERATE, false),
            nodeps: config.bool_or(&group, KEY_NODEPS, false),
            disabled: config.bool_or(&group, KEY_DISABLE, false),
            prio: integer(KEY_PRIO).unwrap_or(DEFAULT_PRIO),
            filter: config
                .get_string(&group, KEY_FILTER)
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            subset: config
                .get_string(&group, KEY_SUBSET)
                .filter(|subset| !subset.is_empty()),
            main_ref: config.get_string(&group, KEY_MAIN_REF),
            sign_keys: config
                .get_string_list(&group, KEY_SIGN_KEYS)
                .unwrap_or_default(),
            default_token_type: integer(KEY_DEFAULT_TOKEN_TYPE)
                .and_then(|value| i32::try_from(value).ok()),
            ..defaults
        })
    }

    /// Write these settings into `config`, keeping keys this type does not model.
    pub fn apply_to(&self, config: &mut KeyFile) {
        let group = remote_group(&self.name);
        config.set_string(&group, KEY_URL, &self.url);
        set_optional(config, &group, KEY_COLLECTION_ID, self.collection_id.as_deref());
        config.set_bool(&group, KEY_GPG_VERIFY, self.gpg_verify);
        config.set_bool(&group, KEY_GPG_VERIFY_SUMMARY, self.gpg_verify_summary);
        set_optional(config, &group, KEY_TITLE, self.title.as_deref());
        set_flag(config, &group, KEY_NOENUMERATE, self.noenumerate);
        set_flag(config, &group, KEY_NODEPS, self.nodeps);
        set_flag(config, &group, KEY_DISABLE, self.disabled);
        if self.prio == DEFAULT_PRIO {
            config.remove_key(&group, KEY_PRIO);
        } else {
            config.set_integer(&group, KEY_PRIO, self.prio);
        }
        let filter = self.filter.as_ref().map(|path| path.to_string_lossy());
        set_optional(config, &group, KEY_FILTER, filter.as_deref());
        set_optional(config, &group, KEY_SUBSET, self.subset.as_deref());
        set_optional(config, &group, KEY_MAIN_REF, self.main_ref.as_deref());
        if self.sign_keys.is_empty() {
            config.remove_key(&group, KEY_SIGN_KEYS);
        } else {
            config.set_string_list(&group, KEY_SIGN_KEYS, &self.sign_keys);
        }
        match self.default_token_type {
            Some(token_type) => {
                config.set_integer(&group, KEY_DEFAULT_TOKEN_TYPE, i64::from(token_type));
            }
            None => {
                config.remove_key(&group, KEY_DEFAULT_TOKEN_TYPE);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(['/', '"', '[', ']']) {
            bail!("invalid remote name '{}'", self.name);
        }
        if self.url.is_empty() {
            bail!("remote '{}' has no url", self.name);
        }
        if (self.gpg_verify || self.gpg_verify_summary) && self.sign_keys.is_empty() {
            bail!(
                "remote '{}' requires signature verification but has no {KEY_SIGN_KEYS}",
                self.name
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn is_oci(&self) -> bool {
        self.url.starts_with(OCI_URL_PREFIX)
    }

    /// The URL with any `oci+` scheme prefix removed.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.url.strip_prefix(OCI_URL_PREFIX).unwrap_or(&self.url)
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        refdeploy_store::is_local_uri(&self.url)
    }

    /// Remotes created automatically for ref-file installs.
    #[must_use]
    pub fn is_origin_remote(&self) -> bool {
        self.name.ends_with("-origin") && self.noenumerate
    }

    pub fn verifier(&self) -> StoreResult<Ed25519Verifier> {
        Ed25519Verifier::from_base64_keys(&self.sign_keys)
    }
}

fn set_optional(config: &mut KeyFile, group: &str, key: &str, value: Option<&str>) {
    match value {
        Some(value) => config.set_string(group, key, value),
        None => {
            config.remove_key(group, key);
        }
    }
}

fn set_flag(config: &mut KeyFile, group: &str, key: &str, value: bool) {
    if value {
        config.set_bool(group, key, true);
    } else {
        config.remove_key(group, key);
    }
}

/// Names of every configured remote, in config order.
#[must_use]
pub fn remote_names(config: &KeyFile) -> Vec<String> {
    config
        .groups()
        .into_iter()
        .filter_map(parse_remote_group)
        .map(ToOwned::to_owned)
        .collect()
}

/// Every configured remote, highest priority first.
#[must_use]
pub fn load_remotes(config: &KeyFile) -> Vec<RemoteConfig> {
    let mut remotes: Vec<RemoteConfig> = remote_names(config)
        .iter()
        .filter_map(|name| RemoteConfig::from_keyfile(config, name))
        .collect();
    remotes.sort_by(|a, b| b.prio.cmp(&a.prio));
    remotes
}
