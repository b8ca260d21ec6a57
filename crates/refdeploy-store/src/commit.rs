//! Commit objects: `(a{sv}aya(say)sstayay)`.

use refdeploy_domain::{VarDict, Variant, VariantType};

use crate::error::{StoreError, StoreResult};
use crate::object::sha256_hex;

pub const COMMIT_TYPE: &str = "(a{sv}aya(say)sstayay)";

pub const META_REF_BINDING: &str = "ostree.ref-binding";
pub const META_COLLECTION_BINDING: &str = "ostree.collection-binding";
pub const META_ENDOFLIFE: &str = "ostree.endoflife";
pub const META_ENDOFLIFE_REBASE: &str = "ostree.endoflife-rebase";
pub const META_XA_REF: &str = "xa.ref";
pub const META_XA_METADATA: &str = "xa.metadata";
pub const META_XA_INSTALLED_SIZE: &str = "xa.installed-size";
pub const META_XA_DOWNLOAD_SIZE: &str = "xa.download-size";
pub const META_XA_EXTRA_DATA_SOURCES: &str = "xa.extra-data-sources";
pub const META_XA_ALT_ID: &str = "xa.alt-id";
pub const META_XA_TOKEN_TYPE: &str = "xa.token-type";

#[derive(Clone, Debug, PartialEq)]
pub struct Commit {
    pub metadata: VarDict,
    pub parent: Option<String>,
    pub subject: String,
    pub body: String,
    /// Seconds since the epoch.
    pub timestamp: u64,
    pub root_tree: String,
    pub root_meta: String,
}

/// Whether the commit's content is fully present locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitState {
    Complete,
    Partial,
}

fn checksum_bytes(checksum: &str) -> Vec<u8> {
    hex::decode(checksum).unwrap_or_default()
}

fn checksum_from(value: Option<&Variant>) -> Option<String> {
    value
        .and_then(Variant::as_bytes)
        .filter(|bytes| bytes.len() == 32)
        .map(hex::encode)
}

impl Commit {
    #[must_use]
    pub fn new(root_tree: &str, root_meta: &str, timestamp: u64) -> Self {
        Self {
            metadata: VarDict::new(),
            parent: None,
            subject: String::new(),
            body: String::new(),
            timestamp,
            root_tree: root_tree.to_string(),
            root_meta: root_meta.to_string(),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let related = Variant::Array(
            VariantType::Tuple(vec![
                VariantType::String,
                VariantType::Array(Box::new(VariantType::Byte)),
            ]),
            Vec::new(),
        );
        Variant::tuple(vec![
            Variant::vardict(&self.metadata),
            Variant::bytes(
                &self
                    .parent
                    .as_deref()
                    .map(checksum_bytes)
                    .unwrap_or_default(),
            ),
            related,
            Variant::string(&self.subject),
            Variant::string(&self.body),
            Variant::Uint64(u64::from_le_bytes(self.timestamp.to_be_bytes())),
            Variant::bytes(&checksum_bytes(&self.root_tree)),
            Variant::bytes(&checksum_bytes(&self.root_meta)),
        ])
        .to_bytes()
    }

    /// The commit's checksum is the SHA-256 of its serialized form.
    #[must_use]
    pub fn checksum(&self) -> String {
        sha256_hex(&self.to_bytes())
    }

    pub fn from_bytes(checksum: &str, data: &[u8]) -> StoreResult<Self> {
        let decode = |source| StoreError::Decode {
            checksum: checksum.to_string(),
            source,
        };
        let value = Variant::parse(COMMIT_TYPE, data).map_err(decode)?;
        let metadata = value
            .child(0)
            .map(Variant::to_vardict)
            .transpose()
            .map_err(decode)?
            .unwrap_or_default();
        let text = |index| {
            value
                .child(index)
                .and_then(Variant::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let timestamp = value
            .child(5)
            .and_then(Variant::as_u64)
            .map_or(0, |raw| u64::from_be_bytes(raw.to_le_bytes()));
        Ok(Self {
            metadata,
            parent: checksum_from(value.child(1)),
            subject: text(3),
            body: text(4),
            timestamp,
            root_tree: checksum_from(value.child(6)).unwrap_or_default(),
            root_meta: checksum_from(value.child(7)).unwrap_or_default(),
        })
    }

    #[must_use]
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Variant::as_str)
    }

    /// Big-endian `t` values such as `xa.installed-size`.
    #[must_use]
    pub fn meta_u64_be(&self, key: &str) -> Option<u64> {
        self.metadata
            .get(key)
            .and_then(Variant::as_u64)
            .map(|raw| u64::from_be_bytes(raw.to_le_bytes()))
    }

    pub fn set_meta_u64_be(&mut self, key: &str, value: u64) {
        self.metadata.insert(
            key.to_string(),
            Variant::Uint64(u64::from_le_bytes(value.to_be_bytes())),
        );
    }

    /// Refs this commit is bound to; empty when unbound.
    #[must_use]
    pub fn ref_bindings(&self) -> Vec<String> {
        self.metadata
            .get(META_REF_BINDING)
            .and_then(Variant::as_strv)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn collection_binding(&self) -> Option<&str> {
        self.meta_str(META_COLLECTION_BINDING)
    }
}
