//! Summary and summary-index encodings.
//!
//! A summary is `(a(s(taya{sv}))a{sv})`: refs sorted by name, each with the
//! commit size, commit checksum and per-ref metadata, then summary metadata.
//! An index is `(a{s(ayaaya{sv})}a{sv})`: per `[<subset>-]<arch>` key, the
//! subsummary checksum, its previous checksums (newest first) and metadata.
//!
//! Two cache encodings exist. Version 0 keeps `xa.cache` (`v` wrapping
//! `a{s(tts)}`) and `xa.sparse-cache` (`a{sa{sv}}`) in the summary metadata.
//! Version 1 stores `xa.data` (`(tts)`) and the sparse keys in each ref's own
//! metadata.

use std::collections::BTreeMap;

use refdeploy_domain::{DeployError, VarDict, Variant, VariantType};

pub const SUMMARY_TYPE: &str = "(a(s(taya{sv}))a{sv})";
pub const INDEX_TYPE: &str = "(a{s(ayaaya{sv})}a{sv})";

pub const KEY_SUMMARY_VERSION: &str = "xa.summary-version";
pub const KEY_CACHE: &str = "xa.cache";
pub const KEY_SPARSE_CACHE: &str = "xa.sparse-cache";
pub const KEY_CACHE_VERSION: &str = "xa.cache-version";
pub const KEY_DEFAULT_TOKEN_TYPE: &str = "xa.default-token-type";
pub const KEY_DATA: &str = "xa.data";
pub const KEY_COMMIT_TIMESTAMP: &str = "ostree.commit.timestamp";
pub const KEY_LAST_MODIFIED: &str = "ostree.summary.last-modified";
pub const KEY_COLLECTION_ID: &str = "ostree.summary.collection-id";
pub const KEY_COLLECTION_MAP: &str = "ostree.summary.collection-map";

pub const SPARSE_EOL: &str = "eol";
pub const SPARSE_EOL_REBASE: &str = "eolr";
pub const SPARSE_TOKEN_TYPE: &str = "tokt";
pub const SPARSE_EXTRA_DATA_SIZE: &str = "eds";

/// Highest cache encoding this build understands.
pub const SUMMARY_VERSION_MAX: u32 = 1;

pub(crate) fn vardict_type() -> VariantType {
    VariantType::Array(Box::new(VariantType::DictEntry(
        Box::new(VariantType::String),
        Box::new(VariantType::Variant),
    )))
}

fn byte_array_type() -> VariantType {
    VariantType::Array(Box::new(VariantType::Byte))
}

fn ref_entry_type() -> VariantType {
    VariantType::Tuple(vec![
        VariantType::String,
        VariantType::Tuple(vec![VariantType::Uint64, byte_array_type(), vardict_type()]),
    ])
}

pub(crate) fn be_u64(value: u64) -> Variant {
    Variant::Uint64(u64::from_le_bytes(value.to_be_bytes()))
}

pub(crate) fn from_be_u64(value: &Variant) -> Option<u64> {
    value
        .as_u64()
        .map(|raw| u64::from_be_bytes(raw.to_le_bytes()))
}

fn invalid(what: &str) -> DeployError {
    DeployError::invalid_data(format!("malformed {what}"))
}

fn checksum_of(value: Option<&Variant>, what: &str) -> Result<String, DeployError> {
    value
        .and_then(Variant::as_bytes)
        .filter(|bytes| bytes.len() == 32)
        .map(hex::encode)
        .ok_or_else(|| invalid(what))
}

fn checksum_bytes(checksum: &str) -> Variant {
    Variant::bytes(&hex::decode(checksum).unwrap_or_default())
}

#[derive(Clone, Debug, PartialEq)]
pub struct SummaryRef {
    pub commit_size: u64,
    pub checksum: String,
    pub metadata: VarDict,
}

impl SummaryRef {
    #[must_use]
    pub fn new(checksum: &str, commit_size: u64, timestamp: u64) -> Self {
        let mut metadata = VarDict::new();
        metadata.insert(KEY_COMMIT_TIMESTAMP.to_string(), be_u64(timestamp));
        Self {
            commit_size,
            checksum: checksum.to_string(),
            metadata,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.metadata
            .get(KEY_COMMIT_TIMESTAMP)
            .and_then(from_be_u64)
            .unwrap_or(0)
    }
}

pub type RefMap = BTreeMap<String, SummaryRef>;

/// Sizes and metadata of a ref, as recorded in the summary cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheData {
    pub installed_size: u64,
    pub download_size: u64,
    pub metadata: String,
}

impl CacheData {
    fn from_variant(value: &Variant) -> Option<Self> {
        Some(Self {
            installed_size: from_be_u64(value.child(0)?)?,
            download_size: from_be_u64(value.child(1)?)?,
            metadata: value.child(2)?.as_str()?.to_string(),
        })
    }

    #[must_use]
    pub fn to_variant(&self) -> Variant {
        Variant::tuple(vec![
            be_u64(self.installed_size),
            be_u64(self.download_size),
            Variant::string(&self.metadata),
        ])
    }
}

/// Sparse per-ref values: only present when set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SparseData {
    pub eol: Option<String>,
    pub eol_rebase: Option<String>,
    pub token_type: Option<i32>,
    /// Number of extra-data sources and their total download size.
    pub extra_data: Option<(u32, u64)>,
}

impl SparseData {
    #[must_use]
    pub fn from_dict(dict: &VarDict) -> Self {
        let string = |key: &str| dict.get(key).and_then(Variant::as_str).map(ToOwned::to_owned);
        Self {
            eol: string(SPARSE_EOL),
            eol_rebase: string(SPARSE_EOL_REBASE),
            token_type: dict.get(SPARSE_TOKEN_TYPE).and_then(Variant::as_i32),
            extra_data: dict.get(SPARSE_EXTRA_DATA_SIZE).and_then(|value| {
                Some((value.child(0)?.as_u32()?, from_be_u64(value.child(1)?)?))
            }),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Insert the set values into `dict`.
    pub fn write_into(&self, dict: &mut VarDict) {
        if let Some(eol) = &self.eol {
            dict.insert(SPARSE_EOL.to_string(), Variant::string(eol));
        }
        if let Some(rebase) = &self.eol_rebase {
            dict.insert(SPARSE_EOL_REBASE.to_string(), Variant::string(rebase));
        }
        if let Some(token_type) = self.token_type {
            dict.insert(SPARSE_TOKEN_TYPE.to_string(), Variant::Int32(token_type));
        }
        if let Some((count, size)) = self.extra_data {
            dict.insert(
                SPARSE_EXTRA_DATA_SIZE.to_string(),
                Variant::tuple(vec![Variant::Uint32(count), be_u64(size)]),
            );
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Summary {
    pub refs: RefMap,
    /// Refs of other collections carried by this summary.
    pub collection_map: BTreeMap<String, RefMap>,
    pub metadata: VarDict,
}

fn decode_ref_map(value: &Variant) -> Result<RefMap, DeployError> {
    let entries = value.as_array().ok_or_else(|| invalid("summary ref map"))?;
    let mut refs = RefMap::new();
    for entry in entries {
        let name = entry
            .child(0)
            .and_then(Variant::as_str)
            .ok_or_else(|| invalid("summary ref name"))?;
        let data = entry.child(1).ok_or_else(|| invalid("summary ref entry"))?;
        let commit_size = data.child(0).and_then(from_be_u64).unwrap_or(0);
        let checksum = checksum_of(data.child(1), "summary ref checksum")?;
        let metadata = data
            .child(2)
            .ok_or_else(|| invalid("summary ref metadata"))?
            .to_vardict()
            .map_err(|err| DeployError::invalid_data(format!("summary ref metadata: {err}")))?;
        refs.insert(
            name.to_string(),
            SummaryRef {
                commit_size,
                checksum,
                metadata,
            },
        );
    }
    Ok(refs)
}

fn encode_ref_map(refs: &RefMap) -> Variant {
    Variant::Array(
        ref_entry_type(),
        refs.iter()
            .map(|(name, entry)| {
                Variant::tuple(vec![
                    Variant::string(name),
                    Variant::tuple(vec![
                        be_u64(entry.commit_size),
                        checksum_bytes(&entry.checksum),
                        Variant::vardict(&entry.metadata),
                    ]),
                ])
            })
            .collect(),
    )
}

impl Summary {
    pub fn from_bytes(data: &[u8]) -> Result<Self, DeployError> {
        let value = Variant::parse(SUMMARY_TYPE, data)
            .map_err(|err| DeployError::invalid_data(format!("summary: {err}")))?;
        let refs = decode_ref_map(value.child(0).ok_or_else(|| invalid("summary"))?)?;
        let mut metadata = value
            .child(1)
            .ok_or_else(|| invalid("summary"))?
            .to_vardict()
            .map_err(|err| DeployError::invalid_data(format!("summary metadata: {err}")))?;
        let mut collection_map = BTreeMap::new();
        if let Some(map) = metadata.shift_remove(KEY_COLLECTION_MAP) {
            for entry in map.as_array().ok_or_else(|| invalid("collection map"))? {
                let id = entry
                    .child(0)
                    .and_then(Variant::as_str)
                    .ok_or_else(|| invalid("collection map key"))?;
                let refs = decode_ref_map(entry.child(1).ok_or_else(|| invalid("collection map"))?)?;
                collection_map.insert(id.to_string(), refs);
            }
        }
        Ok(Self {
            refs,
            collection_map,
            metadata,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut metadata = self.metadata.clone();
        if !self.collection_map.is_empty() {
            let entries = self
                .collection_map
                .iter()
                .map(|(id, refs)| (id.clone(), encode_ref_map(refs)))
                .collect();
            metadata.insert(
                KEY_COLLECTION_MAP.to_string(),
                Variant::string_dict(VariantType::Array(Box::new(ref_entry_type())), entries),
            );
        }
        Variant::tuple(vec![encode_ref_map(&self.refs), Variant::vardict(&metadata)]).to_bytes()
    }

    #[must_use]
    pub fn collection_id(&self) -> Option<&str> {
        self.metadata
            .get(KEY_COLLECTION_ID)
            .and_then(Variant::as_str)
            .filter(|id| !id.is_empty())
    }

    /// The ref map for `collection_id`; the main map when `None`.
    #[must_use]
    pub fn refs_for(&self, collection_id: Option<&str>) -> Option<&RefMap> {
        match collection_id {
            None => Some(&self.refs),
            Some(id) if self.collection_id() == Some(id) => Some(&self.refs),
            Some(id) => self.collection_map.get(id),
        }
    }

    #[must_use]
    pub fn lookup(&self, collection_id: Option<&str>, reference: &str) -> Option<&SummaryRef> {
        self.refs_for(collection_id)?.get(reference)
    }

    #[must_use]
    pub fn summary_version(&self) -> u32 {
        self.metadata
            .get(KEY_SUMMARY_VERSION)
            .and_then(Variant::as_u32)
            .unwrap_or(0)
    }

    #[must_use]
    pub fn cache_version(&self) -> u32 {
        self.metadata
            .get(KEY_CACHE_VERSION)
            .and_then(Variant::as_u32)
            .unwrap_or(0)
    }

    #[must_use]
    pub fn default_token_type(&self) -> Option<i32> {
        self.metadata
            .get(KEY_DEFAULT_TOKEN_TYPE)
            .and_then(Variant::as_i32)
    }

    fn checked_version(&self) -> Result<u32, DeployError> {
        match self.summary_version() {
            version @ 0..=SUMMARY_VERSION_MAX => Ok(version),
            other => Err(DeployError::invalid_data(format!(
                "unsupported summary version {other}"
            ))),
        }
    }

    /// Sizes and metadata recorded for `reference`.
    pub fn lookup_cache(
        &self,
        collection_id: Option<&str>,
        reference: &str,
    ) -> Result<Option<CacheData>, DeployError> {
        let value = match self.checked_version()? {
            0 => self
                .metadata
                .get(KEY_CACHE)
                .map(Variant::unboxed)
                .and_then(|cache| cache.lookup(reference)),
            _ => self
                .lookup(collection_id, reference)
                .and_then(|entry| entry.metadata.get(KEY_DATA)),
        };
        match value {
            None => Ok(None),
            Some(value) => CacheData::from_variant(value)
                .map(Some)
                .ok_or_else(|| invalid("summary cache entry")),
        }
    }

    pub fn lookup_sparse_cache(
        &self,
        collection_id: Option<&str>,
        reference: &str,
    ) -> Result<Option<SparseData>, DeployError> {
        let sparse = match self.checked_version()? {
            0 => match self
                .metadata
                .get(KEY_SPARSE_CACHE)
                .and_then(|cache| cache.lookup(reference))
            {
                Some(dict) => Some(
                    dict.to_vardict()
                        .map_err(|err| DeployError::invalid_data(format!("sparse cache: {err}")))?,
                ),
                None => None,
            },
            _ => self
                .lookup(collection_id, reference)
                .map(|entry| entry.metadata.clone()),
        };
        Ok(sparse
            .map(|dict| SparseData::from_dict(&dict))
            .filter(|data| !data.is_empty()))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubsummaryDescriptor {
    pub checksum: String,
    /// Previous checksums, newest first.
    pub history: Vec<String>,
    pub metadata: VarDict,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SummaryIndex {
    pub subsummaries: BTreeMap<String, SubsummaryDescriptor>,
    pub metadata: VarDict,
}

fn descriptor_type() -> VariantType {
    VariantType::Tuple(vec![
        byte_array_type(),
        VariantType::Array(Box::new(byte_array_type())),
        vardict_type(),
    ])
}

impl SummaryIndex {
    pub fn from_bytes(data: &[u8]) -> Result<Self, DeployError> {
        let value = Variant::parse(INDEX_TYPE, data)
            .map_err(|err| DeployError::invalid_data(format!("summary index: {err}")))?;
        let entries = value
            .child(0)
            .and_then(Variant::as_array)
            .ok_or_else(|| invalid("summary index"))?;
        let mut subsummaries = BTreeMap::new();
        for entry in entries {
            let key = entry
                .child(0)
                .and_then(Variant::as_str)
                .ok_or_else(|| invalid("summary index key"))?;
            let descriptor = entry.child(1).ok_or_else(|| invalid("summary index entry"))?;
            let checksum = checksum_of(descriptor.child(0), "subsummary checksum")?;
            let history = descriptor
                .child(1)
                .and_then(Variant::as_array)
                .ok_or_else(|| invalid("subsummary history"))?
                .iter()
                .map(|old| checksum_of(Some(old), "subsummary history entry"))
                .collect::<Result<Vec<_>, _>>()?;
            let metadata = descriptor
                .child(2)
                .ok_or_else(|| invalid("subsummary metadata"))?
                .to_vardict()
                .map_err(|err| DeployError::invalid_data(format!("subsummary metadata: {err}")))?;
            subsummaries.insert(
                key.to_string(),
                SubsummaryDescriptor {
                    checksum,
                    history,
                    metadata,
                },
            );
        }
        let metadata = value
            .child(1)
            .ok_or_else(|| invalid("summary index"))?
            .to_vardict()
            .map_err(|err| DeployError::invalid_data(format!("summary index metadata: {err}")))?;
        Ok(Self {
            subsummaries,
            metadata,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let entries = self
            .subsummaries
            .iter()
            .map(|(key, descriptor)| {
                let history = Variant::Array(
                    byte_array_type(),
                    descriptor.history.iter().map(|c| checksum_bytes(c)).collect(),
                );
                (
                    key.clone(),
                    Variant::tuple(vec![
                        checksum_bytes(&descriptor.checksum),
                        history,
                        Variant::vardict(&descriptor.metadata),
                    ]),
                )
            })
            .collect();
        Variant::tuple(vec![
            Variant::string_dict(descriptor_type(), entries),
            Variant::vardict(&self.metadata),
        ])
        .to_bytes()
    }

    /// Descriptors for `subset` (or the unnamed set), keyed by arch.
    #[must_use]
    pub fn arch_map(&self, subset: Option<&str>) -> BTreeMap<String, SubsummaryDescriptor> {
        self.subsummaries
            .iter()
            .filter_map(|(key, descriptor)| {
                let arch = match subset {
                    Some(subset) => key.strip_prefix(subset)?.strip_prefix('-')?,
                    None if key.contains('-') => return None,
                    None => key.as_str(),
                };
                Some((arch.to_string(), descriptor.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum(byte: u8) -> String {
        hex::encode([byte; 32])
    }

    fn sample_v1() -> Summary {
        let mut summary = Summary::default();
        let mut app = SummaryRef::new(&checksum(1), 512, 1_700_000_000);
        app.metadata.insert(
            KEY_DATA.into(),
            CacheData {
                installed_size: 4096,
                download_size: 1024,
                metadata: "[Application]\nname=org.test.App\n".into(),
            }
            .to_variant(),
        );
        SparseData {
            eol: Some("unmaintained".into()),
            ..SparseData::default()
        }
        .write_into(&mut app.metadata);
        summary
            .refs
            .insert("app/org.test.App/x86_64/stable".into(), app);
        summary
            .metadata
            .insert(KEY_SUMMARY_VERSION.into(), Variant::Uint32(1));
        summary
            .metadata
            .insert(KEY_COLLECTION_ID.into(), Variant::string("org.test.Repo"));
        summary
    }

    #[test]
    fn version_one_cache_lives_in_ref_metadata() -> Result<(), DeployError> {
        let summary = Summary::from_bytes(&sample_v1().to_bytes())?;
        let entry = summary
            .lookup(Some("org.test.Repo"), "app/org.test.App/x86_64/stable")
            .unwrap();
        assert_eq!(entry.checksum, checksum(1));
        assert_eq!(entry.commit_size, 512);
        assert_eq!(entry.timestamp(), 1_700_000_000);
        let cache = summary
            .lookup_cache(None, "app/org.test.App/x86_64/stable")?
            .unwrap();
        assert_eq!(cache.installed_size, 4096);
        let sparse = summary
            .lookup_sparse_cache(None, "app/org.test.App/x86_64/stable")?
            .unwrap();
        assert_eq!(sparse.eol.as_deref(), Some("unmaintained"));
        assert!(summary.lookup(Some("org.other"), "app/org.test.App/x86_64/stable").is_none());
        Ok(())
    }

    #[test]
    fn version_zero_cache_is_double_wrapped() -> Result<(), DeployError> {
        let mut summary = Summary::default();
        summary.refs.insert(
            "runtime/org.test.Platform/x86_64/1.0".into(),
            SummaryRef::new(&checksum(2), 100, 5),
        );
        let cache = Variant::string_dict(
            VariantType::parse("(tts)").unwrap(),
            vec![(
                "runtime/org.test.Platform/x86_64/1.0".into(),
                CacheData {
                    installed_size: 7,
                    download_size: 3,
                    metadata: "[Runtime]\n".into(),
                }
                .to_variant(),
            )],
        );
        summary
            .metadata
            .insert(KEY_CACHE.into(), Variant::boxed(cache));
        let mut sparse = VarDict::new();
        sparse.insert(SPARSE_EOL_REBASE.into(), Variant::string("runtime/org.test.New/x86_64/1.0"));
        summary.metadata.insert(
            KEY_SPARSE_CACHE.into(),
            Variant::string_dict(
                vardict_type(),
                vec![("runtime/org.test.Platform/x86_64/1.0".into(), Variant::vardict(&sparse))],
            ),
        );

        let decoded = Summary::from_bytes(&summary.to_bytes())?;
        let data = decoded
            .lookup_cache(None, "runtime/org.test.Platform/x86_64/1.0")?
            .unwrap();
        assert_eq!((data.installed_size, data.download_size), (7, 3));
        let sparse = decoded
            .lookup_sparse_cache(None, "runtime/org.test.Platform/x86_64/1.0")?
            .unwrap();
        assert_eq!(
            sparse.eol_rebase.as_deref(),
            Some("runtime/org.test.New/x86_64/1.0")
        );
        assert_eq!(decoded.lookup_cache(None, "app/missing/x86_64/stable")?, None);
        Ok(())
    }

    #[test]
    fn newer_summary_versions_are_rejected() {
        let mut summary = sample_v1();
        summary
            .metadata
            .insert(KEY_SUMMARY_VERSION.into(), Variant::Uint32(2));
        let err = summary
            .lookup_cache(None, "app/org.test.App/x86_64/stable")
            .unwrap_err();
        assert_eq!(err.kind(), refdeploy_domain::ErrorKind::InvalidData);
    }

    #[test]
    fn collection_map_is_carried() -> Result<(), DeployError> {
        let mut summary = sample_v1();
        let mut other = RefMap::new();
        other.insert(
            "app/org.other.App/x86_64/stable".into(),
            SummaryRef::new(&checksum(9), 1, 2),
        );
        summary.collection_map.insert("org.other.Repo".into(), other);
        let decoded = Summary::from_bytes(&summary.to_bytes())?;
        assert!(decoded
            .lookup(Some("org.other.Repo"), "app/org.other.App/x86_64/stable")
            .is_some());
        assert!(!decoded.metadata.contains_key(KEY_COLLECTION_MAP));
        Ok(())
    }

    #[test]
    fn index_filters_by_subset() -> Result<(), DeployError> {
        let mut index = SummaryIndex::default();
        for (key, byte) in [("x86_64", 1u8), ("aarch64", 2), ("floss-x86_64", 3)] {
            index.subsummaries.insert(
                key.into(),
                SubsummaryDescriptor {
                    checksum: checksum(byte),
                    history: vec![checksum(byte + 10)],
                    metadata: VarDict::new(),
                },
            );
        }
        let decoded = SummaryIndex::from_bytes(&index.to_bytes())?;
        assert_eq!(decoded, index);
        let plain = decoded.arch_map(None);
        assert_eq!(plain.keys().collect::<Vec<_>>(), vec!["aarch64", "x86_64"]);
        let floss = decoded.arch_map(Some("floss"));
        assert_eq!(floss.keys().collect::<Vec<_>>(), vec!["x86_64"]);
        assert_eq!(floss["x86_64"].history, vec![checksum(13)]);
        Ok(())
    }
}
