//! Generating `summary`, `summary.idx` and per-arch subsummaries for a repo.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use refdeploy_domain::{VarDict, Variant, VariantType};
use refdeploy_store::commit::{
    META_ENDOFLIFE, META_ENDOFLIFE_REBASE, META_XA_DOWNLOAD_SIZE, META_XA_INSTALLED_SIZE,
    META_XA_METADATA, META_XA_TOKEN_TYPE,
};
use refdeploy_store::{
    encode_signatures, sha256_hex, ContentStore, Ed25519Signer, ObjectType,
};
use tracing::{debug, info};

use super::delta::{create_delta, gzip};
use super::format::{
    be_u64, vardict_type, CacheData, SparseData, SubsummaryDescriptor, Summary, SummaryIndex,
    SummaryRef, KEY_CACHE, KEY_CACHE_VERSION, KEY_COLLECTION_ID, KEY_DATA, KEY_DEFAULT_TOKEN_TYPE,
    KEY_LAST_MODIFIED, KEY_SPARSE_CACHE, KEY_SUMMARY_VERSION,
};
use crate::core::config::reverse_compat_arch;
use crate::core::fs::{remove_file_if_exists, write_file_atomic};
use crate::core::pull::extra_data::extra_data_sources;

/// Commit metadata listing the subsets a ref belongs to.
pub const META_XA_SUBSETS: &str = "xa.subsets";

const DEFAULT_HISTORY_LENGTH: usize = 16;
const LISTED_PREFIXES: [&str; 3] = ["app/", "runtime/", "appstream2/"];

#[derive(Clone, Debug)]
pub struct SummaryOptions<'a> {
    /// 0 writes the `xa.cache` layout into the full summary, 1 per-ref `xa.data`.
    pub summary_version: u32,
    /// Previous subsummaries to keep deltas against.
    pub history_length: usize,
    pub default_token_type: Option<i32>,
    pub signer: Option<&'a Ed25519Signer>,
    /// Defaults to `[core] collection-id` of the repo.
    pub collection_id: Option<String>,
    /// `ostree.summary.last-modified`; the current time when unset.
    pub timestamp: Option<u64>,
}

impl Default for SummaryOptions<'_> {
    fn default() -> Self {
        Self {
            summary_version: 1,
            history_length: DEFAULT_HISTORY_LENGTH,
            default_token_type: None,
            signer: None,
            collection_id: None,
            timestamp: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SummaryReport {
    pub refs: usize,
    /// `[<subset>-]<arch>` key and checksum of every subsummary written.
    pub subsummaries: BTreeMap<String, String>,
    pub deltas: usize,
    pub removed: usize,
}

struct RefInfo {
    entry: SummaryRef,
    cache: CacheData,
    sparse: SparseData,
    subsets: Vec<String>,
}

fn ref_arch(name: &str) -> Option<&str> {
    let parts: Vec<&str> = name.split('/').collect();
    match parts.as_slice() {
        ["appstream2", arch] | [_, _, arch, _] => Some(*arch),
        _ => None,
    }
}

fn collect_refs(repo: &dyn ContentStore) -> Result<BTreeMap<String, RefInfo>> {
    let mut refs = BTreeMap::new();
    for (name, checksum) in repo.list_refs(None).context("failed to list repo refs")? {
        if !LISTED_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
            continue;
        }
        let commit_bytes = repo
            .read_object(ObjectType::Commit, &checksum)
            .with_context(|| format!("failed to read commit {checksum} for {name}"))?;
        let (commit, _) = repo.load_commit(&checksum)?;
        let installed_size = match commit.meta_u64_be(META_XA_INSTALLED_SIZE) {
            Some(size) => size,
            None => repo.commit_content_size(&checksum)?,
        };
        let cache = CacheData {
            installed_size,
            download_size: commit
                .meta_u64_be(META_XA_DOWNLOAD_SIZE)
                .unwrap_or(installed_size),
            metadata: commit.meta_str(META_XA_METADATA).unwrap_or_default().to_string(),
        };
        let sources = extra_data_sources(&commit)?;
        let sparse = SparseData {
            eol: commit.meta_str(META_ENDOFLIFE).map(ToOwned::to_owned),
            eol_rebase: commit.meta_str(META_ENDOFLIFE_REBASE).map(ToOwned::to_owned),
            token_type: commit
                .metadata
                .get(META_XA_TOKEN_TYPE)
                .and_then(Variant::as_i32),
            extra_data: (!sources.is_empty()).then(|| {
                (
                    u32::try_from(sources.len()).unwrap_or(u32::MAX),
                    sources.iter().map(|source| source.download_size).sum(),
                )
            }),
        };
        let subsets = commit
            .metadata
            .get(META_XA_SUBSETS)
            .and_then(Variant::as_strv)
            .unwrap_or_default();
        refs.insert(
            name,
            RefInfo {
                entry: SummaryRef::new(&checksum, commit_bytes.len() as u64, commit.timestamp),
                cache,
                sparse,
                subsets,
            },
        );
    }
    Ok(refs)
}

fn base_metadata(options: &SummaryOptions<'_>, collection_id: Option<&str>, timestamp: u64) -> VarDict {
    let mut metadata = VarDict::new();
    if let Some(id) = collection_id {
        metadata.insert(KEY_COLLECTION_ID.to_string(), Variant::string(id));
    }
    metadata.insert(KEY_LAST_MODIFIED.to_string(), be_u64(timestamp));
    metadata.insert(KEY_CACHE_VERSION.to_string(), Variant::Uint32(1));
    if let Some(token_type) = options.default_token_type {
        metadata.insert(KEY_DEFAULT_TOKEN_TYPE.to_string(), Variant::Int32(token_type));
    }
    metadata
}

/// A summary in the per-ref (version 1) layout over `names`.
fn build_v1<'a>(
    refs: &BTreeMap<String, RefInfo>,
    names: impl Iterator<Item = &'a String>,
    metadata: VarDict,
) -> Summary {
    let mut summary = Summary {
        metadata,
        ..Summary::default()
    };
    summary
        .metadata
        .insert(KEY_SUMMARY_VERSION.to_string(), Variant::Uint32(1));
    for name in names {
        let Some(info) = refs.get(name) else {
            continue;
        };
        let mut entry = info.entry.clone();
        entry
            .metadata
            .insert(KEY_DATA.to_string(), info.cache.to_variant());
        info.sparse.write_into(&mut entry.metadata);
        summary.refs.insert(name.clone(), entry);
    }
    summary
}

fn build_v0(refs: &BTreeMap<String, RefInfo>, metadata: VarDict) -> Summary {
    let mut summary = Summary {
        metadata,
        ..Summary::default()
    };
    let mut cache = Vec::new();
    let mut sparse = Vec::new();
    for (name, info) in refs {
        summary.refs.insert(name.clone(), info.entry.clone());
        cache.push((name.clone(), info.cache.to_variant()));
        if !info.sparse.is_empty() {
            let mut dict = VarDict::new();
            info.sparse.write_into(&mut dict);
            sparse.push((name.clone(), Variant::vardict(&dict)));
        }
    }
    let cache_entry = VariantType::Tuple(vec![
        VariantType::Uint64,
        VariantType::Uint64,
        VariantType::String,
    ]);
    summary.metadata.insert(
        KEY_CACHE.to_string(),
        Variant::boxed(Variant::string_dict(cache_entry, cache)),
    );
    if !sparse.is_empty() {
        summary.metadata.insert(
            KEY_SPARSE_CACHE.to_string(),
            Variant::string_dict(vardict_type(), sparse),
        );
    }
    summary
}

/// Group ref names by `[<subset>-]<arch>`. Refs of a compat arch are listed
/// under the 64-bit arch too.
fn subsummary_members(refs: &BTreeMap<String, RefInfo>) -> BTreeMap<String, BTreeSet<String>> {
    let mut members: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, info) in refs {
        let Some(arch) = ref_arch(name) else {
            continue;
        };
        let mut arches = vec![arch];
        if let Some(primary) = reverse_compat_arch(arch) {
            arches.push(primary);
        }
        for arch in arches {
            members
                .entry(arch.to_string())
                .or_default()
                .insert(name.clone());
            for subset in &info.subsets {
                members
                    .entry(format!("{subset}-{arch}"))
                    .or_default()
                    .insert(name.clone());
            }
        }
    }
    members
}

fn write_signature(signer: Option<&Ed25519Signer>, path: &Path, data: &[u8]) -> Result<()> {
    match signer {
        Some(signer) => write_file_atomic(path, &encode_signatures(&signer.sign(data))),
        None => remove_file_if_exists(path),
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Regenerate the summary files of the repo at `repo.path()`.
pub fn update_summary(repo: &dyn ContentStore, options: &SummaryOptions<'_>) -> Result<SummaryReport> {
    let root = repo.path().to_path_buf();
    let summaries_dir = root.join("summaries");
    fs::create_dir_all(&summaries_dir)
        .with_context(|| format!("failed to create {}", summaries_dir.display()))?;

    let collection_id = options
        .collection_id
        .clone()
        .or_else(|| repo.config().get_string("core", "collection-id"))
        .filter(|id| !id.is_empty());
    let timestamp = options.timestamp.unwrap_or_else(now);
    let refs = collect_refs(repo)?;
    let metadata = base_metadata(options, collection_id.as_deref(), timestamp);

    let full = match options.summary_version {
        0 => build_v0(&refs, metadata.clone()),
        _ => build_v1(&refs, refs.keys(), metadata.clone()),
    };
    let full_bytes = full.to_bytes();

    let previous = fs::read(root.join("summary.idx"))
        .ok()
        .and_then(|data| SummaryIndex::from_bytes(&data).ok())
        .unwrap_or_default();

    let mut report = SummaryReport {
        refs: refs.len(),
        ..SummaryReport::default()
    };
    let mut index = SummaryIndex::default();
    for (key, names) in subsummary_members(&refs) {
        let bytes = build_v1(&refs, names.iter(), metadata.clone()).to_bytes();
        let checksum = sha256_hex(&bytes);
        let gz_path = summaries_dir.join(format!("{checksum}.gz"));
        if !gz_path.exists() {
            write_file_atomic(&gz_path, &gzip(&bytes)?)?;
        }

        let mut history = Vec::new();
        if let Some(old) = previous.subsummaries.get(&key) {
            if old.checksum == checksum {
                history.clone_from(&old.history);
            } else {
                history.push(old.checksum.clone());
                history.extend(old.history.iter().cloned());
            }
        }
        history.truncate(options.history_length);

        for old in &history {
            let delta_path = summaries_dir.join(format!("{old}-{checksum}.delta"));
            if delta_path.exists() {
                continue;
            }
            let Ok(compressed) = fs::read(summaries_dir.join(format!("{old}.gz"))) else {
                continue;
            };
            let old_bytes = super::delta::decompress(&compressed)
                .with_context(|| format!("failed to read old subsummary {old}"))?;
            write_file_atomic(&delta_path, &create_delta(&old_bytes, &bytes)?)?;
            report.deltas += 1;
        }

        debug!(%key, %checksum, refs = names.len(), "wrote subsummary");
        report.subsummaries.insert(key.clone(), checksum.clone());
        index.subsummaries.insert(
            key,
            SubsummaryDescriptor {
                checksum,
                history,
                metadata: VarDict::new(),
            },
        );
    }

    let index_bytes = index.to_bytes();
    let index_digest = sha256_hex(&index_bytes);

    write_file_atomic(&root.join("summary"), &full_bytes)?;
    write_signature(options.signer, &root.join("summary.sig"), &full_bytes)?;
    write_file_atomic(&root.join("summary.idx"), &index_bytes)?;
    write_signature(options.signer, &root.join("summary.idx.sig"), &index_bytes)?;
    write_signature(
        options.signer,
        &summaries_dir.join(format!("{index_digest}.idx.sig")),
        &index_bytes,
    )?;

    report.removed = prune_summaries_dir(&summaries_dir, &index, &index_digest)?;
    info!(
        refs = report.refs,
        subsummaries = report.subsummaries.len(),
        deltas = report.deltas,
        "updated summary"
    );
    Ok(report)
}

/// Drop subsummaries, deltas and index signatures the new index no longer refers to.
fn prune_summaries_dir(dir: &Path, index: &SummaryIndex, index_digest: &str) -> Result<usize> {
    let mut live: BTreeSet<&str> = BTreeSet::new();
    let mut current: BTreeSet<&str> = BTreeSet::new();
    for descriptor in index.subsummaries.values() {
        live.insert(&descriptor.checksum);
        current.insert(&descriptor.checksum);
        live.extend(descriptor.history.iter().map(String::as_str));
    }
    let mut removed = 0;
    let entries = fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let keep = if let Some(checksum) = name.strip_suffix(".gz") {
            live.contains(checksum)
        } else if let Some(pair) = name.strip_suffix(".delta") {
            pair.split_once('-')
                .is_some_and(|(old, new)| live.contains(old) && current.contains(new))
        } else if let Some(digest) = name.strip_suffix(".idx.sig") {
            digest == index_digest
        } else {
            true
        };
        if !keep {
            remove_file_if_exists(&entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use refdeploy_store::commit::META_REF_BINDING;
    use refdeploy_store::{decode_signatures, root_dirmeta_checksum, Cancellable, Commit, FsRepo, SignatureVerifier};

    fn commit_ref(repo: &FsRepo, name: &str, timestamp: u64, content: &str) -> Result<String> {
        let src = tempfile::tempdir()?;
        fs::create_dir_all(src.path().join("files"))?;
        fs::write(src.path().join("files/data"), content)?;
        fs::write(src.path().join("metadata"), "[Application]\nname=org.test.App\n")?;
        let tree = repo.write_dir(src.path(), &Cancellable::new())?;
        let mut commit = Commit::new(&tree, &root_dirmeta_checksum(), timestamp);
        commit
            .metadata
            .insert(META_REF_BINDING.into(), Variant::strv([name]));
        commit
            .metadata
            .insert(META_XA_METADATA.into(), Variant::string("[Application]\nname=org.test.App\n"));
        let checksum = repo.write_commit(&commit)?;
        repo.set_ref_immediate(None, name, Some(&checksum))?;
        Ok(checksum)
    }

    #[test]
    fn writes_signed_summary_and_index() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = FsRepo::open(dir.path(), true)?;
        let app = commit_ref(&repo, "app/org.test.App/x86_64/stable", 10, "a")?;
        commit_ref(&repo, "runtime/org.test.Platform/i386/1.0", 11, "b")?;
        commit_ref(&repo, "runtime/org.test.Platform/aarch64/1.0", 12, "c")?;
        let signer = Ed25519Signer::from_seed(&[5; 32]);
        let report = update_summary(
            &repo,
            &SummaryOptions {
                signer: Some(&signer),
                collection_id: Some("org.test.Repo".into()),
                default_token_type: Some(0),
                ..SummaryOptions::default()
            },
        )?;
        assert_eq!(report.refs, 3);
        assert_eq!(
            report.subsummaries.keys().collect::<Vec<_>>(),
            vec!["aarch64", "i386", "x86_64"]
        );

        let summary_bytes = fs::read(dir.path().join("summary"))?;
        let summary = Summary::from_bytes(&summary_bytes)?;
        assert_eq!(summary.collection_id(), Some("org.test.Repo"));
        assert_eq!(summary.lookup(None, "app/org.test.App/x86_64/stable").unwrap().checksum, app);
        let sig = decode_signatures(&fs::read(dir.path().join("summary.sig"))?)?;
        signer.verifier().verify(&summary_bytes, &sig)?;

        let index = SummaryIndex::from_bytes(&fs::read(dir.path().join("summary.idx"))?)?;
        let x86 = &index.subsummaries["x86_64"];
        let compressed = fs::read(dir.path().join(format!("summaries/{}.gz", x86.checksum)))?;
        let sub = Summary::from_bytes(&super::super::delta::decompress(&compressed)?)?;
        assert!(sub.refs.contains_key("runtime/org.test.Platform/i386/1.0"));
        assert!(!sub.refs.contains_key("runtime/org.test.Platform/aarch64/1.0"));
        assert_eq!(sub.default_token_type(), Some(0));
        Ok(())
    }

    #[test]
    fn regenerating_records_history_and_deltas() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = FsRepo::open(dir.path(), true)?;
        commit_ref(&repo, "app/org.test.App/x86_64/stable", 10, "v1")?;
        let first = update_summary(&repo, &SummaryOptions::default())?;
        commit_ref(&repo, "app/org.test.App/x86_64/stable", 20, "v2")?;
        let second = update_summary(&repo, &SummaryOptions::default())?;

        let old = &first.subsummaries["x86_64"];
        let new = &second.subsummaries["x86_64"];
        assert_ne!(old, new);
        assert_eq!(second.deltas, 1);
        let index = SummaryIndex::from_bytes(&fs::read(dir.path().join("summary.idx"))?)?;
        assert_eq!(&index.subsummaries["x86_64"].history, &vec![old.clone()]);
        assert!(dir.path().join(format!("summaries/{old}-{new}.delta")).exists());
        assert!(!dir.path().join("summary.sig").exists());
        Ok(())
    }

    #[test]
    fn version_zero_keeps_cache_in_summary_metadata() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = FsRepo::open(dir.path(), true)?;
        commit_ref(&repo, "app/org.test.App/x86_64/stable", 10, "content")?;
        update_summary(
            &repo,
            &SummaryOptions {
                summary_version: 0,
                ..SummaryOptions::default()
            },
        )?;
        let summary = Summary::from_bytes(&fs::read(dir.path().join("summary"))?)?;
        assert_eq!(summary.summary_version(), 0);
        let cache = summary
            .lookup_cache(None, "app/org.test.App/x86_64/stable")?
            .unwrap();
        assert!(cache.metadata.contains("org.test.App"));
        assert!(cache.installed_size > 0);
        Ok(())
    }
}
