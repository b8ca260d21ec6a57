//! Out-of-band "extra data" payloads referenced from commit metadata.
//!
//! A commit lists its sources in `xa.extra-data-sources` as `a(ayttays)`:
//! name, download size, installed size (both big-endian), sha256 and uri.
//! Downloaded payloads are attached to the commit's detached metadata as
//! `xa.extra-data` (`a(ayay)`: name and content).

use anyhow::{Context, Result};
use refdeploy_domain::{DeployError, VarDict, Variant, VariantType};
use refdeploy_store::commit::META_XA_EXTRA_DATA_SOURCES;
use refdeploy_store::{sha256_hex, Cancellable, Commit, ContentStore, Fetcher, ObjectType};
use tracing::{debug, info};
use url::Url;

use crate::core::fs::write_file_atomic;
use crate::core::summary::format::{be_u64, from_be_u64};

pub const META_XA_EXTRA_DATA: &str = "xa.extra-data";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtraDataSource {
    pub name: String,
    pub download_size: u64,
    pub installed_size: u64,
    pub sha256: String,
    pub uri: String,
}

/// How downloaded payloads reach the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachMode {
    /// Through the store's detached-metadata call.
    Detached,
    /// As a `.commitmeta` file written next to the commit object.
    Sideload,
}

fn source_type() -> VariantType {
    VariantType::Tuple(vec![
        VariantType::Array(Box::new(VariantType::Byte)),
        VariantType::Uint64,
        VariantType::Uint64,
        VariantType::Array(Box::new(VariantType::Byte)),
        VariantType::String,
    ])
}

fn name_bytes(name: &str) -> Vec<u8> {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

fn name_from(bytes: &[u8]) -> String {
    let trimmed = bytes.strip_suffix(&[0]).unwrap_or(bytes);
    String::from_utf8_lossy(trimmed).into_owned()
}

#[must_use]
pub fn encode_extra_data_sources(sources: &[ExtraDataSource]) -> Variant {
    Variant::Array(
        source_type(),
        sources
            .iter()
            .map(|source| {
                Variant::tuple(vec![
                    Variant::bytes(&name_bytes(&source.name)),
                    be_u64(source.download_size),
                    be_u64(source.installed_size),
                    Variant::bytes(&hex::decode(&source.sha256).unwrap_or_default()),
                    Variant::string(&source.uri),
                ])
            })
            .collect(),
    )
}

/// The sources a commit declares; empty when it has none.
pub fn extra_data_sources(commit: &Commit) -> Result<Vec<ExtraDataSource>> {
    let Some(value) = commit.metadata.get(META_XA_EXTRA_DATA_SOURCES) else {
        return Ok(Vec::new());
    };
    let malformed = || DeployError::invalid_data("malformed xa.extra-data-sources");
    let entries = value.as_array().ok_or_else(malformed)?;
    let mut sources = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = entry.child(0).and_then(Variant::as_bytes).ok_or_else(malformed)?;
        let sha256 = entry
            .child(3)
            .and_then(Variant::as_bytes)
            .filter(|bytes| bytes.len() == 32)
            .ok_or_else(malformed)?;
        sources.push(ExtraDataSource {
            name: name_from(&name),
            download_size: entry.child(1).and_then(from_be_u64).ok_or_else(malformed)?,
            installed_size: entry.child(2).and_then(from_be_u64).ok_or_else(malformed)?,
            sha256: hex::encode(sha256),
            uri: entry
                .child(4)
                .and_then(Variant::as_str)
                .ok_or_else(malformed)?
                .to_string(),
        });
    }
    Ok(sources)
}

/// Encode `(name, content)` pairs as the `xa.extra-data` value.
#[must_use]
pub fn encode_extra_data_payloads(payloads: &[(String, Vec<u8>)]) -> Variant {
    let payload_type = VariantType::Tuple(vec![
        VariantType::Array(Box::new(VariantType::Byte)),
        VariantType::Array(Box::new(VariantType::Byte)),
    ]);
    Variant::Array(
        payload_type,
        payloads
            .iter()
            .map(|(name, data)| {
                Variant::tuple(vec![Variant::bytes(&name_bytes(name)), Variant::bytes(data)])
            })
            .collect(),
    )
}

/// Decode `xa.extra-data` from detached metadata into `(name, content)` pairs.
pub fn extra_data_payloads(detached: &VarDict) -> Result<Vec<(String, Vec<u8>)>> {
    let Some(value) = detached.get(META_XA_EXTRA_DATA) else {
        return Ok(Vec::new());
    };
    let malformed = || DeployError::invalid_data("malformed xa.extra-data");
    value
        .as_array()
        .ok_or_else(malformed)?
        .iter()
        .map(|entry| {
            let name = entry.child(0).and_then(Variant::as_bytes).ok_or_else(malformed)?;
            let data = entry.child(1).and_then(Variant::as_bytes).ok_or_else(malformed)?;
            Ok((name_from(&name), data))
        })
        .collect()
}

fn check_uri(source: &ExtraDataSource) -> Result<()> {
    let url = Url::parse(&source.uri).map_err(|err| {
        DeployError::invalid_data(format!("invalid extra data uri '{}': {err}", source.uri))
    })?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        "file" => Err(DeployError::Untrusted(format!(
            "extra data '{}' points at a local file ({})",
            source.name, source.uri
        ))
        .into()),
        other => Err(DeployError::invalid_data(format!(
            "unsupported extra data uri scheme '{other}' for '{}'",
            source.name
        ))
        .into()),
    }
}

fn download(fetcher: &Fetcher, source: &ExtraDataSource, cancellable: &Cancellable) -> Result<Vec<u8>> {
    check_uri(source)?;
    let data = fetcher
        .fetch(&source.uri, cancellable)
        .with_context(|| format!("failed to download extra data '{}'", source.name))?;
    if data.len() as u64 != source.download_size {
        return Err(DeployError::invalid_data(format!(
            "wrong size for extra data '{}': expected {}, got {}",
            source.name,
            source.download_size,
            data.len()
        ))
        .into());
    }
    let actual = sha256_hex(&data);
    if actual != source.sha256 {
        return Err(DeployError::invalid_data(format!(
            "invalid checksum for extra data '{}': expected {}, got {actual}",
            source.name, source.sha256
        ))
        .into());
    }
    Ok(data)
}

/// Download every source listed by the pulled commit `checksum` and attach
/// the payloads to it. Returns how many payloads were attached.
pub fn pull_extra_data(
    repo: &dyn ContentStore,
    fetcher: &Fetcher,
    reference: &str,
    checksum: &str,
    mode: AttachMode,
    cancellable: &Cancellable,
) -> Result<usize> {
    let (commit, _) = repo
        .load_commit(checksum)
        .with_context(|| format!("failed to load commit {checksum}"))?;
    let sources = extra_data_sources(&commit)?;
    if sources.is_empty() {
        return Ok(0);
    }
    let mut detached = repo
        .read_commit_detached_metadata(checksum)
        .map_err(DeployError::from)?
        .unwrap_or_default();
    if detached.contains_key(META_XA_EXTRA_DATA) {
        debug!(%reference, %checksum, "extra data already attached");
        return Ok(0);
    }

    let mut payloads = Vec::with_capacity(sources.len());
    for source in &sources {
        cancellable.check().map_err(DeployError::from)?;
        debug!(%reference, name = %source.name, uri = %source.uri, "downloading extra data");
        payloads.push((source.name.clone(), download(fetcher, source, cancellable)?));
    }
    detached.insert(
        META_XA_EXTRA_DATA.to_string(),
        encode_extra_data_payloads(&payloads),
    );

    match mode {
        AttachMode::Detached => repo
            .write_commit_detached_metadata(checksum, Some(&detached))
            .map_err(DeployError::from)?,
        AttachMode::Sideload => {
            let path = repo.object_path(ObjectType::CommitMeta, checksum);
            write_file_atomic(&path, &Variant::vardict(&detached).to_bytes())?;
        }
    }
    info!(%reference, count = sources.len(), "attached extra data");
    Ok(sources.len())
}
