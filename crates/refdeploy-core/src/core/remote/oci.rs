//! OCI registry remotes (`oci+https://...`).
//!
//! The listing comes from the registry's static JSON index and is turned into
//! an ordinary summary keyed by manifest digest. Pulls download the image's
//! layers and commit the unpacked tree, recording the manifest digest as
//! `xa.alt-id`.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use flate2::read::GzDecoder;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol, ImageLayer};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use refdeploy_domain::{DeployError, Variant};
use refdeploy_store::commit::{
    META_REF_BINDING, META_XA_ALT_ID, META_XA_DOWNLOAD_SIZE, META_XA_INSTALLED_SIZE,
    META_XA_METADATA,
};
use refdeploy_store::{
    join_uri, root_dirmeta_checksum, Cancellable, Commit, ContentStore, Fetcher,
};
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::runtime::Builder;
use tracing::{debug, info};
use url::Url;

use crate::core::summary::format::{
    CacheData, SparseData, KEY_CACHE_VERSION, KEY_DATA, KEY_DEFAULT_TOKEN_TYPE,
    KEY_SUMMARY_VERSION,
};
use crate::core::summary::{Summary, SummaryRef};

pub const LABEL_REF: &str = "org.flatpak.ref";
pub const LABEL_METADATA: &str = "org.flatpak.metadata";
pub const LABEL_INSTALLED_SIZE: &str = "org.flatpak.installed-size";
pub const LABEL_DOWNLOAD_SIZE: &str = "org.flatpak.download-size";
pub const LABEL_CREATED: &str = "org.opencontainers.image.created";
pub const LABEL_COMMIT_METADATA_PREFIX: &str = "org.flatpak.commit-metadata.";

/// Summary metadata naming the registry the listing points at.
pub const KEY_OCI_REGISTRY: &str = "xa.oci-registry-uri";
/// Per-ref summary metadata naming the image repository.
pub const KEY_OCI_REPOSITORY: &str = "xa.oci-repository";

/// Bearer tokens; OCI registries always use them.
pub const OCI_TOKEN_TYPE: i32 = 1;

const LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RegistryIndex {
    #[serde(default)]
    registry: Option<String>,
    #[serde(default)]
    results: Vec<RegistryRepository>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RegistryRepository {
    name: String,
    #[serde(default)]
    images: Vec<RegistryImage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RegistryImage {
    digest: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[must_use]
pub fn index_uri(base_url: &str, arch: &str) -> String {
    join_uri(
        base_url,
        &format!("index/static?label:{LABEL_REF}:exists=1&architecture={arch}&os=linux"),
    )
}

fn parse_created(value: &str) -> u64 {
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .and_then(|created| u64::try_from(created.unix_timestamp()).ok())
        .unwrap_or(0)
}

fn commit_metadata_label(value: &str) -> Option<Variant> {
    let raw = BASE64_STANDARD.decode(value.trim()).ok()?;
    Variant::parse("v", &raw).ok().map(|value| value.unboxed().clone())
}

fn summary_entry(repository: &str, image: &RegistryImage) -> Option<(String, SummaryRef)> {
    let reference = image.labels.get(LABEL_REF)?;
    let checksum = image.digest.strip_prefix("sha256:")?;
    if !refdeploy_domain::is_valid_checksum(checksum) {
        return None;
    }
    let timestamp = image.labels.get(LABEL_CREATED).map_or(0, |value| parse_created(value));
    let size = |label: &str| image.labels.get(label).and_then(|value| value.parse::<u64>().ok());
    let mut entry = SummaryRef::new(checksum, 0, timestamp);
    let installed_size = size(LABEL_INSTALLED_SIZE).unwrap_or(0);
    entry.metadata.insert(
        KEY_DATA.to_string(),
        CacheData {
            installed_size,
            download_size: size(LABEL_DOWNLOAD_SIZE).unwrap_or(installed_size),
            metadata: image.labels.get(LABEL_METADATA).cloned().unwrap_or_default(),
        }
        .to_variant(),
    );
    entry
        .metadata
        .insert(KEY_OCI_REPOSITORY.to_string(), Variant::string(repository));

    let mut sparse = SparseData {
        token_type: Some(OCI_TOKEN_TYPE),
        ..SparseData::default()
    };
    for (label, value) in &image.labels {
        let Some(key) = label.strip_prefix(LABEL_COMMIT_METADATA_PREFIX) else {
            continue;
        };
        let Some(value) = commit_metadata_label(value) else {
            debug!(%label, "ignoring undecodable commit metadata label");
            continue;
        };
        match key {
            "ostree.endoflife" => sparse.eol = value.as_str().map(ToOwned::to_owned),
            "ostree.endoflife-rebase" => sparse.eol_rebase = value.as_str().map(ToOwned::to_owned),
            "xa.token-type" => sparse.token_type = value.as_i32(),
            _ => {}
        }
    }
    sparse.write_into(&mut entry.metadata);
    Some((reference.clone(), entry))
}

/// Convert a registry index document into a summary.
pub fn summary_from_index(json: &[u8], base_url: &str) -> Result<Summary> {
    let index: RegistryIndex = serde_json::from_slice(json)
        .map_err(|err| DeployError::invalid_data(format!("invalid OCI registry index: {err}")))?;
    let registry = match index.registry.as_deref() {
        Some(registry) => Url::parse(base_url)
            .and_then(|base| base.join(registry))
            .map_or_else(|_| registry.to_string(), String::from),
        None => base_url.to_string(),
    };
    let mut summary = Summary::default();
    summary
        .metadata
        .insert(KEY_SUMMARY_VERSION.to_string(), Variant::Uint32(1));
    summary
        .metadata
        .insert(KEY_CACHE_VERSION.to_string(), Variant::Uint32(1));
    summary
        .metadata
        .insert(KEY_DEFAULT_TOKEN_TYPE.to_string(), Variant::Int32(OCI_TOKEN_TYPE));
    summary
        .metadata
        .insert(KEY_OCI_REGISTRY.to_string(), Variant::string(registry));
    for repository in &index.results {
        for image in &repository.images {
            if let Some((reference, entry)) = summary_entry(&repository.name, image) {
                summary.refs.insert(reference, entry);
            }
        }
    }
    Ok(summary)
}

/// Fetch the registry listing for `arch`.
pub fn fetch_oci_summary(
    fetcher: &Fetcher,
    base_url: &str,
    arch: &str,
    cancellable: &Cancellable,
) -> Result<Summary> {
    let uri = index_uri(base_url, arch);
    let json = fetcher
        .fetch(&uri, cancellable)
        .with_context(|| format!("failed to fetch OCI registry index {uri}"))?;
    summary_from_index(&json, base_url)
}

fn image_reference(registry: &str, repository: &str, digest: &str) -> Result<(Reference, ClientProtocol)> {
    let url = Url::parse(registry).with_context(|| format!("invalid registry uri {registry}"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("registry uri {registry} has no host"))?;
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let protocol = if url.scheme() == "http" {
        ClientProtocol::Http
    } else {
        ClientProtocol::Https
    };
    Ok((
        Reference::with_digest(host, repository.to_string(), digest.to_string()),
        protocol,
    ))
}

fn unpack_layer(layer: &ImageLayer, dest: &Path) -> Result<()> {
    let reader: Box<dyn Read + '_> = if layer.media_type == LAYER_TAR {
        Box::new(layer.data.as_slice())
    } else {
        Box::new(GzDecoder::new(layer.data.as_slice()))
    };
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .with_context(|| format!("failed to unpack image layer into {}", dest.display()))
}

/// Everything needed to import one image.
#[derive(Clone, Debug)]
pub struct OciImage<'a> {
    pub remote: &'a str,
    pub reference: &'a str,
    pub registry: &'a str,
    pub repository: &'a str,
    pub entry: &'a SummaryRef,
    pub cache: Option<&'a CacheData>,
}

impl OciImage<'_> {
    #[must_use]
    pub fn digest(&self) -> String {
        format!("sha256:{}", self.entry.checksum)
    }
}

/// The commit already imported for this image, if the locally recorded
/// `remote:ref` carries the same `xa.alt-id`.
pub fn existing_import(repo: &dyn ContentStore, image: &OciImage<'_>) -> Result<Option<String>> {
    let refspec = format!("{}:{}", image.remote, image.reference);
    let Some(latest) = repo.resolve_rev(&refspec, true).map_err(DeployError::from)? else {
        return Ok(None);
    };
    let Ok((commit, _)) = repo.load_commit(&latest) else {
        return Ok(None);
    };
    Ok((commit.meta_str(META_XA_ALT_ID) == Some(image.digest().as_str())).then_some(latest))
}

/// Download and commit the image. Must run inside a store transaction; the
/// caller queues the ref update.
pub fn import_image(
    repo: &dyn ContentStore,
    image: &OciImage<'_>,
    cancellable: &Cancellable,
) -> Result<String> {
    if let Some(existing) = existing_import(repo, image)? {
        debug!(reference = %image.reference, commit = %existing, "image already imported");
        return Ok(existing);
    }
    let digest = image.digest();
    let (reference, protocol) = image_reference(image.registry, image.repository, &digest)?;
    let mut client = Client::new(ClientConfig {
        protocol,
        ..ClientConfig::default()
    });
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to initialize registry client")?;
    let data = runtime
        .block_on(async {
            client
                .pull(
                    &reference,
                    &RegistryAuth::Anonymous,
                    vec![LAYER_GZIP, LAYER_TAR, DOCKER_LAYER_GZIP],
                )
                .await
        })
        .with_context(|| format!("failed to pull {reference}"))?;
    cancellable.check().map_err(DeployError::from)?;

    let staging = tempfile::tempdir_in(repo.path().join("tmp"))
        .context("failed to create image staging directory")?;
    for layer in &data.layers {
        unpack_layer(layer, staging.path())?;
    }
    let tree = repo
        .write_dir(staging.path(), cancellable)
        .map_err(DeployError::from)?;
    let mut commit = Commit::new(&tree, &root_dirmeta_checksum(), image.entry.timestamp());
    commit.subject = format!("import of {digest}");
    commit
        .metadata
        .insert(META_XA_ALT_ID.to_string(), Variant::string(&digest));
    commit
        .metadata
        .insert(META_REF_BINDING.to_string(), Variant::strv([image.reference]));
    if let Some(cache) = image.cache {
        commit
            .metadata
            .insert(META_XA_METADATA.to_string(), Variant::string(&cache.metadata));
        commit.set_meta_u64_be(META_XA_INSTALLED_SIZE, cache.installed_size);
        commit.set_meta_u64_be(META_XA_DOWNLOAD_SIZE, cache.download_size);
    }
    let checksum = repo.write_commit(&commit).map_err(DeployError::from)?;
    info!(reference = %image.reference, %digest, commit = %checksum, "imported OCI image");
    Ok(checksum)
}

/// A commit-like view of a listing entry, for callers that only need metadata.
#[must_use]
pub fn synthetic_commit(reference: &str, entry: &SummaryRef, cache: Option<&CacheData>) -> Commit {
    let mut commit = Commit::new("", "", entry.timestamp());
    commit.metadata.insert(
        META_XA_ALT_ID.to_string(),
        Variant::string(format!("sha256:{}", entry.checksum)),
    );
    commit
        .metadata
        .insert(META_REF_BINDING.to_string(), Variant::strv([reference]));
    if let Some(cache) = cache {
        commit
            .metadata
            .insert(META_XA_METADATA.to_string(), Variant::string(&cache.metadata));
        commit.set_meta_u64_be(META_XA_INSTALLED_SIZE, cache.installed_size);
        commit.set_meta_u64_be(META_XA_DOWNLOAD_SIZE, cache.download_size);
    }
    commit
}
