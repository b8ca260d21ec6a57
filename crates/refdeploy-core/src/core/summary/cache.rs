//! Memory and disk caches for summaries, indexes and subsummaries.
//!
//! Disk layout under the cache directory:
//!
//! * `<remote>` and `<remote>.sig`: legacy full summary
//! * `<remote>.idx` and `<remote>.idx.sig`: summary index
//! * `<remote>-<arch>-<checksum>.sub`: subsummary, checked against the
//!   signed index so it needs no signature of its own
//!
//! Remotes with `file:` URLs are never cached on disk.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use refdeploy_domain::DeployError;
use refdeploy_store::{
    decode_signatures, is_local_uri, join_uri, sha256_hex, Cancellable, Fetcher,
    SignatureVerifier,
};
use tracing::{debug, warn};

use super::delta::{apply_delta, decompress};
use super::format::SubsummaryDescriptor;
use crate::core::fs::{remove_file_if_exists, write_file_atomic};

/// How long a fetched summary is trusted without asking the server again.
pub const SUMMARY_MEMORY_TTL: Duration = Duration::from_secs(300);

/// Where a remote's summaries come from and how they are authenticated.
#[derive(Clone)]
pub struct SummarySource {
    pub remote: String,
    pub url: String,
    /// Set when `gpg-verify-summary` is on.
    pub verifier: Option<Arc<dyn SignatureVerifier>>,
}

impl SummarySource {
    #[must_use]
    pub fn is_local(&self) -> bool {
        is_local_uri(&self.url)
    }

    fn uri(&self, relative: &str) -> String {
        join_uri(&self.url, relative)
    }
}

impl std::fmt::Debug for SummarySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummarySource")
            .field("remote", &self.remote)
            .field("url", &self.url)
            .field("verified", &self.verifier.is_some())
            .finish()
    }
}

/// A summary or index blob with its detached signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummaryBlob {
    pub data: Vec<u8>,
    pub signature: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct CachedSummary {
    pub name: String,
    pub url: String,
    pub blob: SummaryBlob,
    fetched_at: Instant,
}

#[must_use]
pub fn index_cache_key(remote: &str) -> String {
    format!("index-{remote}")
}

#[must_use]
pub fn summary_cache_key(remote: &str) -> String {
    format!("summary-{remote}")
}

fn subsummary_cache_key(remote: &str, arch: &str, checksum: &str) -> String {
    format!("subsummary-{remote}-{arch}-{checksum}")
}

/// The arch of a `<remote>-<arch>-<checksum>` name owned by `remote`.
/// Arches never contain `-`, so `flathub` does not own `flathub-beta-...`.
fn subsummary_arch<'a>(name: Option<&'a str>, remote: &str) -> Option<&'a str> {
    let rest = name?.strip_prefix(remote)?.strip_prefix('-')?;
    let (arch, checksum) = rest.rsplit_once('-')?;
    (!arch.is_empty() && !arch.contains('-') && refdeploy_domain::is_valid_checksum(checksum)).then_some(arch)
}

#[derive(Debug)]
pub struct SummaryCache {
    dir: PathBuf,
    fetcher: Fetcher,
    ttl: Duration,
    memory: Mutex<HashMap<String, Arc<CachedSummary>>>,
}

impl SummaryCache {
    #[must_use]
    pub fn new(dir: PathBuf, fetcher: Fetcher) -> Self {
        Self {
            dir,
            fetcher,
            ttl: SUMMARY_MEMORY_TTL,
            memory: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// A memory entry for `key`, unless it expired or was fetched from another URL.
    #[must_use]
    pub fn memory_lookup(&self, key: &str, url: &str) -> Option<SummaryBlob> {
        let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = memory.get(key)?;
        if entry.url != url || entry.fetched_at.elapsed() > self.ttl {
            debug!(key, "dropping stale summary cache entry");
            memory.remove(key);
            return None;
        }
        Some(entry.blob.clone())
    }

    pub fn memory_insert(&self, key: &str, url: &str, blob: SummaryBlob) {
        let entry = Arc::new(CachedSummary {
            name: key.to_string(),
            url: url.to_string(),
            blob,
            fetched_at: Instant::now(),
        });
        self.memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), entry);
    }

    /// Forget everything cached for `remote`, in memory and on disk.
    pub fn remove_remote(&self, remote: &str) -> Result<()> {
        self.memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| {
                key != &index_cache_key(remote)
                    && key != &summary_cache_key(remote)
                    && subsummary_arch(key.strip_prefix("subsummary-"), remote).is_none()
            });
        for suffix in ["", ".sig", ".idx", ".idx.sig"] {
            remove_file_if_exists(&self.dir.join(format!("{remote}{suffix}")))?;
        }
        for path in self.cached_subsummaries(remote, None) {
            remove_file_if_exists(&path)?;
        }
        Ok(())
    }

    fn read_cached(&self, name: &str) -> Option<Vec<u8>> {
        fs::read(self.dir.join(name)).ok()
    }

    fn persist(&self, source: &SummarySource, name: &str, data: &[u8]) -> Result<()> {
        if source.is_local() {
            return Ok(());
        }
        write_file_atomic(&self.dir.join(name), data)
    }

    pub(crate) fn verify(
        source: &SummarySource,
        what: &str,
        data: &[u8],
        signature: Option<&[u8]>,
    ) -> Result<()> {
        let Some(verifier) = &source.verifier else {
            return Ok(());
        };
        let Some(signature) = signature else {
            return Err(DeployError::NoSignature(format!("{what} of remote '{}'", source.remote)).into());
        };
        let signatures = decode_signatures(signature).map_err(DeployError::from)?;
        verifier
            .verify(data, &signatures)
            .map_err(DeployError::from)
            .with_context(|| format!("{what} of remote '{}' failed verification", source.remote))?;
        Ok(())
    }

    /// The remote's summary index, or `None` when the remote publishes none.
    pub fn fetch_summary_index(
        &self,
        source: &SummarySource,
        only_cached: bool,
        cancellable: &Cancellable,
    ) -> Result<Option<SummaryBlob>> {
        let name = format!("{}.idx", source.remote);
        let sig_name = format!("{}.idx.sig", source.remote);
        let cached = self.read_cached(&name);
        let cached_sig = self.read_cached(&sig_name);

        if only_cached {
            let Some(data) = cached else {
                return Err(DeployError::NotCached(format!(
                    "summary index for remote '{}'",
                    source.remote
                ))
                .into());
            };
            return Ok(Some(SummaryBlob {
                data,
                signature: cached_sig,
            }));
        }

        let Some(data) = self
            .fetcher
            .fetch_optional(&source.uri("summary.idx"), cancellable)
            .with_context(|| format!("failed to fetch summary index for remote '{}'", source.remote))?
        else {
            return Ok(None);
        };

        if cached.as_deref() == Some(data.as_slice()) && (source.verifier.is_none() || cached_sig.is_some()) {
            debug!(remote = %source.remote, "summary index unchanged");
            let blob = SummaryBlob {
                data,
                signature: cached_sig,
            };
            self.memory_insert(&index_cache_key(&source.remote), &source.url, blob.clone());
            return Ok(Some(blob));
        }

        let digest = sha256_hex(&data);
        let mut signature = self
            .fetcher
            .fetch_optional(&source.uri(&format!("summaries/{digest}.idx.sig")), cancellable)?;
        if signature.is_none() {
            signature = self
                .fetcher
                .fetch_optional(&source.uri("summary.idx.sig"), cancellable)?;
        }
        Self::verify(source, "summary index", &data, signature.as_deref())?;

        self.persist(source, &name, &data)?;
        match &signature {
            Some(sig) => self.persist(source, &sig_name, sig)?,
            None => remove_file_if_exists(&self.dir.join(&sig_name))?,
        }
        let blob = SummaryBlob { data, signature };
        self.memory_insert(&index_cache_key(&source.remote), &source.url, blob.clone());
        Ok(Some(blob))
    }

    /// The remote's full summary, from the server unless `only_cached`.
    pub fn fetch_summary(
        &self,
        source: &SummarySource,
        only_cached: bool,
        cancellable: &Cancellable,
    ) -> Result<SummaryBlob> {
        let name = source.remote.clone();
        let sig_name = format!("{}.sig", source.remote);
        if only_cached {
            let data = self.read_cached(&name).ok_or_else(|| {
                DeployError::NotCached(format!("summary for remote '{}'", source.remote))
            })?;
            return Ok(SummaryBlob {
                data,
                signature: self.read_cached(&sig_name),
            });
        }

        let data = self
            .fetcher
            .fetch(&source.uri("summary"), cancellable)
            .with_context(|| format!("failed to fetch summary for remote '{}'", source.remote))?;
        let signature = self
            .fetcher
            .fetch_optional(&source.uri("summary.sig"), cancellable)?;
        Self::verify(source, "summary", &data, signature.as_deref())?;

        self.persist(source, &name, &data)?;
        match &signature {
            Some(sig) => self.persist(source, &sig_name, sig)?,
            None => remove_file_if_exists(&self.dir.join(&sig_name))?,
        }
        let blob = SummaryBlob { data, signature };
        self.memory_insert(&summary_cache_key(&source.remote), &source.url, blob.clone());
        Ok(blob)
    }

    fn subsummary_path(&self, remote: &str, arch: &str, checksum: &str) -> PathBuf {
        self.dir.join(format!("{remote}-{arch}-{checksum}.sub"))
    }

    /// The subsummary described by `descriptor`, rebuilt from a cached older
    /// version plus a delta when possible.
    pub fn fetch_indexed_summary(
        &self,
        source: &SummarySource,
        arch: &str,
        descriptor: &SubsummaryDescriptor,
        only_cached: bool,
        cancellable: &Cancellable,
    ) -> Result<Vec<u8>> {
        let checksum = descriptor.checksum.as_str();
        let key = subsummary_cache_key(&source.remote, arch, checksum);
        if let Some(blob) = self.memory_lookup(&key, &source.url) {
            return Ok(blob.data);
        }

        let path = self.subsummary_path(&source.remote, arch, checksum);
        if let Ok(data) = fs::read(&path) {
            if sha256_hex(&data) == checksum {
                debug!(remote = %source.remote, arch, checksum, "using cached subsummary");
                self.memory_insert(&key, &source.url, SummaryBlob { data: data.clone(), signature: None });
                return Ok(data);
            }
            warn!(path = %path.display(), "cached subsummary is corrupt, removing it");
            remove_file_if_exists(&path)?;
            return Err(DeployError::invalid_data(format!(
                "invalid checksum for indexed summary {checksum} of remote '{}'",
                source.remote
            ))
            .into());
        }

        if only_cached {
            return Err(DeployError::NotCached(format!(
                "{arch} subsummary for remote '{}'",
                source.remote
            ))
            .into());
        }

        let data = match self.rebuild_from_delta(source, arch, descriptor, cancellable) {
            Some(data) => data,
            None => {
                let compressed = self
                    .fetcher
                    .fetch(&source.uri(&format!("summaries/{checksum}.gz")), cancellable)
                    .with_context(|| {
                        format!("failed to fetch {arch} subsummary for remote '{}'", source.remote)
                    })?;
                let data = decompress(&compressed)
                    .map_err(|err| DeployError::invalid_data(format!("subsummary {checksum}: {err:#}")))?;
                let actual = sha256_hex(&data);
                if actual != checksum {
                    return Err(DeployError::invalid_data(format!(
                        "subsummary checksum mismatch: expected {checksum}, got {actual}"
                    ))
                    .into());
                }
                data
            }
        };

        if !source.is_local() {
            write_file_atomic(&path, &data)?;
            self.gc_cached_digested_summaries(&source.remote, arch, &path);
        }
        self.memory_insert(&key, &source.url, SummaryBlob { data: data.clone(), signature: None });
        Ok(data)
    }

    fn rebuild_from_delta(
        &self,
        source: &SummarySource,
        arch: &str,
        descriptor: &SubsummaryDescriptor,
        cancellable: &Cancellable,
    ) -> Option<Vec<u8>> {
        let checksum = descriptor.checksum.as_str();
        for old in &descriptor.history {
            let Ok(old_data) = fs::read(self.subsummary_path(&source.remote, arch, old)) else {
                continue;
            };
            if sha256_hex(&old_data) != *old {
                continue;
            }
            let uri = source.uri(&format!("summaries/{old}-{checksum}.delta"));
            let delta = match self.fetcher.fetch_optional(&uri, cancellable) {
                Ok(Some(delta)) => delta,
                Ok(None) => {
                    debug!(%uri, "no subsummary delta");
                    continue;
                }
                Err(err) => {
                    debug!(%uri, %err, "failed to fetch subsummary delta");
                    continue;
                }
            };
            match apply_delta(&old_data, &delta) {
                Ok(data) if sha256_hex(&data) == checksum => {
                    debug!(remote = %source.remote, arch, from = %old, to = %checksum, "applied subsummary delta");
                    return Some(data);
                }
                Ok(_) => debug!(%uri, "subsummary delta produced the wrong checksum"),
                Err(err) => debug!(%uri, %err, "failed to apply subsummary delta"),
            }
        }
        None
    }

    fn cached_subsummaries(&self, remote: &str, arch: Option<&str>) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    return false;
                };
                let Some(entry_arch) = subsummary_arch(name.strip_suffix(".sub"), remote) else {
                    return false;
                };
                arch.is_none_or(|arch| arch == entry_arch)
            })
            .collect()
    }

    /// Keep only the newest cached subsummary for `remote`/`arch`, plus `keep`.
    /// Returns how many files were removed.
    pub fn gc_cached_digested_summaries(&self, remote: &str, arch: &str, keep: &Path) -> usize {
        let candidates: Vec<(PathBuf, SystemTime)> = self
            .cached_subsummaries(remote, Some(arch))
            .into_iter()
            .map(|path| {
                let modified = fs::metadata(&path)
                    .and_then(|meta| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (path, modified)
            })
            .collect();
        let newest = candidates
            .iter()
            .max_by_key(|(_, modified)| *modified)
            .map(|(path, _)| path.clone());
        let mut removed = 0;
        for (path, _) in candidates {
            if path == keep || Some(&path) == newest.as_ref() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %path.display(), %err, "failed to remove old subsummary"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::summary::delta::{create_delta, gzip};
    use filetime::FileTime;
    use refdeploy_domain::VarDict;
    use refdeploy_store::{encode_signatures, Ed25519Signer};

    fn local_source(dir: &Path, verifier: Option<Arc<dyn SignatureVerifier>>) -> SummarySource {
        SummarySource {
            remote: "origin".into(),
            url: url::Url::from_directory_path(dir).unwrap().to_string(),
            verifier,
        }
    }

    fn descriptor(data: &[u8], history: Vec<String>) -> SubsummaryDescriptor {
        SubsummaryDescriptor {
            checksum: sha256_hex(data),
            history,
            metadata: VarDict::new(),
        }
    }

    #[test]
    fn memory_entries_expire_and_track_urls() {
        let cache = SummaryCache::new(PathBuf::from("/nonexistent"), Fetcher::new());
        let blob = SummaryBlob {
            data: b"summary".to_vec(),
            signature: None,
        };
        cache.memory_insert("summary-r", "https://a/", blob.clone());
        assert_eq!(cache.memory_lookup("summary-r", "https://a/"), Some(blob.clone()));
        assert_eq!(cache.memory_lookup("summary-r", "https://b/"), None);
        assert_eq!(cache.memory_lookup("summary-r", "https://a/"), None);

        let cache = cache.with_ttl(Duration::ZERO);
        cache.memory_insert("summary-r", "https://a/", blob);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.memory_lookup("summary-r", "https://a/"), None);
    }

    #[test]
    fn signed_index_requires_a_signature() -> Result<()> {
        let remote = tempfile::tempdir()?;
        let cache_dir = tempfile::tempdir()?;
        let signer = Ed25519Signer::from_seed(&[3; 32]);
        let index = b"index bytes".to_vec();
        fs::write(remote.path().join("summary.idx"), &index)?;
        let verifier: Arc<dyn SignatureVerifier> = Arc::new(signer.verifier());
        let source = local_source(remote.path(), Some(verifier));
        let cache = SummaryCache::new(cache_dir.path().to_path_buf(), Fetcher::new());

        let err = cache
            .fetch_summary_index(&source, false, &Cancellable::new())
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DeployError>().map(DeployError::kind),
            Some(refdeploy_domain::ErrorKind::NoSignature)
        );

        fs::create_dir_all(remote.path().join("summaries"))?;
        fs::write(
            remote
                .path()
                .join(format!("summaries/{}.idx.sig", sha256_hex(&index))),
            encode_signatures(&signer.sign(&index)),
        )?;
        let blob = cache
            .fetch_summary_index(&source, false, &Cancellable::new())?
            .unwrap();
        assert_eq!(blob.data, index);
        assert!(!cache_dir.path().join("origin.idx").exists(), "local remotes are not disk-cached");
        Ok(())
    }

    #[test]
    fn missing_index_is_not_an_error() -> Result<()> {
        let remote = tempfile::tempdir()?;
        let cache_dir = tempfile::tempdir()?;
        let cache = SummaryCache::new(cache_dir.path().to_path_buf(), Fetcher::new());
        let source = local_source(remote.path(), None);
        assert!(cache
            .fetch_summary_index(&source, false, &Cancellable::new())?
            .is_none());
        let err = cache
            .fetch_summary_index(&source, true, &Cancellable::new())
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DeployError>().map(DeployError::kind),
            Some(refdeploy_domain::ErrorKind::NotCached)
        );
        Ok(())
    }

    #[test]
    fn subsummary_is_rebuilt_from_delta() -> Result<()> {
        let remote = tempfile::tempdir()?;
        let cache_dir = tempfile::tempdir()?;
        let old: Vec<u8> = (0..2048u32).flat_map(u32::to_le_bytes).collect();
        let mut new = old.clone();
        new.extend_from_slice(b"one more ref");
        let old_sum = sha256_hex(&old);
        let new_sum = sha256_hex(&new);
        fs::write(cache_dir.path().join(format!("origin-x86_64-{old_sum}.sub")), &old)?;
        fs::create_dir_all(remote.path().join("summaries"))?;
        fs::write(
            remote.path().join(format!("summaries/{old_sum}-{new_sum}.delta")),
            create_delta(&old, &new)?,
        )?;

        let cache = SummaryCache::new(cache_dir.path().to_path_buf(), Fetcher::new());
        let source = local_source(remote.path(), None);
        let data = cache.fetch_indexed_summary(
            &source,
            "x86_64",
            &descriptor(&new, vec![old_sum]),
            false,
            &Cancellable::new(),
        )?;
        assert_eq!(sha256_hex(&data), new_sum);
        assert!(!remote.path().join(format!("summaries/{new_sum}.gz")).exists());
        Ok(())
    }

    #[test]
    fn full_fetch_checksum_mismatch_is_fatal() -> Result<()> {
        let remote = tempfile::tempdir()?;
        let cache_dir = tempfile::tempdir()?;
        let expected = b"expected".to_vec();
        let checksum = sha256_hex(&expected);
        fs::create_dir_all(remote.path().join("summaries"))?;
        fs::write(
            remote.path().join(format!("summaries/{checksum}.gz")),
            gzip(b"tampered")?,
        )?;
        let cache = SummaryCache::new(cache_dir.path().to_path_buf(), Fetcher::new());
        let err = cache
            .fetch_indexed_summary(
                &local_source(remote.path(), None),
                "x86_64",
                &descriptor(&expected, Vec::new()),
                false,
                &Cancellable::new(),
            )
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DeployError>().map(DeployError::kind),
            Some(refdeploy_domain::ErrorKind::InvalidData)
        );
        Ok(())
    }

    #[test]
    fn corrupt_cached_subsummary_is_removed_and_reported() -> Result<()> {
        let remote = tempfile::tempdir()?;
        let cache_dir = tempfile::tempdir()?;
        let data = b"real subsummary".to_vec();
        let checksum = sha256_hex(&data);
        let cached = cache_dir.path().join(format!("origin-x86_64-{checksum}.sub"));
        fs::write(&cached, b"garbage")?;
        fs::create_dir_all(remote.path().join("summaries"))?;
        fs::write(remote.path().join(format!("summaries/{checksum}.gz")), gzip(&data)?)?;

        let cache = SummaryCache::new(cache_dir.path().to_path_buf(), Fetcher::new());
        let source = local_source(remote.path(), None);
        let err = cache
            .fetch_indexed_summary(&source, "x86_64", &descriptor(&data, Vec::new()), false, &Cancellable::new())
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DeployError>().map(DeployError::kind),
            Some(refdeploy_domain::ErrorKind::InvalidData)
        );
        assert!(!cached.exists());

        let fetched = cache.fetch_indexed_summary(
            &source,
            "x86_64",
            &descriptor(&data, Vec::new()),
            false,
            &Cancellable::new(),
        )?;
        assert_eq!(fetched, data);
        Ok(())
    }

    #[test]
    fn removing_a_remote_keeps_remotes_sharing_its_prefix() -> Result<()> {
        let cache_dir = tempfile::tempdir()?;
        let cache = SummaryCache::new(cache_dir.path().to_path_buf(), Fetcher::new());
        let sum = hex::encode([7u8; 32]);
        let own = cache_dir.path().join(format!("flathub-x86_64-{sum}.sub"));
        let beta = cache_dir.path().join(format!("flathub-beta-x86_64-{sum}.sub"));
        fs::write(&own, b"x")?;
        fs::write(&beta, b"x")?;
        let blob = SummaryBlob {
            data: b"sub".to_vec(),
            signature: None,
        };
        let beta_key = subsummary_cache_key("flathub-beta", "x86_64", &sum);
        cache.memory_insert(&subsummary_cache_key("flathub", "x86_64", &sum), "https://a/", blob.clone());
        cache.memory_insert(&beta_key, "https://b/", blob.clone());

        cache.remove_remote("flathub")?;
        assert!(!own.exists());
        assert!(beta.exists());
        assert_eq!(cache.memory_lookup(&beta_key, "https://b/"), Some(blob));
        Ok(())
    }

    #[test]
    fn gc_keeps_newest_and_just_written() -> Result<()> {
        let cache_dir = tempfile::tempdir()?;
        let cache = SummaryCache::new(cache_dir.path().to_path_buf(), Fetcher::new());
        let path = |byte: u8| {
            cache_dir
                .path()
                .join(format!("origin-x86_64-{}.sub", hex::encode([byte; 32])))
        };
        for (byte, mtime) in [(1u8, 100), (2, 300), (3, 200)] {
            fs::write(path(byte), b"x")?;
            filetime::set_file_mtime(path(byte), FileTime::from_unix_time(mtime, 0))?;
        }
        let other_arch = cache_dir
            .path()
            .join(format!("origin-aarch64-{}.sub", hex::encode([4; 32])));
        fs::write(&other_arch, b"x")?;

        let removed = cache.gc_cached_digested_summaries("origin", "x86_64", &path(3));
        assert_eq!(removed, 1);
        assert!(!path(1).exists());
        assert!(path(2).exists() && path(3).exists() && other_arch.exists());
        Ok(())
    }
}
