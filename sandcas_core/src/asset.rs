//! Content-addressed asset cache.
//!
//! Assets declared in a [`Manifest`] are materialized into the cache
//! directory under `<prefix>-<hash>.<type>`. Because the name is derived
//! from the content hash, a file that exists with the right digest is
//! always current and nothing is evicted automatically; [`AssetCache::prune`]
//! is the explicit sweep for files no longer in the manifest.

use crate::download::{DownloadOptions, Downloader};
use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::manifest::{AssetMetadata, Manifest};
use crate::store::FileStore;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Default cache file name prefix.
pub const DEFAULT_CACHE_PREFIX: &str = "asset";

/// Registry record for an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub hash: Hash,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub url: String,
    /// Set once the asset has been materialized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_uri: Option<String>,
}

impl From<&AssetMetadata> for CacheEntry {
    fn from(meta: &AssetMetadata) -> Self {
        Self {
            id: meta.id.clone(),
            name: meta.name.clone(),
            kind: meta.kind.clone(),
            hash: meta.hash,
            width: meta.width,
            height: meta.height,
            url: meta.url.clone(),
            local_uri: None,
        }
    }
}

/// Statistics from a prune run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneStats {
    /// Number of cache files deleted.
    pub files_deleted: usize,
    /// Bytes freed.
    pub bytes_freed: u64,
}

type InflightMap = HashMap<Hash, Arc<tokio::sync::Mutex<()>>>;

/// Resolves manifest assets and materializes them into the cache directory.
pub struct AssetCache {
    downloader: Downloader,
    manifest: Manifest,
    prefix: String,
    registry: Mutex<HashMap<String, CacheEntry>>,
    inflight: Mutex<InflightMap>,
}

impl AssetCache {
    pub fn new(downloader: Downloader, manifest: Manifest, prefix: impl Into<String>) -> Self {
        Self {
            downloader,
            manifest,
            prefix: prefix.into(),
            registry: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &FileStore {
        self.downloader.store()
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Look up an asset, registering it on first use.
    pub fn resolve(&self, id: &str) -> Result<CacheEntry> {
        let mut registry = self.registry();
        if let Some(entry) = registry.get(id) {
            return Ok(entry.clone());
        }

        let meta = self
            .manifest
            .get(id)
            .ok_or_else(|| Error::unknown_asset(id))?;
        let entry = CacheEntry::from(meta);
        registry.insert(id.to_string(), entry.clone());
        Ok(entry)
    }

    /// Cache file name for an entry: `<prefix>-<hash>.<type>`.
    pub fn cache_file_name(&self, entry: &CacheEntry) -> String {
        if entry.kind.is_empty() {
            format!("{}-{}", self.prefix, entry.hash)
        } else {
            format!("{}-{}.{}", self.prefix, entry.hash, entry.kind)
        }
    }

    /// Absolute cache path for an entry.
    pub fn cache_path(&self, entry: &CacheEntry) -> Result<PathBuf> {
        let name = self.cache_file_name(entry);
        let path = self.store().resolve_cache(&name)?;
        if path.parent() != Some(self.store().cache_dir()) {
            return Err(Error::out_of_scope(name));
        }
        Ok(path)
    }

    /// Ensure the asset's bytes are in the cache and return their `file://` URI.
    ///
    /// Concurrent calls for the same hash are coalesced: later callers wait
    /// for the first and then take the cache hit.
    pub async fn materialize(&self, entry: &mut CacheEntry) -> Result<String> {
        let path = self.cache_path(entry)?;

        let slot = self.inflight_slot(entry.hash);
        let guard = slot.lock.lock().await;
        let result = self.fetch_if_missing(entry, &path).await;
        drop(guard);
        drop(slot);

        let uri = result?;
        entry.local_uri = Some(uri.clone());
        self.registry().insert(entry.id.clone(), entry.clone());
        Ok(uri)
    }

    /// Resolve and materialize an asset.
    pub async fn download(&self, id: &str) -> Result<CacheEntry> {
        let mut entry = self.resolve(id)?;
        self.materialize(&mut entry).await?;
        Ok(entry)
    }

    async fn fetch_if_missing(&self, entry: &CacheEntry, path: &Path) -> Result<String> {
        match Hash::hash_file(entry.hash.algorithm(), path).await {
            Ok(actual) if actual == entry.hash => {
                debug!(id = %entry.id, path = %path.display(), "cache hit");
                return Ok(self.store().uri(path));
            }
            Ok(actual) => {
                warn!(
                    id = %entry.id,
                    expected = %entry.hash,
                    actual = %actual,
                    "Cached file digest mismatch, downloading again"
                );
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        tokio::fs::create_dir_all(self.store().cache_dir()).await?;
        let options = DownloadOptions {
            hash: false,
            expected_hash: Some(entry.hash),
        };
        let result = self.downloader.download_to(&entry.url, path, options).await?;
        info!(id = %entry.id, url = %entry.url, status = result.status, size = result.size, "materialized asset");
        Ok(result.uri)
    }

    /// Delete cache files whose hash is not referenced by the manifest.
    ///
    /// Only files following the cache naming convention are considered.
    /// If `dry_run` is true, reports what would be deleted without deleting.
    pub async fn prune(&self, dry_run: bool) -> Result<PruneStats> {
        let referenced: HashSet<Hash> = self.manifest.iter().map(|a| a.hash).collect();
        let mut stats = PruneStats::default();

        let cache_dir = self.store().cache_dir();
        let mut entries = match tokio::fs::read_dir(cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            let file_name = entry.file_name();
            let Some(hash) = file_name.to_str().and_then(|n| self.parse_cache_name(n)) else {
                continue;
            };
            if referenced.contains(&hash) {
                continue;
            }

            stats.files_deleted += 1;
            stats.bytes_freed += metadata.len();
            if !dry_run {
                tokio::fs::remove_file(entry.path()).await?;
            }
            debug!(path = ?entry.path(), dry_run, "pruned cache file");
        }

        info!(
            files = stats.files_deleted,
            bytes = stats.bytes_freed,
            dry_run,
            "pruned asset cache"
        );
        Ok(stats)
    }

    /// Extract the hash from a `<prefix>-<hash>[.<type>]` file name.
    fn parse_cache_name(&self, file_name: &str) -> Option<Hash> {
        let rest = file_name
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('-')?;
        let hex = rest.split('.').next()?;
        Hash::from_hex(self.store().algorithm(), hex).ok()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inflight_slot(&self, hash: Hash) -> InflightSlot<'_> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = inflight.entry(hash).or_default().clone();
        InflightSlot {
            inflight: &self.inflight,
            hash,
            lock,
        }
    }
}

/// Membership in the per-hash coalescing table; the table entry is removed
/// when the last waiter leaves.
struct InflightSlot<'a> {
    inflight: &'a Mutex<InflightMap>,
    hash: Hash,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference is the table's, one is ours.
        if Arc::strong_count(&self.lock) <= 2 {
            inflight.remove(&self.hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Algorithm;
    use crate::store::{InfoOptions, StoreOptions};
    use crate::transport::{Response, Transport};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use url::Url;

    const AVATAR_URL: &str = "https://cdn.example.com/assets/avatar2.png";
    const AVATAR_BYTES: &[u8] = b"\x89PNG fake avatar bytes";

    /// Serves fixed bodies by URL and counts fetches.
    struct CountingTransport {
        bodies: HashMap<String, Vec<u8>>,
        fetches: AtomicUsize,
        delay: Duration,
    }

    impl CountingTransport {
        fn new(bodies: &[(&str, &[u8])]) -> Arc<Self> {
            Arc::new(Self {
                bodies: bodies
                    .iter()
                    .map(|(url, body)| (url.to_string(), body.to_vec()))
                    .collect(),
                fetches: AtomicUsize::new(0),
                delay: Duration::from_millis(20),
            })
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn fetch(&self, url: &Url) -> crate::error::Result<Response> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let (status, body) = match self.bodies.get(url.as_str()) {
                Some(body) => (200, body.clone()),
                None => (404, b"not found".to_vec()),
            };
            Ok(Response {
                status,
                headers: Default::default(),
                body: Box::pin(stream::iter(vec![Ok(Bytes::from(body))])),
            })
        }
    }

    fn avatar_meta(hash: Hash) -> AssetMetadata {
        AssetMetadata {
            id: "avatar".to_string(),
            name: "avatar2".to_string(),
            kind: "png".to_string(),
            hash,
            width: Some(256),
            height: Some(256),
            url: AVATAR_URL.to_string(),
        }
    }

    fn setup(transport: Arc<CountingTransport>, assets: Vec<AssetMetadata>) -> (TempDir, AssetCache) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::init(temp_dir.path().join("sandbox"), StoreOptions::default())
            .unwrap();
        let downloader = Downloader::new(store, transport);
        let cache = AssetCache::new(downloader, Manifest::from_assets(assets), DEFAULT_CACHE_PREFIX);
        (temp_dir, cache)
    }

    fn avatar_setup() -> (TempDir, AssetCache, Arc<CountingTransport>, Hash) {
        let transport = CountingTransport::new(&[(AVATAR_URL, AVATAR_BYTES)]);
        let hash = Hash::hash_bytes(Algorithm::Md5, AVATAR_BYTES);
        let (tmp, cache) = setup(transport.clone(), vec![avatar_meta(hash)]);
        (tmp, cache, transport, hash)
    }

    #[test]
    fn test_resolve_unknown() {
        let (_tmp, cache, _transport, _hash) = avatar_setup();
        assert!(matches!(
            cache.resolve("nope"),
            Err(Error::UnknownAsset { .. })
        ));
    }

    #[test]
    fn test_resolve_metadata() {
        let (_tmp, cache, transport, hash) = avatar_setup();
        let entry = cache.resolve("avatar").unwrap();

        assert_eq!(entry.name, "avatar2");
        assert_eq!(entry.kind, "png");
        assert_eq!(entry.hash, hash);
        assert_eq!(entry.width, Some(256));
        assert_eq!(entry.height, Some(256));
        assert!(entry.local_uri.is_none());
        assert_eq!(transport.fetches(), 0);
    }

    #[test]
    fn test_cache_file_name() {
        let (_tmp, cache, _transport, hash) = avatar_setup();
        let entry = cache.resolve("avatar").unwrap();
        assert_eq!(cache.cache_file_name(&entry), format!("asset-{}.png", hash));

        let path = cache.cache_path(&entry).unwrap();
        assert_eq!(path.parent().unwrap(), cache.store().cache_dir());
    }

    #[test]
    fn test_cache_path_rejects_escaping_type() {
        let (_tmp, cache, _transport, _hash) = avatar_setup();
        let mut entry = cache.resolve("avatar").unwrap();
        entry.kind = "png/../../../escape".to_string();
        assert!(cache.cache_path(&entry).is_err());
    }

    #[tokio::test]
    async fn test_download_materializes_into_cache() {
        let (_tmp, cache, transport, hash) = avatar_setup();

        let entry = cache.download("avatar").await.unwrap();
        let local_uri = entry.local_uri.clone().unwrap();
        assert!(local_uri.starts_with("file://"));
        assert!(local_uri.ends_with(&format!("/cache/asset-{}.png", hash)));
        assert_eq!(transport.fetches(), 1);

        // The cache lookup reports the same file and digest.
        let name = cache.cache_file_name(&entry);
        let info = cache
            .store()
            .info(&name, InfoOptions { cache: true, hash: true })
            .await
            .unwrap();
        assert!(info.exists);
        assert_eq!(info.uri, local_uri);
        assert_eq!(info.hash, Some(hash));

        // The registry remembers the materialization.
        assert_eq!(cache.resolve("avatar").unwrap().local_uri, Some(local_uri));
    }

    #[tokio::test]
    async fn test_cache_hit_avoids_network() {
        let (_tmp, cache, transport, _hash) = avatar_setup();

        cache.download("avatar").await.unwrap();
        cache.download("avatar").await.unwrap();
        let mut entry = cache.resolve("avatar").unwrap();
        cache.materialize(&mut entry).await.unwrap();

        assert_eq!(transport.fetches(), 1);
    }

    #[tokio::test]
    async fn test_corrupted_cache_file_redownloaded() {
        let (_tmp, cache, transport, _hash) = avatar_setup();
        let entry = cache.download("avatar").await.unwrap();

        let path = cache.cache_path(&entry).unwrap();
        tokio::fs::write(&path, b"corrupted").await.unwrap();

        cache.download("avatar").await.unwrap();
        assert_eq!(transport.fetches(), 2);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), AVATAR_BYTES);
    }

    #[tokio::test]
    async fn test_integrity_failure_leaves_no_file() {
        let transport = CountingTransport::new(&[(AVATAR_URL, b"tampered")]);
        let hash = Hash::hash_bytes(Algorithm::Md5, AVATAR_BYTES);
        let (_tmp, cache) = setup(transport, vec![avatar_meta(hash)]);

        let result = cache.download("avatar").await;
        assert!(matches!(result, Err(Error::Integrity { .. })));

        let entry = cache.resolve("avatar").unwrap();
        assert!(entry.local_uri.is_none());
        assert!(!cache.cache_path(&entry).unwrap().exists());
    }

    #[tokio::test]
    async fn test_concurrent_materializations_coalesce() {
        let (_tmp, cache, transport, _hash) = avatar_setup();

        let (a, b, c) = tokio::join!(
            cache.download("avatar"),
            cache.download("avatar"),
            cache.download("avatar"),
        );
        let a = a.unwrap();
        assert_eq!(a.local_uri, b.unwrap().local_uri);
        assert_eq!(a.local_uri, c.unwrap().local_uri);
        assert_eq!(transport.fetches(), 1);
        assert!(cache.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_unreferenced() {
        let (_tmp, cache, _transport, _hash) = avatar_setup();
        let kept = cache.download("avatar").await.unwrap();
        let cache_dir = cache.store().cache_dir().to_path_buf();

        let orphan_hash = Hash::hash_bytes(Algorithm::Md5, b"old asset");
        let orphan = cache_dir.join(format!("asset-{}.jpg", orphan_hash));
        tokio::fs::write(&orphan, b"old asset").await.unwrap();
        let unrelated = cache_dir.join("notes.txt");
        tokio::fs::write(&unrelated, b"not a cache file").await.unwrap();

        // Dry run should report but not delete
        let stats = cache.prune(true).await.unwrap();
        assert_eq!(stats.files_deleted, 1);
        assert_eq!(stats.bytes_freed, 9);
        assert!(orphan.exists());

        let stats = cache.prune(false).await.unwrap();
        assert_eq!(stats.files_deleted, 1);
        assert!(!orphan.exists());
        assert!(unrelated.exists());
        assert!(cache.cache_path(&kept).unwrap().exists());

        let stats = cache.prune(false).await.unwrap();
        assert_eq!(stats, PruneStats::default());
    }
}
