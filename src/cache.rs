//! # Result Cache
//!
//! Content-addressed store of finished outputs. The key is
//! `sha256(input_bytes ‖ preset_id)` in hex, so identical uploads processed
//! with the same preset map to the same entry.
//!
//! ## On-disk Layout:
//! ```text
//! <root>/<preset_id>/<hash>.<ext>    payload (hard link to the output, or a copy)
//! <root>/<preset_id>/<hash>.json     metadata sidecar
//! ```
//!
//! ## Expiry and Eviction:
//! - An entry is valid while `now - created_at < ttl`; expired entries are
//!   deleted the moment a lookup sees them
//! - A cleanup pass runs at most once per `check_interval` after a store (or
//!   on demand via [`ResultCache::sweep`]); it drops expired entries and, if
//!   the total size is over the cap, evicts oldest-first until usage is below
//!   80%, always keeping the newest `retain_floor` entries
//!
//! ## Failure Policy:
//! Cache problems never fail a request. Internally everything returns
//! [`CacheError`]; the public API logs and degrades to a miss or `false`.
//! Concurrent writers may race on the same key; the last writer wins.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Eviction target as a fraction of the size cap.
const EVICTION_TARGET: f64 = 0.8;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("cache payload missing: {0}")]
    MissingPayload(PathBuf),
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub root: PathBuf,
    pub ttl: Duration,
    pub check_interval: Duration,
    pub max_size_bytes: u64,
    pub retain_floor: usize,
}

/// Sidecar metadata written next to every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub hash: String,
    pub preset: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub size_bytes: u64,
    /// Caller-supplied fields (task id, timings, ...)
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CacheMetadata {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age < chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

/// A live cache hit.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub metadata: CacheMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub expired: usize,
    pub evicted: usize,
    pub remaining_entries: usize,
    pub remaining_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub total_size_bytes: u64,
    pub max_size_bytes: u64,
    pub usage_percent: f64,
    pub ttl_secs: u64,
    pub root: String,
}

/// One scanned entry on disk.
struct StoredEntry {
    metadata_path: PathBuf,
    metadata: Option<CacheMetadata>,
}

/// Hex cache key for `(input bytes, preset id)`.
pub fn cache_key(input: &[u8], preset_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hasher.update(preset_id.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ResultCache {
    settings: CacheSettings,
    last_cleanup: Mutex<Instant>,
}

impl ResultCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    fn preset_dir(&self, preset_id: &str) -> PathBuf {
        self.settings.root.join(preset_id)
    }

    fn metadata_path(&self, preset_id: &str, hash: &str) -> PathBuf {
        self.preset_dir(preset_id).join(format!("{hash}.json"))
    }

    /// Look up the cached output for `input` processed with `preset_id`.
    pub async fn lookup(&self, input: &[u8], preset_id: &str) -> Option<CacheEntry> {
        if !self.settings.enabled {
            return None;
        }
        self.lookup_key(preset_id, &cache_key(input, preset_id)).await
    }

    pub async fn lookup_key(&self, preset_id: &str, hash: &str) -> Option<CacheEntry> {
        if !self.settings.enabled {
            return None;
        }

        let metadata_path = self.metadata_path(preset_id, hash);
        let short = &hash[..hash.len().min(8)];

        match self.read_entry(&metadata_path).await {
            Ok(Some(entry)) => {
                if entry.metadata.is_valid_at(Utc::now()) {
                    info!(hash = %short, preset = %preset_id, "Cache hit");
                    Some(entry)
                } else {
                    info!(hash = %short, preset = %preset_id, "Cache entry expired");
                    self.remove_entry(&metadata_path, Some(&entry.metadata)).await;
                    None
                }
            }
            Ok(None) => {
                debug!(hash = %short, preset = %preset_id, "Cache miss");
                None
            }
            Err(e) => {
                warn!(hash = %short, preset = %preset_id, error = %e, "Unreadable cache entry, discarding");
                let metadata = self.read_metadata(&metadata_path).await.ok().flatten();
                self.remove_entry(&metadata_path, metadata.as_ref()).await;
                None
            }
        }
    }

    async fn read_metadata(&self, metadata_path: &Path) -> Result<Option<CacheMetadata>, CacheError> {
        let raw = match fs::read(metadata_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    async fn read_entry(&self, metadata_path: &Path) -> Result<Option<CacheEntry>, CacheError> {
        let Some(metadata) = self.read_metadata(metadata_path).await? else {
            return Ok(None);
        };

        let payload = payload_path(metadata_path, &metadata);
        if !fs::try_exists(&payload).await? {
            return Err(CacheError::MissingPayload(payload));
        }
        Ok(Some(CacheEntry {
            path: payload,
            metadata,
        }))
    }

    /// Store `result_path` as the output for `(input, preset_id)`.
    pub async fn store(
        &self,
        input: &[u8],
        preset_id: &str,
        result_path: &Path,
        extra: serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        if !self.settings.enabled {
            return false;
        }

        self.store_key(&cache_key(input, preset_id), preset_id, result_path, extra)
            .await
    }

    /// Store under a precomputed key (see [`cache_key`]).
    pub async fn store_key(
        &self,
        hash: &str,
        preset_id: &str,
        result_path: &Path,
        extra: serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        if !self.settings.enabled {
            return false;
        }

        let short = &hash[..hash.len().min(8)];
        match self
            .store_at(hash, preset_id, result_path, extra, Utc::now())
            .await
        {
            Ok(metadata) => {
                info!(
                    hash = %short,
                    preset = %preset_id,
                    size_bytes = metadata.size_bytes,
                    "Cached result"
                );
                self.maybe_cleanup().await;
                true
            }
            Err(e) => {
                error!(hash = %short, preset = %preset_id, error = %e, "Failed to cache result");
                false
            }
        }
    }

    async fn store_at(
        &self,
        hash: &str,
        preset_id: &str,
        result_path: &Path,
        extra: serde_json::Map<String, serde_json::Value>,
        created_at: DateTime<Utc>,
    ) -> Result<CacheMetadata, CacheError> {
        let dir = self.preset_dir(preset_id);
        fs::create_dir_all(&dir).await?;

        let ext = result_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        let file_name = format!("{hash}.{ext}");
        let payload = dir.join(&file_name);

        if fs::try_exists(&payload).await? {
            fs::remove_file(&payload).await?;
        }
        if let Err(e) = fs::hard_link(result_path, &payload).await {
            debug!(error = %e, "Hard link failed, copying into cache");
            fs::copy(result_path, &payload).await?;
        }
        let size_bytes = fs::metadata(&payload).await?.len();

        let metadata = CacheMetadata {
            hash: hash.to_string(),
            preset: preset_id.to_string(),
            file_name,
            created_at,
            ttl_secs: self.settings.ttl.as_secs(),
            size_bytes,
            extra,
        };

        // Write-then-rename so readers never see a partial sidecar.
        let metadata_path = self.metadata_path(preset_id, hash);
        let staging = metadata_path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_vec_pretty(&metadata)?).await?;
        fs::rename(&staging, &metadata_path).await?;

        Ok(metadata)
    }

    /// Remove an entry. Succeeds whether or not the entry existed.
    pub async fn delete(&self, preset_id: &str, hash: &str) -> bool {
        let metadata_path = self.metadata_path(preset_id, hash);
        let metadata = self.read_metadata(&metadata_path).await.ok().flatten();
        self.remove_entry(&metadata_path, metadata.as_ref()).await
    }

    async fn remove_entry(&self, metadata_path: &Path, metadata: Option<&CacheMetadata>) -> bool {
        let mut ok = true;
        if let Some(meta) = metadata {
            ok &= remove_if_present(&payload_path(metadata_path, meta)).await;
        }
        ok &= remove_if_present(metadata_path).await;
        debug!(path = %metadata_path.display(), "Deleted cache entry");
        ok
    }

    async fn maybe_cleanup(&self) {
        {
            let mut last = self.last_cleanup.lock().await;
            if last.elapsed() < self.settings.check_interval {
                return;
            }
            *last = Instant::now();
        }
        self.run_cleanup().await;
    }

    /// Forced cleanup pass, ignoring the check interval.
    pub async fn sweep(&self) -> CleanupReport {
        *self.last_cleanup.lock().await = Instant::now();
        self.run_cleanup().await
    }

    async fn run_cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let now = Utc::now();

        let mut live: Vec<(PathBuf, CacheMetadata)> = Vec::new();
        for entry in self.scan().await {
            match entry.metadata {
                Some(meta) if meta.is_valid_at(now) => live.push((entry.metadata_path, meta)),
                Some(meta) => {
                    self.remove_entry(&entry.metadata_path, Some(&meta)).await;
                    report.expired += 1;
                }
                None => {
                    self.remove_entry(&entry.metadata_path, None).await;
                    report.expired += 1;
                }
            }
        }

        live.sort_by_key(|(_, meta)| meta.created_at);
        let mut total: u64 = live.iter().map(|(_, meta)| meta.size_bytes).sum();
        let cap = self.settings.max_size_bytes;

        if total > cap {
            info!(total_bytes = total, max_bytes = cap, "Cache over size limit, evicting");
            let target = cap as f64 * EVICTION_TARGET;
            let evictable = live.len().saturating_sub(self.settings.retain_floor);

            let mut evicted = 0;
            while evicted < evictable && (total as f64) >= target {
                let (path, meta) = &live[evicted];
                self.remove_entry(path, Some(meta)).await;
                total = total.saturating_sub(meta.size_bytes);
                evicted += 1;
            }
            live.drain(..evicted);
            report.evicted = evicted;
        }

        report.remaining_entries = live.len();
        report.remaining_bytes = total;
        if report.expired + report.evicted > 0 {
            info!(
                expired = report.expired,
                evicted = report.evicted,
                remaining = report.remaining_entries,
                "Cache cleanup complete"
            );
        }
        report
    }

    /// Every metadata sidecar under the root. Unparseable sidecars come back
    /// with `metadata: None`.
    async fn scan(&self) -> Vec<StoredEntry> {
        let mut found = Vec::new();
        let mut presets = match fs::read_dir(&self.settings.root).await {
            Ok(dir) => dir,
            Err(_) => return found,
        };

        while let Ok(Some(preset_dir)) = presets.next_entry().await {
            let Ok(mut files) = fs::read_dir(preset_dir.path()).await else {
                continue;
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let metadata = match self.read_metadata(&path).await {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Corrupt cache metadata");
                        None
                    }
                };
                found.push(StoredEntry {
                    metadata_path: path,
                    metadata,
                });
            }
        }
        found
    }

    pub async fn stats(&self) -> CacheStats {
        let entries: Vec<CacheMetadata> = self
            .scan()
            .await
            .into_iter()
            .filter_map(|e| e.metadata)
            .collect();
        let total: u64 = entries.iter().map(|m| m.size_bytes).sum();
        let cap = self.settings.max_size_bytes;

        CacheStats {
            enabled: self.settings.enabled,
            entries: entries.len(),
            total_size_bytes: total,
            max_size_bytes: cap,
            usage_percent: if cap > 0 {
                (total as f64 / cap as f64 * 1000.0).round() / 10.0
            } else {
                0.0
            },
            ttl_secs: self.settings.ttl.as_secs(),
            root: self.settings.root.display().to_string(),
        }
    }

    /// Delete every entry. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut count = 0;
        for entry in self.scan().await {
            self.remove_entry(&entry.metadata_path, entry.metadata.as_ref())
                .await;
            count += 1;
        }
        info!(count, "Cleared cache");
        count
    }
}

fn payload_path(metadata_path: &Path, metadata: &CacheMetadata) -> PathBuf {
    metadata_path.with_file_name(&metadata.file_name)
}

async fn remove_if_present(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to delete cache file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(root: &Path) -> CacheSettings {
        CacheSettings {
            enabled: true,
            root: root.to_path_buf(),
            ttl: Duration::from_secs(3600),
            check_interval: Duration::from_secs(3600),
            max_size_bytes: 1024 * 1024,
            retain_floor: 5,
        }
    }

    async fn output_file(dir: &Path, name: &str, size: usize) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![7u8; size]).await.unwrap();
        path
    }

    #[test]
    fn test_cache_key_is_stable_and_preset_sensitive() {
        let a = cache_key(b"audio bytes", "cinema");
        assert_eq!(a, cache_key(b"audio bytes", "cinema"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, cache_key(b"audio bytes", "club"));
        assert_ne!(a, cache_key(b"audio byteS", "cinema"));
    }

    #[tokio::test]
    async fn test_store_then_lookup_hits_same_entry() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let cache = ResultCache::new(settings(root.path()));
        let output = output_file(work.path(), "out.mp3", 256).await;

        assert!(cache.lookup(b"input", "cinema").await.is_none());
        assert!(cache.store(b"input", "cinema", &output, Default::default()).await);

        let first = cache.lookup(b"input", "cinema").await.unwrap();
        let second = cache.lookup(b"input", "cinema").await.unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(first.metadata.size_bytes, 256);
        assert_eq!(first.path.extension().unwrap(), "mp3");

        let expected = root
            .path()
            .join("cinema")
            .join(format!("{}.mp3", cache_key(b"input", "cinema")));
        assert_eq!(first.path, expected);
        assert!(expected.with_extension("json").exists());
    }

    #[tokio::test]
    async fn test_no_false_hits_across_presets_or_inputs() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let cache = ResultCache::new(settings(root.path()));
        let output = output_file(work.path(), "out.mp3", 64).await;

        assert!(cache.store(b"input", "cinema", &output, Default::default()).await);
        assert!(cache.lookup(b"input", "club").await.is_none());
        assert!(cache.lookup(b"other", "cinema").await.is_none());
    }

    #[tokio::test]
    async fn test_payload_survives_removal_of_source() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let cache = ResultCache::new(settings(root.path()));
        let output = output_file(work.path(), "out.mp3", 128).await;

        assert!(cache.store(b"input", "vocal", &output, Default::default()).await);
        fs::remove_file(&output).await.unwrap();

        let entry = cache.lookup(b"input", "vocal").await.unwrap();
        assert_eq!(fs::read(&entry.path).await.unwrap().len(), 128);
    }

    #[tokio::test]
    async fn test_expired_entry_is_removed_on_lookup() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let cache = ResultCache::new(settings(root.path()));
        let output = output_file(work.path(), "out.mp3", 32).await;
        let hash = cache_key(b"input", "cinema");

        let stale = Utc::now() - chrono::Duration::seconds(7200);
        cache
            .store_at(&hash, "cinema", &output, Default::default(), stale)
            .await
            .unwrap();
        let payload = root.path().join("cinema").join(format!("{hash}.mp3"));
        assert!(payload.exists());

        assert!(cache.lookup(b"input", "cinema").await.is_none());
        assert!(!payload.exists());
        assert!(!payload.with_extension("json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_a_miss() {
        let root = TempDir::new().unwrap();
        let cache = ResultCache::new(settings(root.path()));
        let hash = cache_key(b"input", "cinema");
        let dir = root.path().join("cinema");
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join(format!("{hash}.json")), b"{not json").await.unwrap();

        assert!(cache.lookup(b"input", "cinema").await.is_none());
        assert!(!dir.join(format!("{hash}.json")).exists());
    }

    #[tokio::test]
    async fn test_size_eviction_keeps_newest_floor() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let mut cfg = settings(root.path());
        cfg.max_size_bytes = 1000;
        let cache = ResultCache::new(cfg);
        let output = output_file(work.path(), "out.mp3", 200).await;

        let base = Utc::now() - chrono::Duration::seconds(600);
        let mut hashes = Vec::new();
        for i in 0..10 {
            let hash = cache_key(format!("input-{i}").as_bytes(), "club");
            cache
                .store_at(
                    &hash,
                    "club",
                    &output,
                    Default::default(),
                    base + chrono::Duration::seconds(i),
                )
                .await
                .unwrap();
            hashes.push(hash);
        }

        // 2000 bytes against a 1000 byte cap; the floor stops eviction at 5.
        let report = cache.sweep().await;
        assert_eq!(report.evicted, 5);
        assert_eq!(report.remaining_entries, 5);
        assert_eq!(report.remaining_bytes, 1000);

        for (i, hash) in hashes.iter().enumerate() {
            let present = cache.lookup_key("club", hash).await.is_some();
            assert_eq!(present, i >= 5, "entry {i}");
        }
    }

    #[tokio::test]
    async fn test_size_eviction_stops_below_target() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let mut cfg = settings(root.path());
        cfg.max_size_bytes = 2000;
        let cache = ResultCache::new(cfg);
        let output = output_file(work.path(), "out.mp3", 200).await;

        let base = Utc::now() - chrono::Duration::seconds(600);
        for i in 0..12 {
            let hash = cache_key(format!("input-{i}").as_bytes(), "club");
            cache
                .store_at(
                    &hash,
                    "club",
                    &output,
                    Default::default(),
                    base + chrono::Duration::seconds(i),
                )
                .await
                .unwrap();
        }

        // 2400 bytes; evict until strictly below 1600.
        let report = cache.sweep().await;
        assert_eq!(report.evicted, 5);
        assert_eq!(report.remaining_bytes, 1400);
        assert_eq!(cache.stats().await.entries, 7);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_entries() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let cache = ResultCache::new(settings(root.path()));
        let output = output_file(work.path(), "out.mp3", 50).await;

        let stale = Utc::now() - chrono::Duration::seconds(7200);
        cache
            .store_at("aaaa", "cinema", &output, Default::default(), stale)
            .await
            .unwrap();
        cache
            .store_at("bbbb", "cinema", &output, Default::default(), Utc::now())
            .await
            .unwrap();

        let report = cache.sweep().await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.remaining_entries, 1);
        assert!(cache.lookup_key("cinema", "bbbb").await.is_some());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_clear_counts() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let cache = ResultCache::new(settings(root.path()));
        let output = output_file(work.path(), "out.flac", 10).await;

        assert!(cache.store(b"a", "cinema", &output, Default::default()).await);
        assert!(cache.store(b"b", "neutral", &output, Default::default()).await);
        assert!(cache.store(b"c", "neutral", &output, Default::default()).await);

        let hash = cache_key(b"a", "cinema");
        assert!(cache.delete("cinema", &hash).await);
        assert!(cache.delete("cinema", &hash).await);
        assert!(cache.lookup(b"a", "cinema").await.is_none());

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_size_bytes, 20);

        assert_eq!(cache.clear().await, 2);
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_disabled_cache_never_hits() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let mut cfg = settings(root.path());
        cfg.enabled = false;
        let cache = ResultCache::new(cfg);
        let output = output_file(work.path(), "out.mp3", 10).await;

        assert!(!cache.store(b"input", "cinema", &output, Default::default()).await);
        assert!(cache.lookup(b"input", "cinema").await.is_none());
        assert!(!cache.stats().await.enabled);
    }

    #[test]
    fn test_metadata_validity_window() {
        let now = Utc::now();
        let meta = CacheMetadata {
            hash: "h".into(),
            preset: "cinema".into(),
            file_name: "h.mp3".into(),
            created_at: now - chrono::Duration::seconds(10),
            ttl_secs: 10,
            size_bytes: 1,
            extra: Default::default(),
        };
        assert!(!meta.is_valid_at(now));
        assert!(meta.is_valid_at(now - chrono::Duration::seconds(1)));
    }
}
