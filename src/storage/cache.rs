//! Content cache
//!
//! Stores transferred resource payloads in a blob directory keyed by their
//! SHA256 digest, with metadata rows in the registry. Storing identical
//! bytes twice is a no-op on disk; eviction is least-recently-used among
//! entries with a zero reference count, triggered when the managed blobs
//! exceed the configured quota.
//!
//! The scanner also registers original on-disk files here (`managed =
//! false`) so transfers can be served without copying system files into the
//! blob directory. Those entries carry metadata only: they are outside the
//! quota and their files are never deleted.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::hashing::{sha256_file_hex, sha256_hex};
use super::records::CacheRecord;
use super::Registry;
use crate::error::MeshError;
use crate::utils::unix_time_millis;

/// Suffix for in-progress blob writes; renamed into place once complete
const PARTIAL_SUFFIX: &str = ".partial";

pub struct ContentCache {
    root: PathBuf,
    quota_bytes: u64,
    registry: Arc<Registry>,
}

impl ContentCache {
    pub fn new(
        root: PathBuf,
        quota_bytes: u64,
        registry: Arc<Registry>,
    ) -> Result<Self, MeshError> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            quota_bytes,
            registry,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, content_hash: &str) -> PathBuf {
        self.root.join(content_hash)
    }

    /// Store a payload and return its content hash.
    ///
    /// Idempotent: identical bytes always map to the same hash and a second
    /// store neither rewrites the blob nor duplicates the row. The record is
    /// marked verified because the digest was computed here, from the bytes
    /// themselves, never trusted from a sender.
    pub fn store(&self, bytes: &[u8]) -> Result<String, MeshError> {
        let content_hash = sha256_hex(bytes);
        let now = unix_time_millis();

        if let Some(mut existing) = self.registry.cache_record(&content_hash) {
            if existing.verified {
                debug!("cache hit for {}, deduplicating store", content_hash);
                existing.last_accessed_ms = now;
                self.registry
                    .with_transaction(|txn| txn.put_cache_record(existing.clone()))?;
                return Ok(content_hash);
            }
            // Unverified leftover: fall through and rewrite it.
        }

        let final_path = self.blob_path(&content_hash);
        let partial_path = self.root.join(format!("{}{}", content_hash, PARTIAL_SUFFIX));
        fs::write(&partial_path, bytes)?;
        fs::rename(&partial_path, &final_path)?;

        let rec = CacheRecord {
            content_hash: content_hash.clone(),
            local_path: final_path.to_string_lossy().to_string(),
            size_bytes: bytes.len() as u64,
            verified: true,
            reference_count: 0,
            last_accessed_ms: now,
            managed: true,
        };
        self.registry
            .with_transaction(|txn| txn.put_cache_record(rec))?;
        debug!("stored {} byte(s) as {}", bytes.len(), content_hash);

        self.evict_if_needed()?;
        Ok(content_hash)
    }

    /// Register an existing file (e.g. a scanned driver) as a verified cache
    /// entry without copying it into the blob directory.
    ///
    /// The caller must have computed `content_hash` from the file itself.
    pub fn register_external(
        &self,
        path: &Path,
        content_hash: &str,
        size_bytes: u64,
    ) -> Result<(), MeshError> {
        let rec = CacheRecord {
            content_hash: content_hash.to_string(),
            local_path: path.to_string_lossy().to_string(),
            size_bytes,
            verified: true,
            reference_count: 0,
            last_accessed_ms: unix_time_millis(),
            managed: false,
        };
        self.registry.with_transaction(|txn| {
            // A managed blob for the same hash wins; don't downgrade it.
            if txn.cache_record(content_hash).map(|r| r.managed) == Some(true) {
                return Ok(());
            }
            txn.put_cache_record(rec.clone())
        })
    }

    /// Fetch a verified payload by content hash.
    pub fn fetch(&self, content_hash: &str) -> Result<Vec<u8>, MeshError> {
        let Some(mut rec) = self.registry.cache_record(content_hash) else {
            return Err(MeshError::NotFound);
        };
        if !rec.verified {
            warn!("refusing to serve unverified cache entry {}", content_hash);
            return Err(MeshError::NotFound);
        }

        let bytes = fs::read(&rec.local_path).map_err(|e| {
            warn!("cache blob {} unreadable: {}", rec.local_path, e);
            MeshError::NotFound
        })?;

        rec.last_accessed_ms = unix_time_millis();
        self.registry
            .with_transaction(|txn| txn.put_cache_record(rec.clone()))?;
        Ok(bytes)
    }

    /// Recompute the digest of the stored bytes and compare to the recorded
    /// hash. Used defensively by the installer before staging.
    pub fn verify(&self, content_hash: &str) -> Result<bool, MeshError> {
        let Some(mut rec) = self.registry.cache_record(content_hash) else {
            return Err(MeshError::NotFound);
        };
        let actual = sha256_file_hex(Path::new(&rec.local_path)).map_err(|e| {
            warn!("cache blob {} unreadable during verify: {}", rec.local_path, e);
            MeshError::NotFound
        })?;

        let ok = actual == content_hash;
        if rec.verified != ok {
            rec.verified = ok;
            self.registry
                .with_transaction(|txn| txn.put_cache_record(rec.clone()))?;
        }
        if !ok {
            warn!(
                "cache entry {} failed re-verification (digest {})",
                content_hash, actual
            );
        }
        Ok(ok)
    }

    /// Increment the reference count (one per installation depending on this
    /// content). Referenced entries are never evicted.
    pub fn retain(&self, content_hash: &str) -> Result<(), MeshError> {
        self.registry.with_transaction(|txn| {
            let mut rec = txn
                .cache_record(content_hash)
                .cloned()
                .ok_or(MeshError::NotFound)?;
            rec.reference_count += 1;
            txn.put_cache_record(rec)
        })
    }

    /// Decrement the reference count (uninstall).
    pub fn release(&self, content_hash: &str) -> Result<(), MeshError> {
        self.registry.with_transaction(|txn| {
            let mut rec = txn
                .cache_record(content_hash)
                .cloned()
                .ok_or(MeshError::NotFound)?;
            rec.reference_count = rec.reference_count.saturating_sub(1);
            txn.put_cache_record(rec)
        })
    }

    /// Total bytes held by managed blobs (quota accounting basis).
    pub fn managed_bytes(&self) -> u64 {
        self.registry
            .cache_records()
            .iter()
            .filter(|r| r.managed)
            .map(|r| r.size_bytes)
            .sum()
    }

    /// Evict least-recently-used zero-reference managed entries until the
    /// quota is respected. Returns the number of entries evicted.
    pub fn evict_if_needed(&self) -> Result<usize, MeshError> {
        let mut total = self.managed_bytes();
        if total <= self.quota_bytes {
            return Ok(0);
        }

        let mut candidates: Vec<CacheRecord> = self
            .registry
            .cache_records()
            .into_iter()
            .filter(|r| r.managed && r.reference_count == 0)
            .collect();
        candidates.sort_by_key(|r| r.last_accessed_ms);

        let mut evicted = 0usize;
        for rec in candidates {
            if total <= self.quota_bytes {
                break;
            }
            self.registry
                .with_transaction(|txn| txn.remove_cache_record(&rec.content_hash))?;
            if let Err(e) = fs::remove_file(&rec.local_path) {
                // Record is gone either way; an orphaned blob is re-adopted
                // (rewritten in place) if the same content is stored again.
                warn!("could not delete evicted blob {}: {}", rec.local_path, e);
            }
            total = total.saturating_sub(rec.size_bytes);
            evicted += 1;
            debug!("evicted cache entry {}", rec.content_hash);
        }

        if total > self.quota_bytes {
            info!(
                "cache remains over quota ({} > {} bytes); all remaining entries are referenced",
                total, self.quota_bytes
            );
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_quota(quota: u64) -> (tempfile::TempDir, ContentCache) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::open(dir.path().join("registry")).unwrap());
        let cache = ContentCache::new(dir.path().join("blobs"), quota, registry).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_store_is_idempotent() {
        let (_dir, cache) = cache_with_quota(u64::MAX);
        let h1 = cache.store(b"payload").unwrap();
        let h2 = cache.store(b"payload").unwrap();
        assert_eq!(h1, h2);

        // One record, one blob.
        assert_eq!(cache.registry.cache_records().len(), 1);
        let blobs = fs::read_dir(cache.root()).unwrap().count();
        assert_eq!(blobs, 1);
    }

    #[test]
    fn test_fetch_roundtrip_and_missing() {
        let (_dir, cache) = cache_with_quota(u64::MAX);
        let hash = cache.store(b"driver bytes").unwrap();
        assert_eq!(cache.fetch(&hash).unwrap(), b"driver bytes");
        assert_eq!(cache.fetch("deadbeef"), Err(MeshError::NotFound));
    }

    #[test]
    fn test_eviction_skips_referenced_entries() {
        let (_dir, cache) = cache_with_quota(8);
        let pinned = cache.store(b"pinned-payload-a").unwrap();
        cache.retain(&pinned).unwrap();

        // Over quota, but the only candidate is referenced: nothing evicted.
        assert_eq!(cache.evict_if_needed().unwrap(), 0);
        assert!(cache.registry.cache_record(&pinned).is_some());

        // A second, unreferenced entry becomes the eviction victim.
        let loose = cache.store(b"loose-payload-b").unwrap();
        assert!(cache.registry.cache_record(&loose).is_none());
        assert!(cache.registry.cache_record(&pinned).is_some());
    }

    #[test]
    fn test_verify_detects_corruption() {
        let (_dir, cache) = cache_with_quota(u64::MAX);
        let hash = cache.store(b"original").unwrap();
        assert!(cache.verify(&hash).unwrap());

        // Corrupt the blob behind the cache's back.
        let rec = cache.registry.cache_record(&hash).unwrap();
        fs::write(&rec.local_path, b"tampered").unwrap();

        assert!(!cache.verify(&hash).unwrap());
        // Now unverified, fetch refuses it.
        assert_eq!(cache.fetch(&hash), Err(MeshError::NotFound));
    }

    #[test]
    fn test_external_registration_serves_fetch() {
        let (dir, cache) = cache_with_quota(u64::MAX);
        let file = dir.path().join("gpu-driver-9-1.0.so");
        fs::write(&file, b"scanned driver").unwrap();
        let hash = sha256_hex(b"scanned driver");

        cache.register_external(&file, &hash, 14).unwrap();
        assert_eq!(cache.fetch(&hash).unwrap(), b"scanned driver");

        // External entries don't count toward the quota.
        assert_eq!(cache.managed_bytes(), 0);
    }
}
