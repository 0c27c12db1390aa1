//! Local resource scanner
//!
//! Walks the configured resource locations, digests each candidate file, and
//! publishes catalog entries owned by this node. The original files are also
//! registered with the content cache so peer transfers can be served without
//! copying them into the blob directory.
//!
//! Re-scanning unchanged files publishes nothing new: the upsert key
//! `(name, version, platform, owner)` already exists with the same digest.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::error::MeshError;
use crate::storage::cache::ContentCache;
use crate::storage::hashing::sha256_file_hex;
use crate::storage::records::{CatalogEntry, Provenance};
use crate::storage::Registry;
use crate::utils::unix_time_millis;

/// Fallback version when the filename carries none
const DEFAULT_VERSION: &str = "1.0";

/// Outcome of one scan pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// New catalog entries published this pass
    pub published: usize,
    /// Candidates skipped (unreadable, permission denied, or conflicting)
    pub skipped: usize,
}

pub struct ResourceScanner {
    registry: Arc<Registry>,
    cache: Arc<ContentCache>,
    config: ScannerConfig,
    node_id: String,
    platform_tag: String,
}

impl ResourceScanner {
    pub fn new(
        registry: Arc<Registry>,
        cache: Arc<ContentCache>,
        config: ScannerConfig,
        node_id: String,
        platform_tag: String,
    ) -> Self {
        Self {
            registry,
            cache,
            config,
            node_id,
            platform_tag,
        }
    }

    /// Scan all configured locations and publish what was found.
    pub fn scan_and_publish(&self) -> Result<ScanSummary, MeshError> {
        let mut summary = ScanSummary::default();
        let mut candidates = Vec::new();

        for location in &self.config.locations {
            if !location.exists() {
                debug!("resource location {} does not exist, skipping", location.display());
                continue;
            }
            collect_candidates(location, &self.config.extensions, &mut candidates, &mut summary);
        }

        for path in candidates {
            match self.publish_file(&path) {
                Ok(true) => summary.published += 1,
                Ok(false) => {}
                Err(MeshError::Conflict(msg)) => {
                    // Content changed without a version bump; peers may hold
                    // offers against the old digest, so the old row stands.
                    warn!("skipping {}: {}", path.display(), msg);
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "scan pass published {} new entr(ies), skipped {}",
            summary.published, summary.skipped
        );
        Ok(summary)
    }

    fn publish_file(&self, path: &Path) -> Result<bool, MeshError> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                warn!("cannot stat {}: {}", path.display(), e);
                return Ok(false);
            }
        };
        let content_hash = match sha256_file_hex(path) {
            Ok(h) => h,
            Err(e) => {
                warn!("cannot hash {}: {}", path.display(), e);
                return Ok(false);
            }
        };

        let (resource_name, version) = parse_name_version(path);
        let entry = CatalogEntry {
            resource_name,
            version,
            platform_tag: self.platform_tag.clone(),
            target_hardware_id: None,
            content_hash: content_hash.clone(),
            size_bytes: metadata.len(),
            owning_node_id: self.node_id.clone(),
            provenance: Provenance::Local,
            created_at_ms: unix_time_millis(),
        };

        let inserted = self
            .registry
            .with_transaction(|txn| txn.upsert_catalog_entry(entry.clone()))?;

        // Serve-side registration happens even for already-known entries so a
        // wiped cache row heals on the next pass.
        self.cache
            .register_external(path, &content_hash, metadata.len())?;

        if inserted {
            debug!(
                "published {} {} ({})",
                entry.resource_name, entry.version, content_hash
            );
        }
        Ok(inserted)
    }

    /// Periodic scan loop; also runs one pass immediately at startup.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = std::time::Duration::from_secs(self.config.scan_interval_seconds);
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let scanner = self.clone();
                    let result =
                        tokio::task::spawn_blocking(move || scanner.scan_and_publish()).await;
                    match result {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!("scan pass failed: {}", e),
                        Err(e) => warn!("scan task panicked: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

fn collect_candidates(
    dir: &Path,
    extensions: &[String],
    out: &mut Vec<PathBuf>,
    summary: &mut ScanSummary,
) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            warn!("no permission to scan {}", dir.display());
            summary.skipped += 1;
            return;
        }
        Err(e) => {
            warn!("cannot read {}: {}", dir.display(), e);
            summary.skipped += 1;
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_candidates(&path, extensions, out, summary);
        } else if has_resource_extension(&path, extensions) {
            out.push(path);
        }
    }
}

fn has_resource_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|want| want == ext))
        .unwrap_or(false)
}

/// Split `name-version.ext` into name and version.
///
/// The trailing segment is only treated as a version when it looks like one
/// (starts with a digit and contains a dot), so `gpu-driver-9.so` stays the
/// name `gpu-driver-9` at the default version.
fn parse_name_version(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unnamed");

    if let Some((name, candidate)) = stem.rsplit_once('-') {
        let looks_like_version = candidate.contains('.')
            && candidate.chars().next().is_some_and(|c| c.is_ascii_digit());
        if looks_like_version && !name.is_empty() {
            return (name.to_string(), candidate.to_string());
        }
    }
    (stem.to_string(), DEFAULT_VERSION.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_version_variants() {
        assert_eq!(
            parse_name_version(Path::new("/x/gpu-driver-9-2.1.0.so")),
            ("gpu-driver-9".to_string(), "2.1.0".to_string())
        );
        assert_eq!(
            parse_name_version(Path::new("/x/gpu-driver-9.so")),
            ("gpu-driver-9".to_string(), "1.0".to_string())
        );
        assert_eq!(
            parse_name_version(Path::new("/x/audio.ko")),
            ("audio".to_string(), "1.0".to_string())
        );
        // A dash followed by a non-version segment stays in the name.
        assert_eq!(
            parse_name_version(Path::new("/x/net-core.sys")),
            ("net-core".to_string(), "1.0".to_string())
        );
    }

    #[test]
    fn test_extension_filter() {
        let exts = vec!["so".to_string(), "ko".to_string()];
        assert!(has_resource_extension(Path::new("a/b.so"), &exts));
        assert!(has_resource_extension(Path::new("a/b.ko"), &exts));
        assert!(!has_resource_extension(Path::new("a/b.txt"), &exts));
        assert!(!has_resource_extension(Path::new("a/noext"), &exts));
    }
}
