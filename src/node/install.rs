//! Installation pipeline
//!
//! Applies a cached, verified resource to the local system:
//! stage -> apply -> record. Staging copies the blob into the staging
//! directory; apply writes a temporary file next to the target and renames
//! it into place, so the original target is untouched unless the final
//! rename succeeds. Any failure after staging rolls the staged copy back.
//!
//! The verified precondition is re-checked here with a full digest
//! recomputation even though the cache should already guarantee it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::MeshError;
use crate::storage::cache::ContentCache;
use crate::storage::records::{InstallRecord, InstallStatus};
use crate::storage::Registry;
use crate::utils::unix_time_millis;

pub struct InstallPipeline {
    registry: Arc<Registry>,
    cache: Arc<ContentCache>,
    node_id: String,
    staging_dir: PathBuf,
}

impl InstallPipeline {
    pub fn new(
        registry: Arc<Registry>,
        cache: Arc<ContentCache>,
        node_id: String,
        staging_dir: PathBuf,
    ) -> Result<Self, MeshError> {
        fs::create_dir_all(&staging_dir)?;
        Ok(Self {
            registry,
            cache,
            node_id,
            staging_dir,
        })
    }

    /// Install a cached resource at `target_path` and record the outcome.
    ///
    /// I/O failures during staging or apply are reported through the
    /// returned record's status (`Failed` / `RolledBack`), not as errors;
    /// an unverified or corrupted cache entry is rejected up front with an
    /// error and no record.
    pub fn install(
        &self,
        content_hash: &str,
        resource_name: &str,
        target_path: &Path,
    ) -> Result<InstallRecord, MeshError> {
        let cache_rec = self
            .registry
            .cache_record(content_hash)
            .ok_or(MeshError::NotFound)?;

        // Hard precondition, checked defensively with a recomputed digest.
        if !cache_rec.verified || !self.cache.verify(content_hash)? {
            warn!(
                "refusing to install unverified cache entry {} for {}",
                content_hash, resource_name
            );
            return Err(MeshError::conflict(format!(
                "cache entry {} is not verified",
                content_hash
            )));
        }

        let staged = self
            .staging_dir
            .join(format!("{}.{}.staged", content_hash, Uuid::new_v4().simple()));

        if let Err(e) = fs::copy(&cache_rec.local_path, &staged) {
            warn!("staging {} failed: {}", resource_name, e);
            return self.record(resource_name, content_hash, target_path, InstallStatus::Failed);
        }

        match self.apply(&staged, target_path) {
            Ok(()) => {
                let _ = fs::remove_file(&staged);
                self.cache.retain(content_hash)?;
                info!(
                    "installed {} ({}) at {}",
                    resource_name,
                    content_hash,
                    target_path.display()
                );
                self.record(resource_name, content_hash, target_path, InstallStatus::Success)
            }
            Err(e) => {
                warn!(
                    "apply of {} to {} failed, rolling back: {}",
                    resource_name,
                    target_path.display(),
                    e
                );
                let _ = fs::remove_file(&staged);
                self.record(resource_name, content_hash, target_path, InstallStatus::RolledBack)
            }
        }
    }

    /// Move the staged copy into place without ever exposing a partial
    /// target: write next to the target, then rename.
    fn apply(&self, staged: &Path, target_path: &Path) -> std::io::Result<()> {
        let parent = target_path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent)?;

        let partial = parent.join(format!(
            ".{}.partial",
            target_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "resource".to_string())
        ));
        fs::copy(staged, &partial)?;

        if let Err(e) = fs::rename(&partial, target_path) {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
        Ok(())
    }

    fn record(
        &self,
        resource_name: &str,
        content_hash: &str,
        target_path: &Path,
        status: InstallStatus,
    ) -> Result<InstallRecord, MeshError> {
        let rec = InstallRecord {
            record_id: Uuid::new_v4().to_string(),
            node_id: self.node_id.clone(),
            resource_name: resource_name.to_string(),
            content_hash: content_hash.to_string(),
            install_path: target_path.to_string_lossy().to_string(),
            installed_at_ms: unix_time_millis(),
            status,
        };
        self.registry
            .with_transaction(|txn| txn.record_install(rec.clone()))?;
        Ok(rec)
    }
}
