//! Health monitor
//!
//! One periodic sweep over the registry: stale nodes past the grace period
//! are evicted (their catalog entries go with them), evicted rows past a
//! second grace period are deleted outright, and open requests past their
//! deadline are expired. Each pass runs inside a single transaction so a
//! crash mid-sweep never leaves half-evicted state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::HealthConfig;
use crate::error::MeshError;
use crate::storage::records::{NodeStatus, RequestStatus};
use crate::storage::Registry;
use crate::utils::unix_time_millis;

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub evicted_nodes: usize,
    pub purged_nodes: usize,
    pub removed_catalog_entries: usize,
    pub expired_requests: usize,
}

pub struct HealthMonitor {
    registry: Arc<Registry>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>, config: HealthConfig) -> Self {
        Self { registry, config }
    }

    /// One sweep pass; all transitions commit atomically or not at all.
    pub fn sweep_once(&self) -> Result<SweepSummary, MeshError> {
        let now = unix_time_millis();
        let eviction_grace_ms = self.config.eviction_grace_seconds * 1000;
        let purge_grace_ms = self.config.purge_grace_seconds * 1000;

        let summary = self.registry.with_transaction(|txn| {
            let mut summary = SweepSummary::default();

            for node in txn.nodes_with_status(NodeStatus::Stale) {
                if now.saturating_sub(node.last_heartbeat_ms) > eviction_grace_ms {
                    txn.set_node_status(&node.node_id, NodeStatus::Evicted)?;
                    summary.removed_catalog_entries +=
                        txn.remove_catalog_for_owner(&node.node_id)?;
                    summary.evicted_nodes += 1;
                }
            }

            for node in txn.nodes_with_status(NodeStatus::Evicted) {
                if now.saturating_sub(node.last_heartbeat_ms) > eviction_grace_ms + purge_grace_ms
                {
                    txn.remove_node(&node.node_id)?;
                    summary.purged_nodes += 1;
                }
            }

            for request in txn.open_requests() {
                if request.expires_at_ms < now {
                    txn.resolve_request(&request.request_id, RequestStatus::Expired, None)?;
                    summary.expired_requests += 1;
                }
            }

            Ok(summary)
        })?;

        if summary != SweepSummary::default() {
            info!(
                "health sweep: {} evicted, {} purged, {} catalog entr(ies) removed, {} request(s) expired",
                summary.evicted_nodes,
                summary.purged_nodes,
                summary.removed_catalog_entries,
                summary.expired_requests
            );
        }
        Ok(summary)
    }

    /// Periodic sweep loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.sweep_interval_seconds);
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once() {
                        warn!("health sweep failed: {}", e);
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
