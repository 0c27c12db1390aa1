//! Discovery and heartbeat service
//!
//! Two independent periodic loops:
//!
//! - The advertise loop refreshes this node's own row (heartbeat, resource
//!   count) and broadcasts the catalog delta since the previous
//!   advertisement to all active peers. The first pass sends the full
//!   catalog.
//! - The liveness loop probes every known, non-evicted peer. A successful
//!   probe refreshes the peer's heartbeat (and revives a stale peer); three
//!   consecutive failures mark it stale. Eviction is the health monitor's
//!   job, not this one's.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::MeshError;
use crate::identity::NodeIdentity;
use crate::network::protocol::{CatalogAnnouncement, NodeAnnouncement, WireMessage};
use crate::network::transport::Transport;
use crate::network::broadcast_to_peers;
use crate::storage::records::{NodeRecord, NodeStatus};
use crate::storage::Registry;
use crate::utils::retry::{retry_with_backoff, RetryConfig};
use crate::utils::unix_time_millis;

pub struct DiscoveryService {
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    identity: NodeIdentity,
    network_address: String,
    config: DiscoveryConfig,
    /// created_at watermark of the last advertised catalog delta
    advertise_watermark: Mutex<u64>,
    /// Consecutive probe failures per peer
    probe_failures: Mutex<HashMap<String, u32>>,
}

impl DiscoveryService {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        identity: NodeIdentity,
        network_address: String,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            identity,
            network_address,
            config,
            advertise_watermark: Mutex::new(0),
            probe_failures: Mutex::new(HashMap::new()),
        }
    }

    fn node_announcement(&self, resource_count: u64) -> NodeAnnouncement {
        NodeAnnouncement {
            node_id: self.identity.node_id.clone(),
            display_name: self.identity.display_name.clone(),
            network_address: self.network_address.clone(),
            platform_tag: self.identity.platform_tag.clone(),
            resource_count,
        }
    }

    /// One advertise pass: refresh our own row, broadcast the catalog delta.
    pub fn advertise_once(&self) -> Result<(), MeshError> {
        let now = unix_time_millis();
        let owned = self.registry.catalog_for_owner(&self.identity.node_id);

        self.registry.with_transaction(|txn| {
            txn.upsert_node(NodeRecord {
                node_id: self.identity.node_id.clone(),
                display_name: self.identity.display_name.clone(),
                network_address: self.network_address.clone(),
                platform_tag: self.identity.platform_tag.clone(),
                advertised_resource_count: owned.len() as u64,
                last_heartbeat_ms: now,
                status: NodeStatus::Active,
            })
        })?;

        let watermark = *self
            .advertise_watermark
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let delta: Vec<CatalogAnnouncement> = owned
            .iter()
            .filter(|e| e.created_at_ms >= watermark)
            .map(|e| CatalogAnnouncement {
                resource_name: e.resource_name.clone(),
                version: e.version.clone(),
                platform_tag: e.platform_tag.clone(),
                target_hardware_id: e.target_hardware_id.clone(),
                content_hash: e.content_hash.clone(),
                size_bytes: e.size_bytes,
            })
            .collect();

        let peers = self.registry.active_peers(&self.identity.node_id);
        if !peers.is_empty() {
            debug!(
                "advertising {} delta entr(ies) to {} peer(s)",
                delta.len(),
                peers.len()
            );
            broadcast_to_peers(
                self.transport.clone(),
                peers,
                WireMessage::Advertise {
                    node: self.node_announcement(owned.len() as u64),
                    catalog_delta: delta,
                },
            );
        }

        if let Some(max_created) = owned.iter().map(|e| e.created_at_ms).max() {
            *self
                .advertise_watermark
                .lock()
                .unwrap_or_else(|p| p.into_inner()) = max_created;
        }
        Ok(())
    }

    /// One liveness pass over all known non-evicted peers.
    pub async fn probe_once(self: &Arc<Self>) {
        let targets = self.registry.probe_targets(&self.identity.node_id);
        if targets.is_empty() {
            return;
        }

        let mut handles = Vec::with_capacity(targets.len());
        for peer in targets {
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                this.probe_peer(&peer).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn probe_peer(&self, peer: &NodeRecord) {
        let timeout = Duration::from_secs(self.config.probe_timeout_seconds);
        let probe = WireMessage::LivenessProbe {
            node_id: self.identity.node_id.clone(),
        };

        let outcome = self
            .transport
            .request(&peer.network_address, probe, timeout)
            .await;

        match outcome {
            Ok(WireMessage::LivenessAck { .. }) => {
                self.probe_failures
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&peer.node_id);
                let result = self
                    .registry
                    .with_transaction(|txn| txn.touch_node(&peer.node_id, unix_time_millis()));
                match result {
                    Ok(()) => debug!("probe ok for {}", peer.node_id),
                    // Row vanished mid-pass (health monitor purge); nothing to do.
                    Err(MeshError::NotFound) => {}
                    Err(e) => warn!("heartbeat update for {} failed: {}", peer.node_id, e),
                }
            }
            Ok(other) => {
                debug!("unexpected probe reply from {}: {:?}", peer.node_id, other);
                self.record_probe_failure(peer);
            }
            Err(e) => {
                debug!("probe to {} failed: {}", peer.node_id, e);
                self.record_probe_failure(peer);
            }
        }
    }

    fn record_probe_failure(&self, peer: &NodeRecord) {
        let failures = {
            let mut map = self
                .probe_failures
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            let count = map.entry(peer.node_id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if failures >= self.config.probe_failure_threshold && peer.status == NodeStatus::Active {
            info!(
                "peer {} unresponsive after {} probe(s), marking stale",
                peer.node_id, failures
            );
            let result = self
                .registry
                .with_transaction(|txn| txn.set_node_status(&peer.node_id, NodeStatus::Stale));
            if let Err(e) = result {
                if e != MeshError::NotFound {
                    warn!("could not mark {} stale: {}", peer.node_id, e);
                }
            }
        }
    }

    /// Announce ourselves to the configured bootstrap peers. Peers that are
    /// still starting up get retried with backoff; persistent failures are
    /// logged and dropped (the peer can still find us later).
    pub async fn bootstrap(&self) {
        if self.config.bootstrap_peers.is_empty() {
            return;
        }

        let owned = self.registry.catalog_for_owner(&self.identity.node_id);
        let full_catalog: Vec<CatalogAnnouncement> = owned
            .iter()
            .map(|e| CatalogAnnouncement {
                resource_name: e.resource_name.clone(),
                version: e.version.clone(),
                platform_tag: e.platform_tag.clone(),
                target_hardware_id: e.target_hardware_id.clone(),
                content_hash: e.content_hash.clone(),
                size_bytes: e.size_bytes,
            })
            .collect();
        let message = WireMessage::Advertise {
            node: self.node_announcement(owned.len() as u64),
            catalog_delta: full_catalog,
        };

        let retry = RetryConfig::network();
        for addr in &self.config.bootstrap_peers {
            let result = retry_with_backoff(&retry, || {
                let message = message.clone();
                async move { self.transport.send(addr, message).await }
            })
            .await;
            match result {
                Ok(()) => info!("announced to bootstrap peer {}", addr),
                Err(e) => warn!("bootstrap peer {} unreachable: {}", addr, e),
            }
        }
    }

    /// Periodic advertise loop.
    pub async fn run_advertise_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.advertise_interval_seconds);
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.advertise_once() {
                        warn!("advertise pass failed: {}", e);
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

    /// Periodic liveness loop.
    pub async fn run_probe_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.probe_interval_seconds);
        let mut ticker = tokio::time::interval(period);
        // The immediate first tick would probe peers we haven't even
        // advertised to yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_once().await;
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
