//! Request/fulfillment coordinator
//!
//! Accepts "this node needs resource R" calls, broadcasts them to active
//! peers, races the incoming offers against the request deadline, transfers
//! from the first usable offerer, and verifies the payload digest before
//! anything touches the cache.
//!
//! Concurrency shape:
//!
//! - Concurrent calls for the same `(resource_name, platform_tag)` coalesce
//!   onto one in-flight driver via a short-lived in-memory map; only the
//!   durable request row is authoritative state.
//! - The driver runs as its own task, so a caller abandoning its future
//!   cannot orphan an `open` request row: the driver always resolves the row
//!   to a terminal status by the deadline.
//! - At-most-one fulfillment is enforced by the registry's one-shot status
//!   transition, not by channel discipline. Offers arriving after the
//!   request went terminal find no route and are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::MeshError;
use crate::network::broadcast_to_peers;
use crate::network::protocol::{ResourceOffer, WireMessage};
use crate::network::transport::Transport;
use crate::storage::cache::ContentCache;
use crate::storage::hashing::sha256_hex;
use crate::storage::records::{Provenance, RequestRecord, RequestStatus};
use crate::storage::Registry;
use crate::utils::unix_time_millis;

/// Extra wall-clock slack granted to waiters beyond the request deadline, to
/// cover the driver's final bookkeeping
const WAITER_GRACE: Duration = Duration::from_secs(2);

/// A fulfilled resource request: the payload is in the cache under
/// `content_hash`, verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fulfillment {
    pub content_hash: String,
    pub size_bytes: u64,
    pub source_node_id: String,
}

type Outcome = Result<Fulfillment, MeshError>;
type NeedKey = (String, String);

pub struct RequestCoordinator {
    registry: Arc<Registry>,
    cache: Arc<ContentCache>,
    transport: Arc<dyn Transport>,
    node_id: String,
    network_address: String,
    max_transfer_retries: u32,
    /// In-flight de-duplication map; strictly in-memory, never persisted
    inflight: Mutex<HashMap<NeedKey, broadcast::Sender<Outcome>>>,
    /// Offer delivery routes keyed by request id
    offer_routes: Mutex<HashMap<String, mpsc::UnboundedSender<ResourceOffer>>>,
}

impl RequestCoordinator {
    pub fn new(
        registry: Arc<Registry>,
        cache: Arc<ContentCache>,
        transport: Arc<dyn Transport>,
        node_id: String,
        network_address: String,
        max_transfer_retries: u32,
    ) -> Self {
        Self {
            registry,
            cache,
            transport,
            node_id,
            network_address,
            max_transfer_retries,
            inflight: Mutex::new(HashMap::new()),
            offer_routes: Mutex::new(HashMap::new()),
        }
    }

    /// Obtain a resource, from the local catalog/cache if possible and from
    /// the mesh otherwise. Returns within `timeout` plus a small grace.
    pub async fn request_resource(
        self: &Arc<Self>,
        resource_name: &str,
        target_hardware_id: Option<String>,
        platform_tag: &str,
        timeout: Duration,
    ) -> Outcome {
        // Mandatory short-circuit: a satisfiable local entry means no
        // network round-trip and no request row at all.
        if let Some(found) =
            self.local_match(resource_name, platform_tag, target_hardware_id.as_deref())
        {
            debug!("{} satisfied locally as {}", resource_name, found.content_hash);
            return Ok(found);
        }

        let key: NeedKey = (resource_name.to_string(), platform_tag.to_string());
        let mut rx = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(tx) = inflight.get(&key) {
                debug!("coalescing onto in-flight request for {:?}", key);
                tx.subscribe()
            } else {
                let (tx, rx) = broadcast::channel(1);
                inflight.insert(key.clone(), tx.clone());

                let this = self.clone();
                let name = resource_name.to_string();
                let platform = platform_tag.to_string();
                let hardware = target_hardware_id.clone();
                tokio::spawn(async move {
                    let outcome = this.drive_request(&name, hardware, &platform, timeout).await;
                    // Remove before sending: a caller arriving after this
                    // point starts a fresh driver instead of subscribing to
                    // a channel that already fired.
                    this.inflight
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .remove(&key);
                    let _ = tx.send(outcome);
                });
                rx
            }
        };

        match tokio::time::timeout(timeout + WAITER_GRACE, rx.recv()).await {
            Ok(Ok(outcome)) => outcome,
            // Driver vanished or overran its deadline; both mean no payload
            // arrived in time.
            Ok(Err(_)) | Err(_) => Err(MeshError::TransferTimeout),
        }
    }

    /// Deliver an offer received from a peer. Offers for requests that are
    /// no longer in flight (fulfilled, expired, failed) are dropped.
    pub fn deliver_offer(&self, offer: ResourceOffer) {
        let routes = self.offer_routes.lock().unwrap_or_else(|p| p.into_inner());
        match routes.get(&offer.request_id) {
            Some(tx) => {
                let _ = tx.send(offer);
            }
            None => {
                debug!(
                    "dropping late offer from {} for request {}",
                    offer.owning_node_id, offer.request_id
                );
            }
        }
    }

    /// A matching catalog entry whose content is already present and
    /// verified locally.
    fn local_match(
        &self,
        resource_name: &str,
        platform_tag: &str,
        hardware_id: Option<&str>,
    ) -> Option<Fulfillment> {
        self.registry
            .find_catalog(resource_name, platform_tag, hardware_id)
            .into_iter()
            .find_map(|entry| {
                let rec = self.registry.cache_record(&entry.content_hash)?;
                if !rec.verified {
                    return None;
                }
                Some(Fulfillment {
                    content_hash: entry.content_hash,
                    size_bytes: rec.size_bytes,
                    source_node_id: entry.owning_node_id,
                })
            })
    }

    async fn drive_request(
        &self,
        resource_name: &str,
        target_hardware_id: Option<String>,
        platform_tag: &str,
        timeout: Duration,
    ) -> Outcome {
        // Double-check under the driver: a racing fulfillment may have
        // landed between the caller's check and this task starting.
        if let Some(found) =
            self.local_match(resource_name, platform_tag, target_hardware_id.as_deref())
        {
            return Ok(found);
        }

        let request_id = Uuid::new_v4().to_string();
        let now = unix_time_millis();
        let expires_at_ms = now + timeout.as_millis() as u64;

        self.registry.with_transaction(|txn| {
            txn.insert_request(RequestRecord {
                request_id: request_id.clone(),
                requesting_node_id: self.node_id.clone(),
                resource_name: resource_name.to_string(),
                target_hardware_id: target_hardware_id.clone(),
                platform_tag: platform_tag.to_string(),
                created_at_ms: now,
                expires_at_ms,
                status: RequestStatus::Open,
                fulfilling_node_id: None,
            })
        })?;

        let (offer_tx, offer_rx) = mpsc::unbounded_channel();
        self.offer_routes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(request_id.clone(), offer_tx);

        let outcome = self
            .race_offers(
                &request_id,
                resource_name,
                target_hardware_id.as_deref(),
                platform_tag,
                expires_at_ms,
                offer_rx,
            )
            .await;

        self.offer_routes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&request_id);

        let (status, fulfiller) = match &outcome {
            Ok(f) => (RequestStatus::Fulfilled, Some(f.source_node_id.clone())),
            Err(MeshError::NoSourceFound { .. }) => (RequestStatus::Expired, None),
            Err(_) => (RequestStatus::Failed, None),
        };
        match self
            .registry
            .with_transaction(|txn| txn.resolve_request(&request_id, status, fulfiller))
        {
            Ok(()) => {}
            Err(MeshError::Conflict(_)) => {
                // The health monitor expired the row first; its terminal
                // state stands and our outcome still reflects what happened.
                debug!("request {} already resolved elsewhere", request_id);
            }
            Err(e) => return Err(e),
        }

        outcome
    }

    async fn race_offers(
        &self,
        request_id: &str,
        resource_name: &str,
        target_hardware_id: Option<&str>,
        platform_tag: &str,
        expires_at_ms: u64,
        mut offer_rx: mpsc::UnboundedReceiver<ResourceOffer>,
    ) -> Outcome {
        let peers = self.registry.active_peers(&self.node_id);
        info!(
            "requesting {} ({}) from {} peer(s), request {}",
            resource_name,
            platform_tag,
            peers.len(),
            request_id
        );
        broadcast_to_peers(
            self.transport.clone(),
            peers,
            WireMessage::ResourceQuery {
                request_id: request_id.to_string(),
                reply_to: self.network_address.clone(),
                resource_name: resource_name.to_string(),
                platform_tag: platform_tag.to_string(),
                target_hardware_id: target_hardware_id.map(str::to_string),
            },
        );

        let mut disqualified: Vec<String> = Vec::new();
        let mut integrity_failures = 0u32;
        let mut failed_attempts = 0u32;

        loop {
            let remaining = expires_at_ms.saturating_sub(unix_time_millis());
            if remaining == 0 {
                return Err(self.deadline_outcome(
                    resource_name,
                    platform_tag,
                    disqualified,
                    integrity_failures,
                ));
            }

            let offer = match tokio::time::timeout(
                Duration::from_millis(remaining),
                offer_rx.recv(),
            )
            .await
            {
                Ok(Some(offer)) => offer,
                // Deadline reached, or the route was torn down under us.
                Ok(None) | Err(_) => {
                    return Err(self.deadline_outcome(
                        resource_name,
                        platform_tag,
                        disqualified,
                        integrity_failures,
                    ));
                }
            };

            if disqualified.contains(&offer.owning_node_id) {
                debug!("ignoring repeat offer from disqualified {}", offer.owning_node_id);
                continue;
            }
            let Some(peer) = self.registry.node(&offer.owning_node_id) else {
                debug!("offer from unknown node {}, ignoring", offer.owning_node_id);
                continue;
            };

            // Favor the first offer over source selection: payloads are
            // small and availability beats optimality.
            let remaining = expires_at_ms.saturating_sub(unix_time_millis());
            let transfer = self
                .transport
                .request(
                    &peer.network_address,
                    WireMessage::TransferRequest {
                        content_hash: offer.content_hash.clone(),
                    },
                    Duration::from_millis(remaining.max(1)),
                )
                .await;

            match transfer {
                Ok(WireMessage::TransferPayload { bytes, .. }) => {
                    let digest = sha256_hex(&bytes);
                    if digest != offer.content_hash {
                        warn!(
                            "payload from {} failed integrity check (offered {}, got {})",
                            offer.owning_node_id, offer.content_hash, digest
                        );
                        disqualified.push(offer.owning_node_id.clone());
                        integrity_failures += 1;
                        failed_attempts += 1;
                        if failed_attempts >= self.max_transfer_retries {
                            return Err(MeshError::IntegrityFailure { disqualified });
                        }
                        continue;
                    }

                    let content_hash = self.cache.store(&bytes)?;
                    self.mark_offer_verified(&offer);
                    info!(
                        "request {} fulfilled by {} ({} bytes, {})",
                        request_id,
                        offer.owning_node_id,
                        bytes.len(),
                        content_hash
                    );
                    return Ok(Fulfillment {
                        content_hash,
                        size_bytes: bytes.len() as u64,
                        source_node_id: offer.owning_node_id,
                    });
                }
                Ok(other) => {
                    debug!(
                        "transfer from {} answered {:?}, disqualifying",
                        offer.owning_node_id, other
                    );
                    disqualified.push(offer.owning_node_id.clone());
                    failed_attempts += 1;
                }
                Err(e) => {
                    debug!("transfer from {} failed: {}", offer.owning_node_id, e);
                    disqualified.push(offer.owning_node_id.clone());
                    failed_attempts += 1;
                }
            }

            if failed_attempts >= self.max_transfer_retries {
                return Err(if integrity_failures > 0 {
                    MeshError::IntegrityFailure { disqualified }
                } else {
                    MeshError::TransferTimeout
                });
            }
        }
    }

    fn deadline_outcome(
        &self,
        resource_name: &str,
        platform_tag: &str,
        disqualified: Vec<String>,
        integrity_failures: u32,
    ) -> MeshError {
        if disqualified.is_empty() {
            MeshError::NoSourceFound {
                resource_name: resource_name.to_string(),
                platform_tag: platform_tag.to_string(),
            }
        } else if integrity_failures > 0 {
            MeshError::IntegrityFailure { disqualified }
        } else {
            MeshError::TransferTimeout
        }
    }

    /// Upgrade the offerer's catalog entry to verified provenance after a
    /// transfer confirmed its digest.
    fn mark_offer_verified(&self, offer: &ResourceOffer) {
        let entry = self
            .registry
            .catalog_for_owner(&offer.owning_node_id)
            .into_iter()
            .find(|e| e.content_hash == offer.content_hash);
        let Some(entry) = entry else {
            return;
        };
        if entry.provenance != Provenance::UnverifiedRemote {
            return;
        }
        let key = entry.key();
        let result = self
            .registry
            .with_transaction(|txn| txn.set_catalog_provenance(&key, Provenance::VerifiedRemote));
        if let Err(e) = result {
            debug!("provenance upgrade for {} skipped: {}", key, e);
        }
    }
}
