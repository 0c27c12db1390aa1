//! Mesh node orchestration
//!
//! Wires the registry, cache, scanner, discovery, coordinator, health
//! monitor, and installer together, runs the inbound message loop, and owns
//! the lifecycle of the periodic service tasks.

pub mod coordinator;
pub mod discovery;
pub mod health;
pub mod install;
pub mod scanner;

use anyhow::{bail, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::identity::NodeIdentity;
use crate::network::protocol::{CatalogAnnouncement, NodeAnnouncement, WireMessage};
use crate::network::tcp_transport::{self, TcpTransport};
use crate::network::transport::{InboundEnvelope, InboundReceiver, InboundSender, Transport};
use crate::storage::cache::ContentCache;
use crate::storage::records::{
    CatalogEntry, InstallRecord, NodeRecord, NodeStatus, Provenance,
};
use crate::storage::Registry;
use crate::utils::unix_time_millis;

use coordinator::{Fulfillment, RequestCoordinator};
use discovery::DiscoveryService;
use health::HealthMonitor;
use install::InstallPipeline;
use scanner::{ResourceScanner, ScanSummary};

/// Point-in-time mesh summary for the local operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshStatus {
    pub node_id: String,
    pub active_nodes: usize,
    pub total_resources: usize,
    pub local_resources: usize,
    pub cache_path: String,
}

/// Shared handles the message loop dispatches against.
struct NodeContext {
    registry: Arc<Registry>,
    cache: Arc<ContentCache>,
    coordinator: Arc<RequestCoordinator>,
    transport: Arc<dyn Transport>,
    identity: NodeIdentity,
    network_address: String,
}

impl NodeContext {
    fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    /// Advertisement carrying this node's full catalog; sent when a peer
    /// introduces itself, so late joiners don't miss entries older than the
    /// periodic delta watermark.
    fn full_catalog_advertisement(&self) -> WireMessage {
        let owned = self.registry.catalog_for_owner(self.node_id());
        WireMessage::Advertise {
            node: NodeAnnouncement {
                node_id: self.identity.node_id.clone(),
                display_name: self.identity.display_name.clone(),
                network_address: self.network_address.clone(),
                platform_tag: self.identity.platform_tag.clone(),
                resource_count: owned.len() as u64,
            },
            catalog_delta: owned
                .iter()
                .map(|e| CatalogAnnouncement {
                    resource_name: e.resource_name.clone(),
                    version: e.version.clone(),
                    platform_tag: e.platform_tag.clone(),
                    target_hardware_id: e.target_hardware_id.clone(),
                    content_hash: e.content_hash.clone(),
                    size_bytes: e.size_bytes,
                })
                .collect(),
        }
    }
}

/// One mesh participant.
pub struct MeshNode {
    config: MeshConfig,
    identity: NodeIdentity,
    registry: Arc<Registry>,
    cache: Arc<ContentCache>,
    coordinator: Arc<RequestCoordinator>,
    scanner: Arc<ResourceScanner>,
    discovery: Arc<DiscoveryService>,
    health: Arc<HealthMonitor>,
    installer: Arc<InstallPipeline>,
    transport: Arc<dyn Transport>,
    inbound: Option<InboundReceiver>,
    /// Set when this node serves its own TCP listener
    tcp_inbound: Option<InboundSender>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshNode {
    /// Build a node over an externally-supplied transport and inbox.
    pub fn new(
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        inbound: InboundReceiver,
    ) -> Result<Self> {
        config.validate()?;

        let mut identity = NodeIdentity::load_or_derive(&config.data_dir);
        if let Some(name) = &config.display_name {
            identity.display_name = name.clone();
        }
        info!(
            "mesh node {} ({}) at {}",
            identity.node_id, identity.display_name, config.network_address
        );

        let registry = Arc::new(Registry::open(config.registry_path())?);
        let cache = Arc::new(ContentCache::new(
            config.cache_dir(),
            config.cache.quota_bytes,
            registry.clone(),
        )?);
        let coordinator = Arc::new(RequestCoordinator::new(
            registry.clone(),
            cache.clone(),
            transport.clone(),
            identity.node_id.clone(),
            config.network_address.clone(),
            config.transfer.max_transfer_retries,
        ));
        let scanner = Arc::new(ResourceScanner::new(
            registry.clone(),
            cache.clone(),
            config.scanner.clone(),
            identity.node_id.clone(),
            identity.platform_tag.clone(),
        ));
        let discovery = Arc::new(DiscoveryService::new(
            registry.clone(),
            transport.clone(),
            identity.clone(),
            config.network_address.clone(),
            config.discovery.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(registry.clone(), config.health.clone()));
        let installer = Arc::new(InstallPipeline::new(
            registry.clone(),
            cache.clone(),
            identity.node_id.clone(),
            config.staging_dir(),
        )?);

        // Register our own row up front so status queries work before the
        // first advertise tick.
        registry.with_transaction(|txn| {
            txn.upsert_node(NodeRecord {
                node_id: identity.node_id.clone(),
                display_name: identity.display_name.clone(),
                network_address: config.network_address.clone(),
                platform_tag: identity.platform_tag.clone(),
                advertised_resource_count: 0,
                last_heartbeat_ms: unix_time_millis(),
                status: NodeStatus::Active,
            })
        })?;

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            identity,
            registry,
            cache,
            coordinator,
            scanner,
            discovery,
            health,
            installer,
            transport,
            inbound: Some(inbound),
            tcp_inbound: None,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Build a node that listens for peers over TCP at
    /// `config.listen_addr`.
    pub fn with_tcp(config: MeshConfig) -> Result<Self> {
        if config.listen_addr.is_none() {
            bail!("listen_addr is required for a TCP mesh node");
        }
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut node = Self::new(config, Arc::new(TcpTransport::new()), inbound_rx)?;
        node.tcp_inbound = Some(inbound_tx);
        Ok(node)
    }

    /// Start the message loop and all periodic services.
    pub async fn start(&mut self) -> Result<()> {
        let Some(mut inbound) = self.inbound.take() else {
            bail!("node already started");
        };

        if let (Some(inbound_tx), Some(listen_addr)) =
            (self.tcp_inbound.clone(), self.config.listen_addr)
        {
            let shutdown = self.shutdown_tx.subscribe();
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = tcp_transport::serve(listen_addr, inbound_tx, shutdown).await {
                    warn!("mesh listener failed: {}", e);
                }
            }));
        }

        let context = Arc::new(NodeContext {
            registry: self.registry.clone(),
            cache: self.cache.clone(),
            coordinator: self.coordinator.clone(),
            transport: self.transport.clone(),
            identity: self.identity.clone(),
            network_address: self.config.network_address.clone(),
        });
        let mut shutdown = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = inbound.recv() => {
                        match envelope {
                            Some(envelope) => handle_message(&context, envelope).await,
                            None => return,
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }));

        self.tasks.push(tokio::spawn(
            self.scanner.clone().run(self.shutdown_tx.subscribe()),
        ));
        self.tasks.push(tokio::spawn(
            self.discovery
                .clone()
                .run_advertise_loop(self.shutdown_tx.subscribe()),
        ));
        self.tasks.push(tokio::spawn(
            self.discovery
                .clone()
                .run_probe_loop(self.shutdown_tx.subscribe()),
        ));
        self.tasks.push(tokio::spawn(
            self.health.clone().run(self.shutdown_tx.subscribe()),
        ));

        let discovery = self.discovery.clone();
        self.tasks.push(tokio::spawn(async move {
            discovery.bootstrap().await;
        }));

        info!("mesh node {} started", self.identity.node_id);
        Ok(())
    }

    /// Signal shutdown and wait for the service tasks to wind down.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Err(e) = self.registry.flush() {
            warn!("registry flush on shutdown failed: {}", e);
        }
        info!("mesh node {} stopped", self.identity.node_id);
    }

    /// Obtain a resource from the mesh (or locally, when already present).
    ///
    /// `platform_tag` defaults to this node's platform, `timeout` to the
    /// configured default.
    pub async fn request_resource(
        &self,
        resource_name: &str,
        target_hardware_id: Option<String>,
        platform_tag: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Fulfillment, MeshError> {
        let platform = platform_tag.unwrap_or(&self.identity.platform_tag);
        let timeout = timeout.unwrap_or_else(|| self.config.default_request_timeout());
        self.coordinator
            .request_resource(resource_name, target_hardware_id, platform, timeout)
            .await
    }

    /// Obtain a resource and install it at `target_path`.
    pub async fn request_and_install(
        &self,
        resource_name: &str,
        target_hardware_id: Option<String>,
        platform_tag: Option<&str>,
        timeout: Option<Duration>,
        target_path: &Path,
    ) -> Result<InstallRecord, MeshError> {
        let fulfillment = self
            .request_resource(resource_name, target_hardware_id, platform_tag, timeout)
            .await?;
        self.installer
            .install(&fulfillment.content_hash, resource_name, target_path)
    }

    /// Trigger an immediate local rescan instead of waiting for the timer.
    pub async fn scan_and_publish(&self) -> Result<ScanSummary, MeshError> {
        let scanner = self.scanner.clone();
        tokio::task::spawn_blocking(move || scanner.scan_and_publish())
            .await
            .map_err(|e| MeshError::storage(format!("scan task panicked: {}", e)))?
    }

    /// Announce this node to a peer address right away (e.g. one learned
    /// from an external rendezvous mechanism after startup).
    pub async fn add_peer(&self, address: &str) -> Result<()> {
        let owned = self.registry.catalog_for_owner(&self.identity.node_id);
        let message = WireMessage::Advertise {
            node: NodeAnnouncement {
                node_id: self.identity.node_id.clone(),
                display_name: self.identity.display_name.clone(),
                network_address: self.config.network_address.clone(),
                platform_tag: self.identity.platform_tag.clone(),
                resource_count: owned.len() as u64,
            },
            catalog_delta: owned
                .iter()
                .map(|e| CatalogAnnouncement {
                    resource_name: e.resource_name.clone(),
                    version: e.version.clone(),
                    platform_tag: e.platform_tag.clone(),
                    target_hardware_id: e.target_hardware_id.clone(),
                    content_hash: e.content_hash.clone(),
                    size_bytes: e.size_bytes,
                })
                .collect(),
        };
        self.transport.send(address, message).await
    }

    /// Current mesh summary.
    pub fn mesh_status(&self) -> MeshStatus {
        let catalog = self.registry.catalog_entries();
        MeshStatus {
            node_id: self.identity.node_id.clone(),
            active_nodes: self.registry.nodes_with_status(NodeStatus::Active).len(),
            total_resources: catalog.len(),
            local_resources: catalog
                .iter()
                .filter(|e| e.owning_node_id == self.identity.node_id)
                .count(),
            cache_path: self.cache.root().to_string_lossy().to_string(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    /// One health sweep on demand (normally driven by the periodic loop).
    pub fn sweep_now(&self) -> Result<health::SweepSummary, MeshError> {
        self.health.sweep_once()
    }
}

/// Dispatch one inbound message.
async fn handle_message(context: &Arc<NodeContext>, envelope: InboundEnvelope) {
    match envelope.message {
        WireMessage::Advertise {
            node,
            catalog_delta,
        } => {
            if node.node_id == context.node_id() {
                return;
            }
            let first_contact = context.registry.node(&node.node_id).is_none();
            let peer_address = node.network_address.clone();
            if let Err(e) = accept_advertisement(context, node, catalog_delta) {
                warn!("rejecting advertisement: {}", e);
                return;
            }
            // A peer we just met gets our full catalog in return; the
            // periodic delta only carries what's new since the watermark.
            if first_contact {
                let message = context.full_catalog_advertisement();
                let transport = context.transport.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.send(&peer_address, message).await {
                        debug!("introduction reply to {} failed: {}", peer_address, e);
                    }
                });
            }
        }

        WireMessage::LivenessProbe { node_id } => {
            debug!("liveness probe from {}", node_id);
            if let Some(reply) = envelope.reply {
                let _ = reply.send(WireMessage::LivenessAck {
                    node_id: context.node_id().to_string(),
                    timestamp_ms: unix_time_millis(),
                });
            }
        }

        WireMessage::ResourceQuery {
            request_id,
            reply_to,
            resource_name,
            platform_tag,
            target_hardware_id,
        } => {
            answer_query(
                context,
                request_id,
                reply_to,
                resource_name,
                platform_tag,
                target_hardware_id,
            );
        }

        WireMessage::ResourceOffer(offer) => {
            context.coordinator.deliver_offer(offer);
        }

        WireMessage::TransferRequest { content_hash } => {
            let reply_message = match context.cache.fetch(&content_hash) {
                Ok(bytes) => WireMessage::TransferPayload {
                    content_hash,
                    bytes,
                },
                Err(_) => WireMessage::TransferNotFound { content_hash },
            };
            if let Some(reply) = envelope.reply {
                let _ = reply.send(reply_message);
            }
        }

        // Unsolicited acks and payloads have no standalone meaning.
        WireMessage::LivenessAck { .. }
        | WireMessage::TransferPayload { .. }
        | WireMessage::TransferNotFound { .. } => {}
    }
}

/// Record a peer's advertisement: its node row plus its catalog delta.
///
/// A changed hash for an existing owner row means the owner re-published
/// that resource; the newest advertisement is authoritative for its owner,
/// so the old row is replaced.
fn accept_advertisement(
    context: &Arc<NodeContext>,
    node: NodeAnnouncement,
    catalog_delta: Vec<CatalogAnnouncement>,
) -> Result<(), MeshError> {
    let now = unix_time_millis();
    debug!(
        "advertisement from {} with {} entr(ies)",
        node.node_id,
        catalog_delta.len()
    );

    context.registry.with_transaction(|txn| {
        txn.upsert_node(NodeRecord {
            node_id: node.node_id.clone(),
            display_name: node.display_name.clone(),
            network_address: node.network_address.clone(),
            platform_tag: node.platform_tag.clone(),
            advertised_resource_count: node.resource_count,
            last_heartbeat_ms: now,
            status: NodeStatus::Active,
        })?;

        for announced in &catalog_delta {
            let entry = CatalogEntry {
                resource_name: announced.resource_name.clone(),
                version: announced.version.clone(),
                platform_tag: announced.platform_tag.clone(),
                target_hardware_id: announced.target_hardware_id.clone(),
                content_hash: announced.content_hash.clone(),
                size_bytes: announced.size_bytes,
                owning_node_id: node.node_id.clone(),
                provenance: Provenance::UnverifiedRemote,
                created_at_ms: now,
            };
            let key = entry.key();
            if let Some(existing) = txn.catalog_entry(&key) {
                if existing.content_hash != entry.content_hash {
                    txn.remove_catalog_entry(&key)?;
                    txn.upsert_catalog_entry(entry)?;
                }
            } else {
                txn.upsert_catalog_entry(entry)?;
            }
        }
        Ok(())
    })
}

/// Answer a peer's resource query with an offer when this node owns a
/// matching, locally-present entry.
fn answer_query(
    context: &Arc<NodeContext>,
    request_id: String,
    reply_to: String,
    resource_name: String,
    platform_tag: String,
    target_hardware_id: Option<String>,
) {
    let owned_match = context
        .registry
        .find_catalog(&resource_name, &platform_tag, target_hardware_id.as_deref())
        .into_iter()
        .find(|e| {
            e.owning_node_id == context.node_id()
                && context
                    .registry
                    .cache_record(&e.content_hash)
                    .map(|r| r.verified)
                    .unwrap_or(false)
        });

    let Some(entry) = owned_match else {
        debug!("no local match for query {} ({})", resource_name, platform_tag);
        return;
    };

    let offer = WireMessage::ResourceOffer(crate::network::protocol::ResourceOffer {
        request_id,
        content_hash: entry.content_hash,
        size_bytes: entry.size_bytes,
        owning_node_id: context.node_id().to_string(),
    });
    let transport = context.transport.clone();
    tokio::spawn(async move {
        if let Err(e) = transport.send(&reply_to, offer).await {
            debug!("offer delivery to {} failed: {}", reply_to, e);
        }
    });
}
