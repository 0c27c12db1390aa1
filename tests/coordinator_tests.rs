//! Request/fulfillment coordinator tests: bounded wait, integrity
//! rejection and retry, request coalescing, and late-offer handling.
//!
//! Peers are simulated with a stub transport that serves configured payloads
//! per address; offers are injected through the same path the message loop
//! uses.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mesh_node::network::protocol::{ResourceOffer, WireMessage};
use mesh_node::network::transport::Transport;
use mesh_node::node::coordinator::RequestCoordinator;
use mesh_node::storage::cache::ContentCache;
use mesh_node::storage::hashing::sha256_hex;
use mesh_node::storage::records::{NodeRecord, NodeStatus, RequestStatus};
use mesh_node::storage::Registry;
use mesh_node::utils::unix_time_millis;
use mesh_node::MeshError;

/// Serves a fixed payload per peer address; queries and offers are the
/// test's job to route.
#[derive(Default)]
struct StubTransport {
    payloads: Mutex<HashMap<String, Vec<u8>>>,
}

impl StubTransport {
    fn serve(&self, addr: &str, bytes: &[u8]) {
        self.payloads
            .lock()
            .unwrap()
            .insert(addr.to_string(), bytes.to_vec());
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn send(&self, _addr: &str, _message: WireMessage) -> Result<()> {
        Ok(())
    }

    async fn request(
        &self,
        addr: &str,
        message: WireMessage,
        _timeout: Duration,
    ) -> Result<WireMessage> {
        match message {
            WireMessage::TransferRequest { content_hash } => {
                match self.payloads.lock().unwrap().get(addr) {
                    Some(bytes) => Ok(WireMessage::TransferPayload {
                        content_hash,
                        bytes: bytes.clone(),
                    }),
                    None => Err(anyhow!("{} unreachable", addr)),
                }
            }
            other => Err(anyhow!("unexpected request {:?}", other)),
        }
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    registry: Arc<Registry>,
    transport: Arc<StubTransport>,
    coordinator: Arc<RequestCoordinator>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::open(dir.path().join("registry")).unwrap());
    let cache = Arc::new(
        ContentCache::new(dir.path().join("cache"), u64::MAX, registry.clone()).unwrap(),
    );
    let transport = Arc::new(StubTransport::default());
    let coordinator = Arc::new(RequestCoordinator::new(
        registry.clone(),
        cache,
        transport.clone(),
        "mesh-self".into(),
        "self-addr".into(),
        3,
    ));
    Harness {
        _dir: dir,
        registry,
        transport,
        coordinator,
    }
}

fn add_peer(registry: &Registry, id: &str) {
    registry
        .with_transaction(|txn| {
            txn.upsert_node(NodeRecord {
                node_id: id.to_string(),
                display_name: id.to_string(),
                network_address: format!("{}-addr", id),
                platform_tag: "linux-x86_64".into(),
                advertised_resource_count: 1,
                last_heartbeat_ms: unix_time_millis(),
                status: NodeStatus::Active,
            })
        })
        .unwrap();
}

/// Wait until the driver's open request row appears and return its id.
async fn open_request_id(registry: &Registry) -> String {
    for _ in 0..200 {
        let open = registry.requests_with_status(RequestStatus::Open);
        if let Some(r) = open.first() {
            return r.request_id.clone();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no open request appeared");
}

fn offer(request_id: &str, owner: &str, bytes: &[u8]) -> ResourceOffer {
    ResourceOffer {
        request_id: request_id.to_string(),
        content_hash: sha256_hex(bytes),
        size_bytes: bytes.len() as u64,
        owning_node_id: owner.to_string(),
    }
}

// ============================================================
// Bounded wait
// ============================================================

#[tokio::test]
async fn test_no_offers_expires_after_full_timeout() {
    let h = harness();
    add_peer(&h.registry, "mesh-b");

    let timeout = Duration::from_millis(400);
    let started = Instant::now();
    let result = h
        .coordinator
        .request_resource("gpu-driver-9", None, "linux-x86_64", timeout)
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(MeshError::NoSourceFound { .. })));
    // Millisecond clock granularity can shave a hair off the window.
    assert!(
        elapsed >= timeout - Duration::from_millis(50),
        "must wait out the whole window, returned after {:?}",
        elapsed
    );
    assert!(
        elapsed < timeout + Duration::from_secs(1),
        "bounded wait: returned after {:?}",
        elapsed
    );

    let expired = h.registry.requests_with_status(RequestStatus::Expired);
    assert_eq!(expired.len(), 1);
    assert!(expired[0].fulfilling_node_id.is_none());
}

// ============================================================
// Fulfillment via offers
// ============================================================

#[tokio::test]
async fn test_first_offer_wins_and_row_is_fulfilled() {
    let h = harness();
    add_peer(&h.registry, "mesh-b");
    let payload = b"the driver payload";
    h.transport.serve("mesh-b-addr", payload);

    let coordinator = h.coordinator.clone();
    let request = tokio::spawn(async move {
        coordinator
            .request_resource("gpu-driver-9", None, "linux-x86_64", Duration::from_secs(5))
            .await
    });

    let request_id = open_request_id(&h.registry).await;
    h.coordinator
        .deliver_offer(offer(&request_id, "mesh-b", payload));

    let fulfillment = request.await.unwrap().unwrap();
    assert_eq!(fulfillment.content_hash, sha256_hex(payload));
    assert_eq!(fulfillment.source_node_id, "mesh-b");

    let row = h.registry.request(&request_id).unwrap();
    assert_eq!(row.status, RequestStatus::Fulfilled);
    assert_eq!(row.fulfilling_node_id.as_deref(), Some("mesh-b"));
}

#[tokio::test]
async fn test_concurrent_offers_yield_one_fulfillment() {
    let h = harness();
    let payload = b"contested payload";
    for i in 0..6 {
        let id = format!("mesh-p{}", i);
        add_peer(&h.registry, &id);
        h.transport.serve(&format!("{}-addr", id), payload);
    }

    let coordinator = h.coordinator.clone();
    let request = tokio::spawn(async move {
        coordinator
            .request_resource("gpu-driver-9", None, "linux-x86_64", Duration::from_secs(5))
            .await
    });

    let request_id = open_request_id(&h.registry).await;
    // All six peers answer at once.
    for i in 0..6 {
        h.coordinator
            .deliver_offer(offer(&request_id, &format!("mesh-p{}", i), payload));
    }

    let fulfillment = request.await.unwrap().unwrap();
    let row = h.registry.request(&request_id).unwrap();
    assert_eq!(row.status, RequestStatus::Fulfilled);
    assert_eq!(
        row.fulfilling_node_id.as_deref(),
        Some(fulfillment.source_node_id.as_str())
    );
    // Exactly one fulfillment record, one cached copy.
    assert_eq!(
        h.registry
            .requests_with_status(RequestStatus::Fulfilled)
            .len(),
        1
    );
    assert_eq!(h.registry.cache_records().len(), 1);
}

#[tokio::test]
async fn test_late_offer_after_fulfillment_is_dropped() {
    let h = harness();
    add_peer(&h.registry, "mesh-b");
    add_peer(&h.registry, "mesh-c");
    let payload = b"payload";
    h.transport.serve("mesh-b-addr", payload);
    h.transport.serve("mesh-c-addr", payload);

    let coordinator = h.coordinator.clone();
    let request = tokio::spawn(async move {
        coordinator
            .request_resource("gpu-driver-9", None, "linux-x86_64", Duration::from_secs(5))
            .await
    });

    let request_id = open_request_id(&h.registry).await;
    h.coordinator
        .deliver_offer(offer(&request_id, "mesh-b", payload));
    request.await.unwrap().unwrap();

    // The slow peer answers after the request went terminal.
    h.coordinator
        .deliver_offer(offer(&request_id, "mesh-c", payload));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let row = h.registry.request(&request_id).unwrap();
    assert_eq!(row.fulfilling_node_id.as_deref(), Some("mesh-b"));
    assert_eq!(
        h.registry
            .requests_with_status(RequestStatus::Fulfilled)
            .len(),
        1
    );
}

// ============================================================
// Integrity rejection and retry
// ============================================================

#[tokio::test]
async fn test_corrupt_source_is_disqualified_then_good_source_wins() {
    let h = harness();
    add_peer(&h.registry, "mesh-liar");
    add_peer(&h.registry, "mesh-honest");
    let good = b"genuine driver bytes";
    // The liar offers the genuine hash but serves different bytes.
    h.transport.serve("mesh-liar-addr", b"corrupted bytes!");
    h.transport.serve("mesh-honest-addr", good);

    let coordinator = h.coordinator.clone();
    let request = tokio::spawn(async move {
        coordinator
            .request_resource("gpu-driver-9", None, "linux-x86_64", Duration::from_secs(5))
            .await
    });

    let request_id = open_request_id(&h.registry).await;
    h.coordinator
        .deliver_offer(offer(&request_id, "mesh-liar", good));
    h.coordinator
        .deliver_offer(offer(&request_id, "mesh-honest", good));

    let fulfillment = request.await.unwrap().unwrap();
    assert_eq!(fulfillment.source_node_id, "mesh-honest");
    assert_eq!(fulfillment.content_hash, sha256_hex(good));

    let row = h.registry.request(&request_id).unwrap();
    assert_eq!(row.fulfilling_node_id.as_deref(), Some("mesh-honest"));
}

#[tokio::test]
async fn test_all_corrupt_sources_fail_with_integrity_failure() {
    let h = harness();
    let good = b"genuine driver bytes";
    for i in 0..3 {
        let id = format!("mesh-liar{}", i);
        add_peer(&h.registry, &id);
        h.transport
            .serve(&format!("{}-addr", id), format!("junk {}", i).as_bytes());
    }

    let coordinator = h.coordinator.clone();
    let request = tokio::spawn(async move {
        coordinator
            .request_resource("gpu-driver-9", None, "linux-x86_64", Duration::from_secs(5))
            .await
    });

    let request_id = open_request_id(&h.registry).await;
    for i in 0..3 {
        h.coordinator
            .deliver_offer(offer(&request_id, &format!("mesh-liar{}", i), good));
    }

    let err = request.await.unwrap().unwrap_err();
    match err {
        MeshError::IntegrityFailure { disqualified } => {
            assert_eq!(disqualified.len(), 3);
        }
        other => panic!("expected IntegrityFailure, got {:?}", other),
    }

    // Failed, not expired: sources existed but none delivered clean bytes.
    let row = h.registry.request(&request_id).unwrap();
    assert_eq!(row.status, RequestStatus::Failed);
    assert!(row.fulfilling_node_id.is_none());
    // Nothing corrupt ever reached the cache.
    assert!(h.registry.cache_records().is_empty());
}

// ============================================================
// Local short-circuit and coalescing
// ============================================================

#[tokio::test]
async fn test_cached_resource_short_circuits_without_request_row() {
    let h = harness();
    add_peer(&h.registry, "mesh-b");
    let payload = b"already here";
    h.transport.serve("mesh-b-addr", payload);

    // The peer's advertised entry, as the advertise path would record it.
    h.registry
        .with_transaction(|txn| {
            txn.upsert_catalog_entry(mesh_node::CatalogEntry {
                resource_name: "gpu-driver-9".into(),
                version: "1.0".into(),
                platform_tag: "linux-x86_64".into(),
                target_hardware_id: None,
                content_hash: sha256_hex(payload),
                size_bytes: payload.len() as u64,
                owning_node_id: "mesh-b".into(),
                provenance: mesh_node::Provenance::UnverifiedRemote,
                created_at_ms: unix_time_millis(),
            })
        })
        .unwrap();

    // First fetch goes to the mesh: the entry is known but its content is
    // not cached locally yet.
    let coordinator = h.coordinator.clone();
    let request = tokio::spawn(async move {
        coordinator
            .request_resource("gpu-driver-9", None, "linux-x86_64", Duration::from_secs(5))
            .await
    });
    let request_id = open_request_id(&h.registry).await;
    h.coordinator
        .deliver_offer(offer(&request_id, "mesh-b", payload));
    request.await.unwrap().unwrap();

    // Second fetch is satisfied locally: no new request row appears.
    let before = h.registry.requests_with_status(RequestStatus::Fulfilled).len()
        + h.registry.requests_with_status(RequestStatus::Open).len();
    let again = h
        .coordinator
        .request_resource("gpu-driver-9", None, "linux-x86_64", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(again.content_hash, sha256_hex(payload));
    let after = h.registry.requests_with_status(RequestStatus::Fulfilled).len()
        + h.registry.requests_with_status(RequestStatus::Open).len();
    assert_eq!(before, after, "no network round-trip for a cached need");
}

#[tokio::test]
async fn test_concurrent_calls_coalesce_to_one_request_row() {
    let h = harness();
    add_peer(&h.registry, "mesh-b");

    let timeout = Duration::from_millis(400);
    let c1 = h.coordinator.clone();
    let c2 = h.coordinator.clone();
    let (r1, r2) = tokio::join!(
        c1.request_resource("gpu-driver-9", None, "linux-x86_64", timeout),
        c2.request_resource("gpu-driver-9", None, "linux-x86_64", timeout),
    );

    assert!(matches!(r1, Err(MeshError::NoSourceFound { .. })));
    assert!(matches!(r2, Err(MeshError::NoSourceFound { .. })));

    // One broadcast, one row: the second caller piggybacked on the first.
    let all = h.registry.requests_with_status(RequestStatus::Expired);
    assert_eq!(all.len(), 1, "duplicate broadcasts must be coalesced");
}

#[tokio::test]
async fn test_different_needs_do_not_coalesce() {
    let h = harness();
    add_peer(&h.registry, "mesh-b");

    let timeout = Duration::from_millis(300);
    let c1 = h.coordinator.clone();
    let c2 = h.coordinator.clone();
    let (r1, r2) = tokio::join!(
        c1.request_resource("gpu-driver-9", None, "linux-x86_64", timeout),
        c2.request_resource("nic-driver-2", None, "linux-x86_64", timeout),
    );
    assert!(r1.is_err());
    assert!(r2.is_err());
    assert_eq!(
        h.registry.requests_with_status(RequestStatus::Expired).len(),
        2
    );
}
