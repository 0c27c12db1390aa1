//! Health monitor tests: staleness eviction with catalog cascade, evicted
//! row purging, and open-request expiry.

use std::sync::Arc;

use mesh_node::config::HealthConfig;
use mesh_node::node::health::HealthMonitor;
use mesh_node::storage::records::{
    CatalogEntry, NodeRecord, NodeStatus, Provenance, RequestRecord, RequestStatus,
};
use mesh_node::storage::Registry;
use mesh_node::utils::unix_time_millis;

fn node(id: &str, heartbeat_ms: u64, status: NodeStatus) -> NodeRecord {
    NodeRecord {
        node_id: id.to_string(),
        display_name: id.to_string(),
        network_address: format!("{}:7700", id),
        platform_tag: "linux-x86_64".into(),
        advertised_resource_count: 0,
        last_heartbeat_ms: heartbeat_ms,
        status,
    }
}

fn entry(name: &str, owner: &str) -> CatalogEntry {
    CatalogEntry {
        resource_name: name.to_string(),
        version: "1.0".into(),
        platform_tag: "linux-x86_64".into(),
        target_hardware_id: None,
        content_hash: format!("hash-{}-{}", name, owner),
        size_bytes: 16,
        owning_node_id: owner.to_string(),
        provenance: Provenance::UnverifiedRemote,
        created_at_ms: 1,
    }
}

fn monitor(registry: &Arc<Registry>, grace_secs: u64) -> HealthMonitor {
    HealthMonitor::new(
        registry.clone(),
        HealthConfig {
            sweep_interval_seconds: 300,
            eviction_grace_seconds: grace_secs,
            purge_grace_seconds: grace_secs,
        },
    )
}

#[test]
fn test_stale_node_past_grace_is_evicted_with_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::open(dir.path()).unwrap());
    let now = unix_time_millis();

    registry
        .with_transaction(|txn| {
            // Unheard from for two hours against a one-hour grace.
            txn.upsert_node(node("mesh-gone", now - 7_200_000, NodeStatus::Stale))?;
            txn.upsert_catalog_entry(entry("gpu", "mesh-gone"))?;
            txn.upsert_catalog_entry(entry("nic", "mesh-gone"))?;
            // A healthy peer is untouched.
            txn.upsert_node(node("mesh-fine", now, NodeStatus::Active))?;
            txn.upsert_catalog_entry(entry("gpu", "mesh-fine"))
        })
        .unwrap();

    let summary = monitor(&registry, 3600).sweep_once().unwrap();
    assert_eq!(summary.evicted_nodes, 1);
    assert_eq!(summary.removed_catalog_entries, 2);

    assert_eq!(
        registry.node("mesh-gone").unwrap().status,
        NodeStatus::Evicted
    );
    assert!(registry.catalog_for_owner("mesh-gone").is_empty());
    // Its entries are immediately unavailable to new requests.
    let hits = registry.find_catalog("gpu", "linux-x86_64", None);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].owning_node_id, "mesh-fine");
}

#[test]
fn test_stale_node_within_grace_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::open(dir.path()).unwrap());
    let now = unix_time_millis();

    registry
        .with_transaction(|txn| {
            txn.upsert_node(node("mesh-slow", now - 1_000, NodeStatus::Stale))
        })
        .unwrap();

    let summary = monitor(&registry, 3600).sweep_once().unwrap();
    assert_eq!(summary.evicted_nodes, 0);
    assert_eq!(registry.node("mesh-slow").unwrap().status, NodeStatus::Stale);
}

#[test]
fn test_evicted_node_past_second_grace_is_purged() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::open(dir.path()).unwrap());
    let now = unix_time_millis();

    registry
        .with_transaction(|txn| {
            // Old enough to clear eviction grace plus purge grace.
            txn.upsert_node(node("mesh-ghost", now - 8_000_000, NodeStatus::Evicted))
        })
        .unwrap();

    let summary = monitor(&registry, 3600).sweep_once().unwrap();
    assert_eq!(summary.purged_nodes, 1);
    assert!(registry.node("mesh-ghost").is_none());
}

#[test]
fn test_open_request_past_deadline_expires() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::open(dir.path()).unwrap());
    let now = unix_time_millis();

    registry
        .with_transaction(|txn| {
            txn.insert_request(RequestRecord {
                request_id: "r-old".into(),
                requesting_node_id: "mesh-a".into(),
                resource_name: "gpu".into(),
                target_hardware_id: None,
                platform_tag: "linux-x86_64".into(),
                created_at_ms: now - 10_000,
                expires_at_ms: now - 5_000,
                status: RequestStatus::Open,
                fulfilling_node_id: None,
            })?;
            txn.insert_request(RequestRecord {
                request_id: "r-live".into(),
                requesting_node_id: "mesh-a".into(),
                resource_name: "nic".into(),
                target_hardware_id: None,
                platform_tag: "linux-x86_64".into(),
                created_at_ms: now,
                expires_at_ms: now + 60_000,
                status: RequestStatus::Open,
                fulfilling_node_id: None,
            })
        })
        .unwrap();

    let summary = monitor(&registry, 3600).sweep_once().unwrap();
    assert_eq!(summary.expired_requests, 1);
    assert_eq!(
        registry.request("r-old").unwrap().status,
        RequestStatus::Expired
    );
    assert_eq!(
        registry.request("r-live").unwrap().status,
        RequestStatus::Open
    );
}

#[test]
fn test_sweep_on_clean_registry_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::open(dir.path()).unwrap());
    let now = unix_time_millis();
    registry
        .with_transaction(|txn| txn.upsert_node(node("mesh-a", now, NodeStatus::Active)))
        .unwrap();

    let summary = monitor(&registry, 3600).sweep_once().unwrap();
    assert_eq!(summary, Default::default());
}

#[test]
fn test_fulfilled_requests_are_not_expired() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::open(dir.path()).unwrap());
    let now = unix_time_millis();

    registry
        .with_transaction(|txn| {
            txn.insert_request(RequestRecord {
                request_id: "r-done".into(),
                requesting_node_id: "mesh-a".into(),
                resource_name: "gpu".into(),
                target_hardware_id: None,
                platform_tag: "linux-x86_64".into(),
                created_at_ms: now - 10_000,
                expires_at_ms: now - 5_000,
                status: RequestStatus::Open,
                fulfilling_node_id: None,
            })
        })
        .unwrap();
    registry
        .with_transaction(|txn| {
            txn.resolve_request("r-done", RequestStatus::Fulfilled, Some("mesh-b".into()))
        })
        .unwrap();

    let summary = monitor(&registry, 3600).sweep_once().unwrap();
    assert_eq!(summary.expired_requests, 0);
    let row = registry.request("r-done").unwrap();
    assert_eq!(row.status, RequestStatus::Fulfilled);
    assert_eq!(row.fulfilling_node_id.as_deref(), Some("mesh-b"));
}
