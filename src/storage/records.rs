//! Registry row types
//!
//! The five entity types the registry owns. Rows are persisted as JSON under
//! prefixed keys in a single tree; the key helpers here define those prefixes
//! and the composite uniqueness keys.

use serde::{Deserialize, Serialize};

/// Stable node identifier, globally unique within the mesh.
pub type NodeId = String;

/// Key prefixes within the registry tree. One tree for all entity types so a
/// single batch commit is atomic across them.
pub const NODE_PREFIX: &str = "node/";
pub const CATALOG_PREFIX: &str = "catalog/";
pub const REQUEST_PREFIX: &str = "request/";
pub const CACHE_PREFIX: &str = "cache/";
pub const INSTALL_PREFIX: &str = "install/";

/// Node liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Stale,
    Evicted,
}

/// One mesh participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub display_name: String,
    pub network_address: String,
    pub platform_tag: String,
    pub advertised_resource_count: u64,
    /// Unix millis; monotonically non-decreasing while the row exists
    pub last_heartbeat_ms: u64,
    pub status: NodeStatus,
}

impl NodeRecord {
    pub fn key(node_id: &str) -> String {
        format!("{}{}", NODE_PREFIX, node_id)
    }
}

/// Where a catalog entry's content claim came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Scanned from this machine; digest computed locally
    Local,
    /// Advertised by a peer and since confirmed by a verified transfer
    VerifiedRemote,
    /// Advertised by a peer, digest not yet confirmed
    UnverifiedRemote,
}

/// One advertised (or locally scanned) unit of installable content.
///
/// Never mutated in place; a version bump creates a new row. Removed when
/// the owning node is evicted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub resource_name: String,
    pub version: String,
    pub platform_tag: String,
    /// None means "any hardware"
    pub target_hardware_id: Option<String>,
    pub content_hash: String,
    pub size_bytes: u64,
    pub owning_node_id: NodeId,
    pub provenance: Provenance,
    pub created_at_ms: u64,
}

impl CatalogEntry {
    /// Uniqueness key: (resource_name, version, platform_tag, owning_node_id).
    pub fn key(&self) -> String {
        Self::key_for(
            &self.resource_name,
            &self.version,
            &self.platform_tag,
            &self.owning_node_id,
        )
    }

    pub fn key_for(name: &str, version: &str, platform: &str, owner: &str) -> String {
        format!("{}{}|{}|{}|{}", CATALOG_PREFIX, name, version, platform, owner)
    }

    /// Whether this entry satisfies a query for (name, platform, hardware).
    pub fn matches(&self, name: &str, platform: &str, hardware_id: Option<&str>) -> bool {
        if self.resource_name != name || self.platform_tag != platform {
            return false;
        }
        match (hardware_id, self.target_hardware_id.as_deref()) {
            // Entry targets any hardware, or the caller doesn't care
            (_, None) | (None, _) => true,
            (Some(wanted), Some(target)) => wanted == target,
        }
    }
}

/// Request lifecycle status. `Open` transitions at most once, to one of the
/// terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    Fulfilled,
    Expired,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// An open or resolved need for a resource. Never resurrected once terminal;
/// a retry creates a new request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub requesting_node_id: NodeId,
    pub resource_name: String,
    pub target_hardware_id: Option<String>,
    pub platform_tag: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub status: RequestStatus,
    /// Set iff status is Fulfilled
    pub fulfilling_node_id: Option<NodeId>,
}

impl RequestRecord {
    pub fn key(request_id: &str) -> String {
        format!("{}{}", REQUEST_PREFIX, request_id)
    }
}

/// A verified local copy of resource content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub content_hash: String,
    pub local_path: String,
    pub size_bytes: u64,
    /// True only after the digest of the bytes at `local_path` was computed
    /// locally and matched `content_hash`
    pub verified: bool,
    pub reference_count: u64,
    pub last_accessed_ms: u64,
    /// False for scanner-registered originals living outside the blob
    /// directory; those are exempt from quota accounting and eviction
    pub managed: bool,
}

impl CacheRecord {
    pub fn key(content_hash: &str) -> String {
        format!("{}{}", CACHE_PREFIX, content_hash)
    }
}

/// Installation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Success,
    Failed,
    RolledBack,
}

/// The outcome of applying a cached resource locally. Immutable once
/// written; a re-install appends a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallRecord {
    /// Unique record id (installs are history, not state)
    pub record_id: String,
    pub node_id: NodeId,
    pub resource_name: String,
    pub content_hash: String,
    pub install_path: String,
    pub installed_at_ms: u64,
    pub status: InstallStatus,
}

impl InstallRecord {
    pub fn key(record_id: &str) -> String {
        format!("{}{}", INSTALL_PREFIX, record_id)
    }
}
