//! mesh-node - peer resource mesh
//!
//! Independent nodes advertise, discover, request, transfer, cache, and
//! install named binary resources ("drivers") without a central authority.
//!
//! ## Architecture
//!
//! - [`storage::Registry`]: durable, transactional store for nodes, the
//!   resource catalog, requests, cache entries, and installation records;
//!   the only long-lived mutable state in the crate.
//! - [`identity`]: stable node identity, fingerprinted from the machine
//!   with a persisted random fallback.
//! - [`node::scanner`]: catalogs installable resources already on disk.
//! - [`node::discovery`]: periodic self-advertisement and peer liveness.
//! - [`node::coordinator`]: the request/offer/transfer/verify cycle.
//! - [`storage::cache`]: content-addressed payload cache with LRU eviction.
//! - [`node::health`]: staleness eviction and request expiry sweeps.
//! - [`node::install`]: stage/apply/rollback installation with an immutable
//!   outcome history.
//!
//! The crate is a library consumed by an external orchestrator; the entry
//! points are [`MeshNode::request_resource`],
//! [`MeshNode::request_and_install`], and [`MeshNode::scan_and_publish`].

pub mod config;
pub mod error;
pub mod identity;
pub mod network;
pub mod node;
pub mod storage;
pub mod utils;

pub use config::MeshConfig;
pub use error::MeshError;
pub use identity::NodeIdentity;
pub use node::coordinator::Fulfillment;
pub use node::{MeshNode, MeshStatus};
pub use storage::records::{
    CacheRecord, CatalogEntry, InstallRecord, InstallStatus, NodeRecord, NodeStatus, Provenance,
    RequestRecord, RequestStatus,
};
pub use storage::Registry;
