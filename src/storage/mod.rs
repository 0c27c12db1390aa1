//! Registry store
//!
//! Durable, transactional storage for node records, the resource catalog,
//! outstanding requests, cache entries, and installation records. This is
//! the only component allowed to hold long-lived mutable state; every other
//! component goes through [`Registry::with_transaction`] for writes and the
//! snapshot read accessors for queries.
//!
//! Layout: all rows live as JSON values under prefixed keys in one tree of
//! the embedded database, so a single batch commit is atomic across every
//! entity type. An in-memory table view (plus a (name, platform) catalog
//! index for the request-matching hot path) serves reads; transactions stage
//! a copy of the view, commit their batch durably, then publish the staged
//! view. A closure error rolls the whole transaction back by simply dropping
//! the staged copy.

pub mod cache;
pub mod database;
pub mod hashing;
pub mod records;

use anyhow::Result as AnyResult;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::MeshError;
use database::{open_database, Database, Tree};
use records::{
    CacheRecord, CatalogEntry, InstallRecord, NodeRecord, NodeStatus, Provenance, RequestRecord,
    RequestStatus, CACHE_PREFIX, CATALOG_PREFIX, INSTALL_PREFIX, NODE_PREFIX, REQUEST_PREFIX,
};

/// Tree name holding all registry rows
const REGISTRY_TREE: &str = "registry";

/// In-memory view of all registry tables.
#[derive(Debug, Clone, Default)]
struct Tables {
    nodes: BTreeMap<String, NodeRecord>,
    catalog: BTreeMap<String, CatalogEntry>,
    requests: BTreeMap<String, RequestRecord>,
    cache: BTreeMap<String, CacheRecord>,
    installs: BTreeMap<String, InstallRecord>,
    /// Secondary index: (resource_name, platform_tag) -> catalog keys.
    /// This is the hot path for matching requests and queries to entries.
    catalog_index: BTreeMap<(String, String), BTreeSet<String>>,
}

impl Tables {
    fn index_insert(&mut self, entry: &CatalogEntry) {
        self.catalog_index
            .entry((entry.resource_name.clone(), entry.platform_tag.clone()))
            .or_default()
            .insert(entry.key());
    }

    fn index_remove(&mut self, entry: &CatalogEntry) {
        let slot = (entry.resource_name.clone(), entry.platform_tag.clone());
        if let Some(keys) = self.catalog_index.get_mut(&slot) {
            keys.remove(&entry.key());
            if keys.is_empty() {
                self.catalog_index.remove(&slot);
            }
        }
    }
}

enum Op {
    Put(String, Vec<u8>),
    Delete(String),
}

/// Scoped transaction handle.
///
/// Mutations validate against and apply to a staged copy of the tables, and
/// accumulate durable batch operations. Nothing becomes visible (in memory
/// or on disk) until the closure returns `Ok` and the batch commits.
pub struct Txn {
    tables: Tables,
    ops: Vec<Op>,
}

impl Txn {
    fn put<T: serde::Serialize>(&mut self, key: String, row: &T) -> Result<(), MeshError> {
        let bytes = serde_json::to_vec(row)
            .map_err(|e| MeshError::storage(format!("row encode: {}", e)))?;
        self.ops.push(Op::Put(key, bytes));
        Ok(())
    }

    // ------------------------------------------------------------
    // Reads (see the staged state, including this txn's own writes)
    // ------------------------------------------------------------

    pub fn node(&self, node_id: &str) -> Option<&NodeRecord> {
        self.tables.nodes.get(node_id)
    }

    pub fn request(&self, request_id: &str) -> Option<&RequestRecord> {
        self.tables.requests.get(request_id)
    }

    pub fn cache_record(&self, content_hash: &str) -> Option<&CacheRecord> {
        self.tables.cache.get(content_hash)
    }

    pub fn catalog_entry(&self, key: &str) -> Option<&CatalogEntry> {
        self.tables.catalog.get(key)
    }

    pub fn catalog_for_owner(&self, owner: &str) -> Vec<CatalogEntry> {
        self.tables
            .catalog
            .values()
            .filter(|e| e.owning_node_id == owner)
            .cloned()
            .collect()
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<NodeRecord> {
        self.tables
            .nodes
            .values()
            .filter(|n| n.status == status)
            .cloned()
            .collect()
    }

    pub fn open_requests(&self) -> Vec<RequestRecord> {
        self.tables
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Open)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------
    // Node rows
    // ------------------------------------------------------------

    /// Upsert a node row. Heartbeat regressions are clamped to the stored
    /// value so `last_heartbeat` stays monotonically non-decreasing for the
    /// lifetime of the row.
    pub fn upsert_node(&mut self, mut rec: NodeRecord) -> Result<(), MeshError> {
        if let Some(existing) = self.tables.nodes.get(&rec.node_id) {
            if rec.last_heartbeat_ms < existing.last_heartbeat_ms {
                rec.last_heartbeat_ms = existing.last_heartbeat_ms;
            }
        }
        self.put(NodeRecord::key(&rec.node_id), &rec)?;
        self.tables.nodes.insert(rec.node_id.clone(), rec);
        Ok(())
    }

    /// Refresh a node's heartbeat and mark it active again.
    pub fn touch_node(&mut self, node_id: &str, now_ms: u64) -> Result<(), MeshError> {
        let mut rec = self
            .tables
            .nodes
            .get(node_id)
            .cloned()
            .ok_or(MeshError::NotFound)?;
        rec.last_heartbeat_ms = rec.last_heartbeat_ms.max(now_ms);
        rec.status = NodeStatus::Active;
        self.put(NodeRecord::key(node_id), &rec)?;
        self.tables.nodes.insert(node_id.to_string(), rec);
        Ok(())
    }

    pub fn set_node_status(&mut self, node_id: &str, status: NodeStatus) -> Result<(), MeshError> {
        let mut rec = self
            .tables
            .nodes
            .get(node_id)
            .cloned()
            .ok_or(MeshError::NotFound)?;
        rec.status = status;
        self.put(NodeRecord::key(node_id), &rec)?;
        self.tables.nodes.insert(node_id.to_string(), rec);
        Ok(())
    }

    pub fn remove_node(&mut self, node_id: &str) -> Result<(), MeshError> {
        if self.tables.nodes.remove(node_id).is_none() {
            return Err(MeshError::NotFound);
        }
        self.ops.push(Op::Delete(NodeRecord::key(node_id)));
        Ok(())
    }

    // ------------------------------------------------------------
    // Catalog rows
    // ------------------------------------------------------------

    /// Upsert a catalog entry by its owner-scoped key.
    ///
    /// Returns `true` if a new row was inserted, `false` if an identical row
    /// (same content hash) already existed. A different hash under the same
    /// `(name, version, platform, owner)` is a `Conflict`; the caller decides
    /// whether to drop the new claim or replace the row.
    pub fn upsert_catalog_entry(&mut self, entry: CatalogEntry) -> Result<bool, MeshError> {
        let key = entry.key();
        if let Some(existing) = self.tables.catalog.get(&key) {
            if existing.content_hash != entry.content_hash {
                return Err(MeshError::conflict(format!(
                    "catalog entry {} already present with hash {}",
                    key, existing.content_hash
                )));
            }
            return Ok(false);
        }
        self.put(key.clone(), &entry)?;
        self.tables.index_insert(&entry);
        self.tables.catalog.insert(key, entry);
        Ok(true)
    }

    /// Remove one catalog entry by key. Absence is not an error.
    pub fn remove_catalog_entry(&mut self, key: &str) -> Result<(), MeshError> {
        if let Some(entry) = self.tables.catalog.remove(key) {
            self.tables.index_remove(&entry);
            self.ops.push(Op::Delete(key.to_string()));
        }
        Ok(())
    }

    /// Upgrade an entry's provenance after a transfer confirmed its digest.
    pub fn set_catalog_provenance(
        &mut self,
        key: &str,
        provenance: Provenance,
    ) -> Result<(), MeshError> {
        let mut entry = self
            .tables
            .catalog
            .get(key)
            .cloned()
            .ok_or(MeshError::NotFound)?;
        entry.provenance = provenance;
        self.put(key.to_string(), &entry)?;
        self.tables.catalog.insert(key.to_string(), entry);
        Ok(())
    }

    /// Cascade removal of every catalog entry owned by `owner`.
    pub fn remove_catalog_for_owner(&mut self, owner: &str) -> Result<usize, MeshError> {
        let keys: Vec<String> = self
            .tables
            .catalog
            .values()
            .filter(|e| e.owning_node_id == owner)
            .map(|e| e.key())
            .collect();
        for key in &keys {
            self.remove_catalog_entry(key)?;
        }
        Ok(keys.len())
    }

    // ------------------------------------------------------------
    // Request rows
    // ------------------------------------------------------------

    pub fn insert_request(&mut self, rec: RequestRecord) -> Result<(), MeshError> {
        if self.tables.requests.contains_key(&rec.request_id) {
            return Err(MeshError::conflict(format!(
                "request {} already exists",
                rec.request_id
            )));
        }
        self.put(RequestRecord::key(&rec.request_id), &rec)?;
        self.tables.requests.insert(rec.request_id.clone(), rec);
        Ok(())
    }

    /// One-shot transition from `Open` to a terminal status.
    ///
    /// Succeeds at most once per request: a second resolution attempt fails
    /// with `Conflict`, which is how late offers and racing sweeps are kept
    /// from producing duplicate fulfillment records. `fulfilling_node_id` is
    /// recorded iff the terminal status is `Fulfilled`.
    pub fn resolve_request(
        &mut self,
        request_id: &str,
        status: RequestStatus,
        fulfilling_node_id: Option<String>,
    ) -> Result<(), MeshError> {
        debug_assert!(status.is_terminal());
        let mut rec = self
            .tables
            .requests
            .get(request_id)
            .cloned()
            .ok_or(MeshError::NotFound)?;
        if rec.status.is_terminal() {
            return Err(MeshError::conflict(format!(
                "request {} already {:?}",
                request_id, rec.status
            )));
        }
        rec.status = status;
        rec.fulfilling_node_id = if status == RequestStatus::Fulfilled {
            fulfilling_node_id
        } else {
            None
        };
        self.put(RequestRecord::key(request_id), &rec)?;
        self.tables.requests.insert(request_id.to_string(), rec);
        Ok(())
    }

    // ------------------------------------------------------------
    // Cache rows
    // ------------------------------------------------------------

    pub fn put_cache_record(&mut self, rec: CacheRecord) -> Result<(), MeshError> {
        self.put(CacheRecord::key(&rec.content_hash), &rec)?;
        self.tables.cache.insert(rec.content_hash.clone(), rec);
        Ok(())
    }

    pub fn remove_cache_record(&mut self, content_hash: &str) -> Result<(), MeshError> {
        if self.tables.cache.remove(content_hash).is_none() {
            return Err(MeshError::NotFound);
        }
        self.ops.push(Op::Delete(CacheRecord::key(content_hash)));
        Ok(())
    }

    // ------------------------------------------------------------
    // Installation rows
    // ------------------------------------------------------------

    pub fn record_install(&mut self, rec: InstallRecord) -> Result<(), MeshError> {
        if self.tables.installs.contains_key(&rec.record_id) {
            return Err(MeshError::conflict(format!(
                "install record {} already exists",
                rec.record_id
            )));
        }
        self.put(InstallRecord::key(&rec.record_id), &rec)?;
        self.tables.installs.insert(rec.record_id.clone(), rec);
        Ok(())
    }
}

/// Registry store over the embedded database.
pub struct Registry {
    db: Box<dyn Database>,
    tree: Box<dyn Tree>,
    tables: RwLock<Tables>,
}

impl Registry {
    /// Open (or create) the registry at `path` and load all durable rows.
    ///
    /// A process restart resumes from exactly this state; in-flight requests
    /// are not resurrected, they expire naturally via `expires_at`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MeshError> {
        let db = open_database(path.as_ref()).map_err(MeshError::storage)?;
        let tree = db.open_tree(REGISTRY_TREE).map_err(MeshError::storage)?;
        let tables = load_tables(tree.as_ref()).map_err(MeshError::storage)?;

        info!(
            "registry opened: {} node(s), {} catalog entr(ies), {} request(s), {} cache record(s)",
            tables.nodes.len(),
            tables.catalog.len(),
            tables.requests.len(),
            tables.cache.len()
        );

        Ok(Self {
            db,
            tree,
            tables: RwLock::new(tables),
        })
    }

    /// Run `f` inside a transaction.
    ///
    /// The closure's mutations either all commit (durably, in one atomic
    /// batch) or all roll back. Writers are serialized here; the closure
    /// must not block on network I/O.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&mut Txn) -> Result<T, MeshError>,
    ) -> Result<T, MeshError> {
        let mut guard = self
            .tables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut txn = Txn {
            tables: guard.clone(),
            ops: Vec::new(),
        };
        let out = f(&mut txn)?;

        if !txn.ops.is_empty() {
            let mut batch = self.tree.batch();
            for op in &txn.ops {
                match op {
                    Op::Put(key, value) => batch.put(key.as_bytes(), value),
                    Op::Delete(key) => batch.delete(key.as_bytes()),
                }
            }
            batch.commit().map_err(MeshError::storage)?;
        }

        *guard = txn.tables;
        Ok(out)
    }

    /// Flush pending writes to durable storage.
    pub fn flush(&self) -> Result<(), MeshError> {
        self.db.flush().map_err(MeshError::storage)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------
    // Snapshot reads
    // ------------------------------------------------------------

    pub fn node(&self, node_id: &str) -> Option<NodeRecord> {
        self.read().nodes.get(node_id).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.read().nodes.values().cloned().collect()
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<NodeRecord> {
        self.read()
            .nodes
            .values()
            .filter(|n| n.status == status)
            .cloned()
            .collect()
    }

    /// Active peers, excluding `exclude` (normally the local node).
    pub fn active_peers(&self, exclude: &str) -> Vec<NodeRecord> {
        self.read()
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Active && n.node_id != exclude)
            .cloned()
            .collect()
    }

    /// Known peers eligible for liveness probing (everything not evicted).
    pub fn probe_targets(&self, exclude: &str) -> Vec<NodeRecord> {
        self.read()
            .nodes
            .values()
            .filter(|n| n.status != NodeStatus::Evicted && n.node_id != exclude)
            .cloned()
            .collect()
    }

    /// Catalog entries matching a query, via the (name, platform) index.
    pub fn find_catalog(
        &self,
        resource_name: &str,
        platform_tag: &str,
        hardware_id: Option<&str>,
    ) -> Vec<CatalogEntry> {
        let tables = self.read();
        let slot = (resource_name.to_string(), platform_tag.to_string());
        let Some(keys) = tables.catalog_index.get(&slot) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|k| tables.catalog.get(k))
            .filter(|e| e.matches(resource_name, platform_tag, hardware_id))
            .cloned()
            .collect()
    }

    pub fn catalog_entries(&self) -> Vec<CatalogEntry> {
        self.read().catalog.values().cloned().collect()
    }

    pub fn catalog_for_owner(&self, owner: &str) -> Vec<CatalogEntry> {
        self.read()
            .catalog
            .values()
            .filter(|e| e.owning_node_id == owner)
            .cloned()
            .collect()
    }

    pub fn catalog_by_hash(&self, content_hash: &str) -> Vec<CatalogEntry> {
        self.read()
            .catalog
            .values()
            .filter(|e| e.content_hash == content_hash)
            .cloned()
            .collect()
    }

    pub fn request(&self, request_id: &str) -> Option<RequestRecord> {
        self.read().requests.get(request_id).cloned()
    }

    pub fn requests_with_status(&self, status: RequestStatus) -> Vec<RequestRecord> {
        self.read()
            .requests
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    pub fn cache_record(&self, content_hash: &str) -> Option<CacheRecord> {
        self.read().cache.get(content_hash).cloned()
    }

    pub fn cache_records(&self) -> Vec<CacheRecord> {
        self.read().cache.values().cloned().collect()
    }

    pub fn install_records(&self) -> Vec<InstallRecord> {
        self.read().installs.values().cloned().collect()
    }
}

fn load_tables(tree: &dyn Tree) -> AnyResult<Tables> {
    let mut tables = Tables::default();

    for item in tree.iter() {
        let (key_bytes, value) = item?;
        let key = String::from_utf8_lossy(&key_bytes).to_string();

        let loaded = if key.starts_with(NODE_PREFIX) {
            serde_json::from_slice::<NodeRecord>(&value)
                .map(|r| {
                    tables.nodes.insert(r.node_id.clone(), r);
                })
                .is_ok()
        } else if key.starts_with(CATALOG_PREFIX) {
            serde_json::from_slice::<CatalogEntry>(&value)
                .map(|e| {
                    tables.index_insert(&e);
                    tables.catalog.insert(e.key(), e);
                })
                .is_ok()
        } else if key.starts_with(REQUEST_PREFIX) {
            serde_json::from_slice::<RequestRecord>(&value)
                .map(|r| {
                    tables.requests.insert(r.request_id.clone(), r);
                })
                .is_ok()
        } else if key.starts_with(CACHE_PREFIX) {
            serde_json::from_slice::<CacheRecord>(&value)
                .map(|r| {
                    tables.cache.insert(r.content_hash.clone(), r);
                })
                .is_ok()
        } else if key.starts_with(INSTALL_PREFIX) {
            serde_json::from_slice::<InstallRecord>(&value)
                .map(|r| {
                    tables.installs.insert(r.record_id.clone(), r);
                })
                .is_ok()
        } else {
            debug!("skipping unknown registry key {}", key);
            true
        };

        if !loaded {
            warn!("skipping undecodable registry row {}", key);
        }
    }

    Ok(tables)
}
