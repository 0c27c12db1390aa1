//! Node identity derivation
//!
//! A node's identity must survive restarts so the rest of the mesh can keep
//! a single row for it. Preference order:
//!
//! 1. Fingerprint of durable machine characteristics (machine-id plus the
//!    CPU topology string), hashed to a fixed width.
//! 2. A random identifier persisted under the data directory, loaded on
//!    subsequent starts.
//! 3. An in-memory random identifier if the data directory is unwritable.
//!
//! This never fails; the degraded paths only lose identity stability across
//! reinstalls, not correctness.

use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::hashing::sha256_hex;

/// File under the data dir holding the persisted fallback identifier
const NODE_ID_FILE: &str = "node_id";

/// Machine-id sources, most durable first
const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Width of the hex fingerprint portion of a node id
const FINGERPRINT_HEX_LEN: usize = 16;

/// A node's stable identity and the attributes advertised with it.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: String,
    pub display_name: String,
    pub platform_tag: String,
}

impl NodeIdentity {
    /// Derive or load the local identity. Never fails.
    pub fn load_or_derive(data_dir: &Path) -> Self {
        let node_id = derive_node_id(data_dir);
        Self {
            node_id,
            display_name: hostname(),
            platform_tag: platform_tag(),
        }
    }
}

/// Platform tag in `os-arch` form, e.g. `linux-x86_64`.
pub fn platform_tag() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

fn hostname() -> String {
    if let Ok(name) = fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

fn derive_node_id(data_dir: &Path) -> String {
    // An identity persisted by an earlier run wins: the id must stay stable
    // even if the machine fingerprint inputs drift (kernel update, CPU
    // hotplug).
    if let Some(existing) = load_persisted_id(data_dir) {
        debug!("loaded persisted node id {}", existing);
        return existing;
    }

    if let Some(signature) = machine_signature() {
        let digest = sha256_hex(signature.as_bytes());
        let id = format!("mesh-{}", &digest[..FINGERPRINT_HEX_LEN]);
        debug!("derived node id {} from machine signature", id);
        persist_id(data_dir, &id);
        return id;
    }

    let id = random_id();
    warn!("no durable machine characteristics found, using random node id {}", id);
    persist_id(data_dir, &id);
    id
}

/// Build a signature from characteristics that rarely change across boots.
///
/// Returns None when no durable source is readable (e.g. containers with a
/// masked machine-id and no /proc).
fn machine_signature() -> Option<String> {
    let mut parts = Vec::new();

    for path in MACHINE_ID_PATHS {
        if let Ok(contents) = fs::read_to_string(path) {
            let id = contents.trim();
            if !id.is_empty() {
                parts.push(id.to_string());
                break;
            }
        }
    }

    if let Some(topology) = cpu_topology() {
        parts.push(topology);
    }

    if parts.is_empty() {
        None
    } else {
        parts.push(std::env::consts::ARCH.to_string());
        Some(parts.join("|"))
    }
}

/// CPU model lines from /proc/cpuinfo, deduplicated, plus the core count.
fn cpu_topology() -> Option<String> {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo").ok()?;
    let mut models: Vec<&str> = cpuinfo
        .lines()
        .filter(|l| l.starts_with("model name"))
        .collect();
    let cores = models.len();
    models.dedup();
    if cores == 0 {
        return None;
    }
    Some(format!("{}x{}", cores, models.join(";")))
}

fn load_persisted_id(data_dir: &Path) -> Option<String> {
    let contents = fs::read_to_string(data_dir.join(NODE_ID_FILE)).ok()?;
    let existing = contents.trim();
    if existing.starts_with("mesh-") {
        Some(existing.to_string())
    } else {
        None
    }
}

fn persist_id(data_dir: &Path, id: &str) {
    let id_path = data_dir.join(NODE_ID_FILE);
    if let Err(e) =
        fs::create_dir_all(data_dir).and_then(|_| fs::write(&id_path, format!("{}\n", id)))
    {
        warn!(
            "could not persist node id to {}: {} (identity may change on restart)",
            id_path.display(),
            e
        );
    }
}

fn random_id() -> String {
    format!("mesh-{}", &Uuid::new_v4().simple().to_string()[..FINGERPRINT_HEX_LEN])
}
