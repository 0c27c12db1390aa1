//! Mesh error taxonomy
//!
//! One typed error enum covers both the registry layer (NotFound, Conflict,
//! StorageUnavailable) and the request/fulfillment surface (NoSourceFound,
//! IntegrityFailure, TransferTimeout). External callers never see internal
//! plumbing errors; everything crossing the crate boundary is one of these.

use thiserror::Error;

/// Errors surfaced by the mesh subsystem.
///
/// `Clone` is required so coalesced request waiters can all receive the same
/// outcome over a broadcast channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeshError {
    /// Row absent. Not an exceptional condition; callers treat it as an
    /// empty result or retry.
    #[error("not found")]
    NotFound,

    /// Unique-constraint violation on upsert. The caller must re-read
    /// current state and reconcile.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The durable store cannot be read or written. Fatal; propagate to the
    /// process supervisor.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// No peer offered the requested resource before the deadline.
    #[error("no source found for {resource_name} ({platform_tag})")]
    NoSourceFound {
        resource_name: String,
        platform_tag: String,
    },

    /// Every transfer produced bytes that did not match the offered digest.
    /// Carries the offerers disqualified along the way for diagnosis.
    #[error("integrity failure after {} disqualified offer(s)", disqualified.len())]
    IntegrityFailure { disqualified: Vec<String> },

    /// Transfers kept timing out and the retry budget ran out without a
    /// single digest mismatch.
    #[error("transfer timed out")]
    TransferTimeout,
}

impl MeshError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl std::fmt::Display) -> Self {
        Self::StorageUnavailable(msg.to_string())
    }
}

impl From<sled::Error> for MeshError {
    fn from(e: sled::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

impl From<std::io::Error> for MeshError {
    fn from(e: std::io::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}
