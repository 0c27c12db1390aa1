//! Transport abstraction
//!
//! Peers are reached by their advertised network address. A transport
//! supports one-way delivery (`send`: advertisements, queries, offers) and
//! round trips (`request`: liveness probes, payload transfers). Inbound
//! traffic is forwarded to the node's message loop as [`InboundEnvelope`]s;
//! a round-trip carries a reply channel, a one-way message does not.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::protocol::WireMessage;

/// An inbound message plus the reply channel for round trips.
///
/// For one-way messages `reply` is `None` (or, over TCP, a sender the node
/// may simply drop).
pub struct InboundEnvelope {
    pub message: WireMessage,
    pub reply: Option<oneshot::Sender<WireMessage>>,
}

pub type InboundSender = mpsc::UnboundedSender<InboundEnvelope>;
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundEnvelope>;

/// Outbound side of a mesh transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a one-way message to `addr`. Failure means the peer was
    /// unreachable; callers treat that as a liveness signal, not an error
    /// to propagate.
    async fn send(&self, addr: &str, message: WireMessage) -> Result<()>;

    /// Round trip: deliver `message` to `addr` and await one reply, bounded
    /// by `timeout`.
    async fn request(
        &self,
        addr: &str,
        message: WireMessage,
        timeout: Duration,
    ) -> Result<WireMessage>;
}
