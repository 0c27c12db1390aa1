//! In-process transport
//!
//! Routes frames between nodes living in the same process over channels.
//! Used by integration tests to exercise the full advertise/query/offer/
//! transfer flow without sockets; messages still pass through the frame
//! codec so the wire format is exercised too.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::protocol::{decode_message, encode_message, WireMessage};
use super::transport::{InboundEnvelope, InboundReceiver, InboundSender, Transport};

/// Shared routing table mapping addresses to node inboxes.
#[derive(Default)]
pub struct MemoryHub {
    routes: Mutex<HashMap<String, InboundSender>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an address and return the inbox its traffic arrives on.
    pub fn register(&self, addr: &str) -> InboundReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(addr.to_string(), tx);
        rx
    }

    /// Drop an address from the routing table, simulating an unreachable
    /// peer.
    pub fn disconnect(&self, addr: &str) {
        self.routes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(addr);
    }

    fn route(&self, addr: &str) -> Result<InboundSender> {
        self.routes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(addr)
            .cloned()
            .ok_or_else(|| anyhow!("no route to {}", addr))
    }
}

/// Transport over a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
}

impl MemoryTransport {
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, addr: &str, message: WireMessage) -> Result<()> {
        // Round-trip through the codec so in-process runs exercise framing.
        let frame = encode_message(&message)?;
        let message = decode_message(&frame)?;

        let route = self.hub.route(addr)?;
        route
            .send(InboundEnvelope {
                message,
                reply: None,
            })
            .map_err(|_| anyhow!("inbox for {} closed", addr))?;
        Ok(())
    }

    async fn request(
        &self,
        addr: &str,
        message: WireMessage,
        timeout: Duration,
    ) -> Result<WireMessage> {
        let frame = encode_message(&message)?;
        let message = decode_message(&frame)?;

        let route = self.hub.route(addr)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        route
            .send(InboundEnvelope {
                message,
                reply: Some(reply_tx),
            })
            .map_err(|_| anyhow!("inbox for {} closed", addr))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(anyhow!("peer {} dropped the request", addr)),
            Err(_) => {
                debug!("request to {} timed out after {:?}", addr, timeout);
                Err(anyhow!("request to {} timed out", addr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_reaches_registered_inbox() {
        let hub = MemoryHub::new();
        let mut inbox = hub.register("node-a");
        let transport = MemoryTransport::new(hub.clone());

        transport
            .send("node-a", WireMessage::LivenessProbe { node_id: "x".into() })
            .await
            .unwrap();

        let envelope = inbox.recv().await.unwrap();
        assert!(matches!(envelope.message, WireMessage::LivenessProbe { .. }));
        assert!(envelope.reply.is_none());
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let hub = MemoryHub::new();
        let mut inbox = hub.register("node-a");
        let transport = MemoryTransport::new(hub.clone());

        tokio::spawn(async move {
            let envelope = inbox.recv().await.unwrap();
            let reply = envelope.reply.unwrap();
            let _ = reply.send(WireMessage::LivenessAck {
                node_id: "a".into(),
                timestamp_ms: 1,
            });
        });

        let reply = transport
            .request(
                "node-a",
                WireMessage::LivenessProbe { node_id: "x".into() },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(matches!(reply, WireMessage::LivenessAck { .. }));
    }

    #[tokio::test]
    async fn test_unknown_address_is_unreachable() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub);
        let err = transport
            .send("ghost", WireMessage::LivenessProbe { node_id: "x".into() })
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_request_times_out_without_reply() {
        let hub = MemoryHub::new();
        // Register but never answer.
        let _inbox = hub.register("node-a");
        let transport = MemoryTransport::new(hub.clone());

        let err = transport
            .request(
                "node-a",
                WireMessage::LivenessProbe { node_id: "x".into() },
                Duration::from_millis(50),
            )
            .await;
        assert!(err.is_err());
    }
}
