//! Mesh networking: wire protocol, transports, and broadcast helpers.

pub mod memory_transport;
pub mod protocol;
pub mod tcp_transport;
pub mod transport;

use std::sync::Arc;
use tracing::debug;

use crate::storage::records::NodeRecord;
use protocol::WireMessage;
use transport::Transport;

/// Fire-and-forget broadcast of one message to a set of peers.
///
/// Deliveries run concurrently and failures are only logged; an unreachable
/// peer is the liveness loop's problem, not the broadcaster's.
pub fn broadcast_to_peers(
    transport: Arc<dyn Transport>,
    peers: Vec<NodeRecord>,
    message: WireMessage,
) {
    for peer in peers {
        let transport = transport.clone();
        let message = message.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.send(&peer.network_address, message).await {
                debug!("broadcast to {} ({}) failed: {}", peer.node_id, peer.network_address, e);
            }
        });
    }
}
