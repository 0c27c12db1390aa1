//! Mesh wire protocol
//!
//! Message types exchanged between peers, and the frame codec: a fixed
//! header (magic, body length, checksum) followed by a JSON body. The
//! checksum is the first four bytes of the body's SHA256 digest; it guards
//! the frame itself, not the payload content (payload integrity is the
//! content hash's job).

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Mesh protocol magic bytes
pub const MESH_MAGIC: [u8; 4] = *b"MSH1";

/// Frame header size: magic (4) + length (4) + checksum (4)
pub const FRAME_HEADER_LEN: usize = 12;

/// Maximum wire message size (64 MB); bounds driver payload transfers
pub const MAX_WIRE_MESSAGE_LENGTH: usize = 64 * 1024 * 1024;

/// A node describing itself in an advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub node_id: String,
    pub display_name: String,
    pub network_address: String,
    pub platform_tag: String,
    pub resource_count: u64,
}

/// One catalog entry in an advertisement delta. The owner is the announcing
/// node, so it is not repeated per entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogAnnouncement {
    pub resource_name: String,
    pub version: String,
    pub platform_tag: String,
    pub target_hardware_id: Option<String>,
    pub content_hash: String,
    pub size_bytes: u64,
}

/// A peer's response to a resource query, proposing itself as a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceOffer {
    pub request_id: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub owning_node_id: String,
}

/// Messages exchanged between mesh peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Periodic self-advertisement with the catalog delta since the last one
    Advertise {
        node: NodeAnnouncement,
        catalog_delta: Vec<CatalogAnnouncement>,
    },
    /// Liveness probe round-trip
    LivenessProbe { node_id: String },
    LivenessAck { node_id: String, timestamp_ms: u64 },
    /// Broadcast when a node needs a resource; offers travel back to
    /// `reply_to` as one-way messages
    ResourceQuery {
        request_id: String,
        reply_to: String,
        resource_name: String,
        platform_tag: String,
        target_hardware_id: Option<String>,
    },
    ResourceOffer(ResourceOffer),
    /// Payload transfer round-trip
    TransferRequest { content_hash: String },
    TransferPayload {
        content_hash: String,
        #[serde(with = "hex::serde")]
        bytes: Vec<u8>,
    },
    TransferNotFound { content_hash: String },
}

fn body_checksum(body: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(body);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Encode a message into a complete frame.
pub fn encode_message(message: &WireMessage) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_WIRE_MESSAGE_LENGTH {
        bail!("message body {} exceeds maximum frame size", body.len());
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&MESH_MAGIC);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body_checksum(&body));
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parse and validate a frame header, returning the expected body length.
pub fn decode_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<usize> {
    if header[0..4] != MESH_MAGIC {
        bail!("bad magic in frame header");
    }
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_WIRE_MESSAGE_LENGTH {
        bail!("frame body length {} exceeds maximum", len);
    }
    Ok(len)
}

/// Decode a frame body against its header checksum.
pub fn decode_body(header: &[u8; FRAME_HEADER_LEN], body: &[u8]) -> Result<WireMessage> {
    if body_checksum(body) != header[8..12] {
        bail!("frame checksum mismatch");
    }
    Ok(serde_json::from_slice(body)?)
}

/// Decode a complete frame (header + body) from one buffer.
pub fn decode_message(frame: &[u8]) -> Result<WireMessage> {
    if frame.len() < FRAME_HEADER_LEN {
        bail!("frame shorter than header");
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&frame[..FRAME_HEADER_LEN]);
    let len = decode_header(&header)?;
    let body = &frame[FRAME_HEADER_LEN..];
    if body.len() != len {
        bail!("frame body length {} does not match header ({})", body.len(), len);
    }
    decode_body(&header, body)
}
