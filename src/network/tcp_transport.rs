//! TCP transport
//!
//! One frame per connection in each direction: the sender connects, writes
//! its frame, and for round trips reads a single reply frame before the
//! connection closes. Driver payloads are small and transfers are rare, so
//! connection reuse is not worth the bookkeeping.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::protocol::{decode_body, decode_header, encode_message, WireMessage, FRAME_HEADER_LEN};
use super::transport::{InboundEnvelope, InboundSender, Transport};

/// Connection timeout; prevents blocking on unresponsive peers
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the server side waits for the node to produce a reply before
/// giving up on a round trip
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP implementation of the mesh transport.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

async fn connect(addr: &str) -> Result<TcpStream> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow!("connection timeout to {}", addr))?
        .with_context(|| format!("connection failed to {}", addr))?;
    Ok(stream)
}

async fn write_frame(stream: &mut TcpStream, message: &WireMessage) -> Result<()> {
    let frame = encode_message(message)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<WireMessage> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let body_len = decode_header(&header)?;
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await?;
    decode_body(&header, &body)
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, addr: &str, message: WireMessage) -> Result<()> {
        let mut stream = connect(addr).await?;
        write_frame(&mut stream, &message).await?;
        let _ = stream.shutdown().await;
        Ok(())
    }

    async fn request(
        &self,
        addr: &str,
        message: WireMessage,
        timeout: Duration,
    ) -> Result<WireMessage> {
        let mut stream = connect(addr).await?;
        write_frame(&mut stream, &message).await?;
        tokio::time::timeout(timeout, read_frame(&mut stream))
            .await
            .map_err(|_| anyhow!("request to {} timed out", addr))?
    }
}

/// Accept loop: forwards every inbound frame to the node's message loop and
/// writes back whatever reply the node produces, if any.
///
/// Runs until the shutdown signal flips; call from `tokio::spawn`.
pub async fn serve(
    bind_addr: SocketAddr,
    inbound: InboundSender,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding mesh listener on {}", bind_addr))?;
    info!("mesh listener on {}", bind_addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted mesh connection from {}", peer);
                        let inbound = inbound.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, inbound).await {
                                debug!("connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mesh listener on {} shutting down", bind_addr);
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, inbound: InboundSender) -> Result<()> {
    let message = read_frame(&mut stream).await?;

    let (reply_tx, reply_rx) = oneshot::channel();
    inbound
        .send(InboundEnvelope {
            message,
            reply: Some(reply_tx),
        })
        .map_err(|_| anyhow!("node message loop is gone"))?;

    // One-way messages drop the reply sender; the await fails and the
    // connection just closes.
    match tokio::time::timeout(REPLY_TIMEOUT, reply_rx).await {
        Ok(Ok(reply)) => {
            write_frame(&mut stream, &reply).await?;
        }
        Ok(Err(_)) => {}
        Err(_) => {
            warn!("node did not produce a reply within {:?}", REPLY_TIMEOUT);
        }
    }
    let _ = stream.shutdown().await;
    Ok(())
}
