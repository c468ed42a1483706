//! The RPC server.
//!
//! One receive task per connection decodes chunks and reassembles
//! messages; each complete request is dispatched onto the runtime, with
//! the (blocking) handler body on the blocking pool. Responses flow
//! through a per-connection writer task that groups small chunks queued
//! back to back into one socket write.

use crate::envelope::{self, RequestEnvelope, ResponseEnvelope, DISCOVERY_SERVICE};
use crate::service::ServiceRegistry;
use bytes::Bytes;
use helio_core::error::{CommunicationKind, Error, Result};
use helio_wire::{chunk_message, ChunkCodec, Direction, Reassembler};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// Tunables for a listening endpoint.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Reassembly backpressure bound.
    pub max_queued_chunks: usize,
    /// Abandon a message whose next chunk is this late.
    pub chunk_timeout: Duration,
    /// Close a connection idle this long.
    pub inactivity_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_queued_chunks: 1024,
            chunk_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(300),
        }
    }
}

/// A listening RPC endpoint.
pub struct RpcServer {
    registry: Arc<ServiceRegistry>,
    config: ServerConfig,
}

impl RpcServer {
    /// Build a server over `registry`.
    pub fn new(registry: Arc<ServiceRegistry>, config: ServerConfig) -> Self {
        RpcServer { registry, config }
    }

    /// Bind `addr` and return the accept-loop task handle plus the bound
    /// address (useful when binding port 0).
    pub async fn serve(self, addr: &str) -> Result<(tokio::task::JoinHandle<()>, SocketAddr)> {
        let listener = TcpListener::bind(addr).await.map_err(Error::from)?;
        let local = listener.local_addr().map_err(Error::from)?;
        info!(%local, "rpc endpoint listening");
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        let registry = Arc::clone(&self.registry);
                        let config = self.config.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, registry, config).await {
                                debug!(%peer, error = %e, "connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });
        Ok((handle, local))
    }
}

/// Writer task: drains the queue, grouping everything immediately
/// available into one write before flushing.
async fn write_loop(mut rx: mpsc::Receiver<Bytes>, mut writer: OwnedWriteHalf) {
    while let Some(first) = rx.recv().await {
        let mut grouped = first.to_vec();
        while let Ok(next) = rx.try_recv() {
            grouped.extend_from_slice(&next);
        }
        if writer.write_all(&grouped).await.is_err() {
            break;
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    registry: Arc<ServiceRegistry>,
    config: ServerConfig,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, ChunkCodec);
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(1024);
    let writer = tokio::spawn(write_loop(out_rx, write_half));

    let mut reassembler = Reassembler::new(config.max_queued_chunks, config.chunk_timeout);

    loop {
        // Backpressure: while over the queued-chunk bound, stop reading
        // the socket and let timeouts clear the backlog.
        while reassembler.over_limit() {
            tokio::time::sleep(Duration::from_millis(5)).await;
            reassembler.expire();
        }

        let chunk = match tokio::time::timeout(config.inactivity_timeout, frames.next()).await {
            Err(_) => {
                debug!("connection idle past bound");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                // Corrupt header, oversize chunk, unsupported version: the
                // connection is beyond recovery.
                warn!(error = %e, "closing connection on protocol violation");
                drop(frames);
                writer.abort();
                return Err(e);
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        reassembler.expire();
        if let Some((message_id, payload)) = reassembler.push(chunk)? {
            if helio_wire::direction_of(message_id) == Direction::Server {
                // Servers never receive responses on an execution
                // endpoint; this id cannot be ours.
                return Err(Error::Communication(CommunicationKind::CorruptMessage));
            }
            let registry = Arc::clone(&registry);
            let out = out_tx.clone();
            tokio::spawn(async move {
                let response = dispatch(&registry, &payload).await;
                let bytes = match envelope::encode(&response) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "response encode failed");
                        return;
                    }
                };
                // The response echoes the request's message id.
                for chunk in chunk_message(message_id, &bytes) {
                    if out.send(chunk).await.is_err() {
                        return;
                    }
                }
            });
        }
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn dispatch(registry: &Arc<ServiceRegistry>, payload: &[u8]) -> ResponseEnvelope {
    let request: RequestEnvelope = match envelope::decode(payload) {
        Ok(r) => r,
        Err(e) => return ResponseEnvelope::fail(e),
    };

    if request.service == DISCOVERY_SERVICE {
        let discovery = registry.discovery();
        return ResponseEnvelope::ok(&discovery).unwrap_or_else(ResponseEnvelope::fail);
    }

    let service = match registry.get(&request.service) {
        Ok(s) => s,
        Err(e) => return ResponseEnvelope::fail(e),
    };

    // Handlers run transactions and may block; keep them off the reactor.
    let result = tokio::task::spawn_blocking(move || {
        service.invoke(&request.operation, request.kind, &request.payload)
    })
    .await;

    match result {
        Ok(Ok(payload)) => ResponseEnvelope {
            status: 0,
            error: None,
            payload,
        },
        Ok(Err(e)) => ResponseEnvelope::fail(e),
        Err(join_error) => ResponseEnvelope::fail(Error::InvalidState(format!(
            "handler panicked: {join_error}"
        ))),
    }
}
