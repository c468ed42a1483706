//! The RPC client.
//!
//! Call flow: allocate a client-direction message id, register it in the
//! per-core pending table, chunk the request onto the socket, await the
//! response or a timeout. The receive task completes pending entries; a
//! response to an unknown id closes the connection.

use crate::envelope::{
    self, RequestEnvelope, RequestKind, ResponseEnvelope, SchemaDiscovery, DISCOVERY_SERVICE,
};
use bytes::Bytes;
use helio_core::error::{CommunicationKind, Error, Result};
use helio_wire::{
    chunk_message, ChunkCodec, Direction, MessageIdAllocator, PendingRequests, Reassembler,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

/// Client tunables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on connection establishment.
    pub connect_timeout: Duration,
    /// Bound on one request/response exchange.
    pub request_timeout: Duration,
    /// Reassembly backpressure bound.
    pub max_queued_chunks: usize,
    /// Abandon a response whose next chunk is this late.
    pub chunk_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_queued_chunks: 1024,
            chunk_timeout: Duration::from_secs(10),
        }
    }
}

/// A connection to one HelioDB endpoint.
pub struct RpcClient {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pending: Arc<PendingRequests>,
    ids: MessageIdAllocator,
    config: ClientConfig,
    _receive_task: tokio::task::JoinHandle<()>,
}

impl RpcClient {
    /// Connect to `addr`.
    pub async fn connect(addr: &str, config: ClientConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Communication(CommunicationKind::Timeout))?
            .map_err(Error::from)?;
        let (read_half, write_half) = stream.into_split();
        let pending = Arc::new(PendingRequests::new());

        let receive_task = tokio::spawn(receive_loop(
            FramedRead::new(read_half, ChunkCodec),
            Arc::clone(&pending),
            config.max_queued_chunks,
            config.chunk_timeout,
        ));

        Ok(RpcClient {
            writer: Arc::new(Mutex::new(write_half)),
            pending,
            ids: MessageIdAllocator::new(Direction::Client),
            config,
            _receive_task: receive_task,
        })
    }

    /// One request/response exchange with raw payload bytes.
    pub async fn call_raw(&self, request: &RequestEnvelope) -> Result<ResponseEnvelope> {
        let message_id = self.ids.next();
        let bytes = envelope::encode(request)?;
        let receiver = self.pending.register(message_id);

        {
            // The socket is held exclusively for the duration of one send.
            let mut writer = self.writer.lock().await;
            for chunk in chunk_message(message_id, &bytes) {
                writer.write_all(&chunk).await.map_err(|e| {
                    self.pending.timeout(message_id);
                    Error::from(e)
                })?;
            }
        }

        match tokio::time::timeout(self.config.request_timeout, receiver).await {
            Ok(Ok(result)) => {
                let payload: Bytes = result?;
                envelope::decode(&payload)
            }
            Ok(Err(_)) => Err(Error::Communication(CommunicationKind::Closed)),
            Err(_) => {
                self.pending.timeout(message_id);
                Err(Error::Communication(CommunicationKind::Timeout))
            }
        }
    }

    /// Invoke a typed operation.
    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        kind: RequestKind,
        args: &A,
    ) -> Result<R> {
        let request = RequestEnvelope::new(service, operation, kind, args)?;
        let response = self.call_raw(&request).await?;
        response.result()
    }

    /// Fetch the server's schema discovery object.
    pub async fn discover(&self) -> Result<SchemaDiscovery> {
        self.call(DISCOVERY_SERVICE, "Get", RequestKind::Read, &())
            .await
    }

    /// Outstanding request count. Diagnostics only.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }
}

async fn receive_loop(
    mut frames: FramedRead<tokio::net::tcp::OwnedReadHalf, ChunkCodec>,
    pending: Arc<PendingRequests>,
    max_queued_chunks: usize,
    chunk_timeout: Duration,
) {
    let mut reassembler = Reassembler::new(max_queued_chunks, chunk_timeout);
    loop {
        let chunk = match frames.next().await {
            None => break,
            Some(Err(e)) => {
                warn!(error = %e, "client connection corrupt");
                break;
            }
            Some(Ok(chunk)) => chunk,
        };
        for id in reassembler.expire() {
            pending.timeout(id);
        }
        match reassembler.push(chunk) {
            Ok(Some((message_id, payload))) => {
                if !pending.complete(message_id, payload) {
                    // A response nobody asked for: the stream is broken.
                    warn!(message_id, "response to unknown message id");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "reassembly failed");
                break;
            }
        }
    }
    debug!("client receive loop ended");
    pending.fail_all(Error::Communication(CommunicationKind::Closed));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{RpcServer, ServerConfig};
    use crate::service::{OpTableService, ServiceRegistry};
    use std::sync::Arc;

    async fn echo_server() -> (tokio::task::JoinHandle<()>, String) {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(
            "Echo",
            Arc::new(OpTableService::new().with_op("Echo", |_, payload| Ok(payload.to_vec()))),
        );
        let server = RpcServer::new(registry, ServerConfig::default());
        let (handle, addr) = server.serve("127.0.0.1:0").await.unwrap();
        (handle, addr.to_string())
    }

    #[tokio::test]
    async fn round_trip_small_message() {
        let (_server, addr) = echo_server().await;
        let client = RpcClient::connect(&addr, ClientConfig::default()).await.unwrap();
        let result: String = client
            .call("Echo", "Echo", RequestKind::Read, &"ping")
            .await
            .unwrap();
        assert_eq!(result, "ping");
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn round_trip_large_message() {
        let (_server, addr) = echo_server().await;
        let client = RpcClient::connect(&addr, ClientConfig::default()).await.unwrap();
        // A 1 MiB argument forces multi-chunk framing both ways.
        let blob: Vec<u8> = (0..1024 * 1024).map(|i| (i % 241) as u8).collect();
        let result: Vec<u8> = client
            .call("Echo", "Echo", RequestKind::ReadWrite, &blob)
            .await
            .unwrap();
        assert_eq!(result, blob);
    }

    #[tokio::test]
    async fn concurrent_calls_multiplex_one_connection() {
        let (_server, addr) = echo_server().await;
        let client = Arc::new(RpcClient::connect(&addr, ClientConfig::default()).await.unwrap());
        let mut tasks = Vec::new();
        for i in 0..32u32 {
            let client = Arc::clone(&client);
            tasks.push(tokio::spawn(async move {
                let result: u32 = client
                    .call("Echo", "Echo", RequestKind::Read, &i)
                    .await
                    .unwrap();
                assert_eq!(result, i);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn unknown_service_is_a_typed_failure() {
        let (_server, addr) = echo_server().await;
        let client = RpcClient::connect(&addr, ClientConfig::default()).await.unwrap();
        let err = client
            .call::<_, String>("Nope", "Op", RequestKind::Read, &())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn discovery_advertises_services() {
        let (_server, addr) = echo_server().await;
        let client = RpcClient::connect(&addr, ClientConfig::default()).await.unwrap();
        let discovery = client.discover().await.unwrap();
        assert!(discovery.services.contains(&"Echo".to_string()));
        assert_eq!(discovery.protocol_version, helio_wire::HEADER_VERSION);
    }
}
