//! Replica-side tailing.
//!
//! A standby (or read-only child) runs a `ReplicaClient` against its
//! source's replication endpoint: it reports its applied version, applies
//! the snapshot transfer and/or record tail it receives in order, and
//! acknowledges periodically. Reconnection resumes from the applied
//! version, so only truncated history forces a new snapshot transfer.

use crate::protocol::ReplicationMsg;
use helio_core::error::{CommunicationKind, Error, Result};
use helio_core::types::Version;
use helio_durability::{LogRecord, SnapshotData};
use helio_wire::{chunk_message, ChunkCodec, Direction, MessageIdAllocator, Reassembler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// Applies replicated state on the replica. The engine implements this
/// over its transaction manager and local log.
pub trait RecordApplier: Send + Sync {
    /// Newest version applied locally.
    fn applied_version(&self) -> Version;
    /// Apply one record; ascending commit order is guaranteed, duplicates
    /// (after reconnect) must be ignored.
    fn apply(&self, record: &LogRecord) -> Result<()>;
    /// Replace local state with a transferred snapshot.
    fn install_snapshot(&self, commit_version: Version, snapshots: Vec<SnapshotData>)
        -> Result<()>;
}

/// Replica tailing configuration.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// This node's name, announced in Hello.
    pub node: String,
    /// The source's replication endpoint.
    pub source_addr: String,
    /// Acknowledge at least this often while records flow.
    pub ack_interval: Duration,
    /// Delay between reconnection attempts.
    pub reconnect_delay: Duration,
}

/// The replica-side tailing task.
pub struct ReplicaClient {
    config: ReplicaConfig,
    applier: Arc<dyn RecordApplier>,
    shutdown: Arc<AtomicBool>,
}

impl ReplicaClient {
    /// Build a client; nothing runs until [`ReplicaClient::spawn`].
    pub fn new(config: ReplicaConfig, applier: Arc<dyn RecordApplier>) -> Self {
        ReplicaClient {
            config,
            applier,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal handle for stopping the tailing loop.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run the connect/tail/reconnect loop until shutdown.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while !self.shutdown.load(Ordering::Relaxed) {
                match self.tail_once().await {
                    Ok(()) => debug!("replication stream closed cleanly"),
                    Err(e) => warn!(error = %e, "replication stream failed"),
                }
                if self.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                tokio::time::sleep(self.config.reconnect_delay).await;
            }
            info!(node = %self.config.node, "replica tailing stopped");
        })
    }

    async fn tail_once(&self) -> Result<()> {
        let stream = TcpStream::connect(&self.config.source_addr)
            .await
            .map_err(Error::from)?;
        let (read_half, mut write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, ChunkCodec);
        let mut reassembler = Reassembler::new(4096, Duration::from_secs(30));
        let ids = MessageIdAllocator::new(Direction::Client);

        let hello = ReplicationMsg::Hello {
            node: self.config.node.clone(),
            applied_version: self.applier.applied_version(),
        };
        send_msg(&mut write_half, &ids, &hello).await?;
        info!(source = %self.config.source_addr, "tailing source");

        // First ack doubles as the catch-up progress report, so an
        // already-aligned replica promotes without waiting for traffic.
        let mut last_acked_version = self.applier.applied_version();
        send_msg(
            &mut write_half,
            &ids,
            &ReplicationMsg::Ack {
                applied_version: last_acked_version,
            },
        )
        .await?;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(());
            }
            let next = tokio::time::timeout(self.config.ack_interval, frames.next()).await;
            match next {
                Err(_) => {
                    // Idle interval: heartbeat so the source's timeouts
                    // stay quiet, and refresh the ack.
                    send_msg(&mut write_half, &ids, &ReplicationMsg::Heartbeat).await?;
                    let applied = self.applier.applied_version();
                    if applied > last_acked_version {
                        send_msg(
                            &mut write_half,
                            &ids,
                            &ReplicationMsg::Ack {
                                applied_version: applied,
                            },
                        )
                        .await?;
                        last_acked_version = applied;
                    }
                }
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(chunk))) => {
                    let Some((_, payload)) = reassembler.push(chunk)? else {
                        continue;
                    };
                    match ReplicationMsg::decode(&payload)? {
                        ReplicationMsg::SnapshotTransfer {
                            commit_version,
                            snapshots,
                        } => {
                            info!(commit_version, "installing snapshot transfer");
                            let applier = Arc::clone(&self.applier);
                            tokio::task::spawn_blocking(move || {
                                applier.install_snapshot(commit_version, snapshots)
                            })
                            .await
                            .map_err(|_| Error::InvalidState("apply task died".into()))??;
                        }
                        ReplicationMsg::Record(record) => {
                            if record.commit_version > self.applier.applied_version() {
                                let applier = Arc::clone(&self.applier);
                                tokio::task::spawn_blocking(move || applier.apply(&record))
                                    .await
                                    .map_err(|_| Error::InvalidState("apply task died".into()))??;
                            }
                            // Ack whenever the applied version advanced; a
                            // sync primary is blocked until it hears this.
                            let applied = self.applier.applied_version();
                            if applied > last_acked_version {
                                send_msg(
                                    &mut write_half,
                                    &ids,
                                    &ReplicationMsg::Ack {
                                        applied_version: applied,
                                    },
                                )
                                .await?;
                                last_acked_version = applied;
                            }
                        }
                        ReplicationMsg::Heartbeat => {}
                        ReplicationMsg::Hello { .. } | ReplicationMsg::Ack { .. } => {
                            return Err(Error::Communication(CommunicationKind::CorruptMessage));
                        }
                    }
                }
            }
        }
    }
}

async fn send_msg(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    ids: &MessageIdAllocator,
    msg: &ReplicationMsg,
) -> Result<()> {
    let bytes = msg.encode()?;
    for chunk in chunk_message(ids.next(), &bytes) {
        write_half.write_all(&chunk).await.map_err(Error::from)?;
    }
    Ok(())
}
