//! Primary-side replication: the hub.
//!
//! The hub owns one handle per configured replica, retains a window of
//! recent commit records for resumable catch-up, and serves the
//! replication endpoint. A committing transaction calls [`ReplicationHub::ship`]
//! after its local log append: the record is broadcast in commit order,
//! and in synchronous mode the call blocks until every connected sync
//! replica acknowledges (or times out, demoting the replica and aborting
//! the commit).

use crate::protocol::ReplicationMsg;
use crate::roles::{ReplicaConnState, ReplicaStatus};
use helio_core::error::{CommunicationKind, Error, Result};
use helio_core::types::Version;
use helio_durability::{LogRecord, SnapshotData};
use helio_wire::{chunk_message, ChunkCodec, MessageIdAllocator, Reassembler};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// Provides a full-state snapshot when a replica's gap exceeds the
/// retained log. The engine implements this over its store and streams.
pub trait StateProvider: Send + Sync {
    /// Capture the complete current state.
    fn full_state(&self) -> Result<(Version, Vec<SnapshotData>)>;
}

/// One configured replica, as tracked by the primary.
pub struct ReplicaHandle {
    name: String,
    sync: bool,
    state: Mutex<ReplicaConnState>,
    aligned: AtomicBool,
    applied: AtomicU64,
    ack_signal: Condvar,
    ack_lock: Mutex<()>,
    sender: Mutex<Option<mpsc::Sender<ReplicationMsg>>>,
}

impl ReplicaHandle {
    fn new(name: &str, sync: bool) -> Arc<Self> {
        Arc::new(ReplicaHandle {
            name: name.to_string(),
            sync,
            state: Mutex::new(ReplicaConnState::NotStarted),
            aligned: AtomicBool::new(false),
            applied: AtomicU64::new(0),
            ack_signal: Condvar::new(),
            ack_lock: Mutex::new(()),
            sender: Mutex::new(None),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ReplicaConnState {
        *self.state.lock()
    }

    /// Newest acknowledged version.
    pub fn applied(&self) -> Version {
        self.applied.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ReplicaConnState) {
        *self.state.lock() = state;
    }

    fn disconnect(&self) {
        self.set_state(ReplicaConnState::Disconnected);
        self.aligned.store(false, Ordering::Release);
        *self.sender.lock() = None;
        // Wake any commit stuck waiting on this replica.
        self.ack_signal.notify_all();
    }

    fn record_ack(&self, applied: Version, primary_committed: Version, tolerance: u64) {
        self.applied.fetch_max(applied, Ordering::AcqRel);
        let aligned = applied + tolerance >= primary_committed;
        self.aligned.store(aligned, Ordering::Release);
        if aligned {
            let mut state = self.state.lock();
            if *state == ReplicaConnState::ConnectedPendingSync {
                *state = if self.sync {
                    ReplicaConnState::ConnectedSync
                } else {
                    ReplicaConnState::ConnectedAsync
                };
                info!(replica = %self.name, sync = self.sync, "replica caught up");
            }
        }
        self.ack_signal.notify_all();
    }

    /// Block until the replica acknowledges `version` or the deadline
    /// passes. Returns false on timeout or disconnect.
    fn wait_for_ack(&self, version: Version, deadline: Instant) -> bool {
        let mut guard = self.ack_lock.lock();
        loop {
            if self.applied() >= version {
                return true;
            }
            if self.state() == ReplicaConnState::Disconnected {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.ack_signal.wait_until(&mut guard, deadline);
        }
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Block commits on sync-replica acknowledgement.
    pub synchronous: bool,
    /// Bound on the sync acknowledgement wait.
    pub ack_timeout: Duration,
    /// `aligned` once `applied + tolerance >= committed`.
    pub align_tolerance: u64,
    /// Records retained for resumable catch-up.
    pub retain_records: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            synchronous: false,
            ack_timeout: Duration::from_secs(5),
            align_tolerance: 16,
            retain_records: 16 * 1024,
        }
    }
}

/// Marker alias: the hub is also the thing a commit calls into, see
/// [`ReplicationHub::ship`].
pub type ReplicationSink = ReplicationHub;

/// The primary's replication state.
pub struct ReplicationHub {
    config: HubConfig,
    /// Recent records, ascending by commit version. The mutex also orders
    /// catch-up installation against live broadcast.
    retained: Mutex<VecDeque<LogRecord>>,
    replicas: RwLock<Vec<Arc<ReplicaHandle>>>,
    latest_version: AtomicU64,
    state_provider: RwLock<Option<Arc<dyn StateProvider>>>,
    ids: MessageIdAllocator,
}

impl ReplicationHub {
    /// An empty hub.
    pub fn new(config: HubConfig) -> Arc<Self> {
        Arc::new(ReplicationHub {
            config,
            retained: Mutex::new(VecDeque::new()),
            replicas: RwLock::new(Vec::new()),
            latest_version: AtomicU64::new(0),
            state_provider: RwLock::new(None),
            ids: MessageIdAllocator::new(helio_wire::Direction::Server),
        })
    }

    /// Install the snapshot-transfer provider.
    pub fn set_state_provider(&self, provider: Arc<dyn StateProvider>) {
        *self.state_provider.write() = Some(provider);
    }

    /// Pre-register a configured replica.
    pub fn register_replica(&self, name: &str, sync: bool) -> Arc<ReplicaHandle> {
        let handle = ReplicaHandle::new(name, sync);
        self.replicas.write().push(Arc::clone(&handle));
        handle
    }

    /// Seed the hub's version clock after recovery.
    pub fn set_latest_version(&self, version: Version) {
        self.latest_version.fetch_max(version, Ordering::AcqRel);
    }

    /// Status of every configured replica.
    pub fn statuses(&self) -> Vec<ReplicaStatus> {
        self.replicas
            .read()
            .iter()
            .map(|r| ReplicaStatus {
                name: r.name.clone(),
                state: r.state(),
                aligned: r.aligned.load(Ordering::Acquire),
                applied_version: r.applied(),
            })
            .collect()
    }

    /// Ship one committed record. Broadcast happens in commit order; in
    /// synchronous mode the call returns only after every connected sync
    /// replica acknowledged, or fails with a timeout after demoting the
    /// quiet replica.
    pub fn ship(&self, record: &LogRecord) -> Result<()> {
        let version = record.commit_version;
        self.latest_version.fetch_max(version, Ordering::AcqRel);
        let sync_targets: Vec<Arc<ReplicaHandle>> = {
            let mut retained = self.retained.lock();
            retained.push_back(record.clone());
            while retained.len() > self.config.retain_records {
                retained.pop_front();
            }
            let replicas = self.replicas.read();
            for replica in replicas.iter() {
                let sender = replica.sender.lock().clone();
                if let Some(sender) = sender {
                    if sender
                        .try_send(ReplicationMsg::Record(record.clone()))
                        .is_err()
                    {
                        warn!(replica = %replica.name, "replica stream congested, demoting");
                        replica.disconnect();
                    }
                }
            }
            replicas
                .iter()
                .filter(|r| r.sync && r.state() == ReplicaConnState::ConnectedSync)
                .cloned()
                .collect()
        };

        if !self.config.synchronous {
            return Ok(());
        }
        let deadline = Instant::now() + self.config.ack_timeout;
        for replica in sync_targets {
            if !replica.wait_for_ack(version, deadline) {
                warn!(replica = %replica.name, version, "sync ack timeout, demoting replica");
                replica.disconnect();
                // The transaction aborts: drop its record from the
                // catch-up window so a reconnecting replica never
                // resumes onto an aborted commit.
                self.retained
                    .lock()
                    .retain(|r| r.commit_version != version);
                return Err(Error::Communication(CommunicationKind::Timeout));
            }
        }
        Ok(())
    }

    /// Serve the replication endpoint.
    pub async fn serve(
        self: Arc<Self>,
        addr: &str,
    ) -> Result<(tokio::task::JoinHandle<()>, SocketAddr)> {
        let listener = TcpListener::bind(addr).await.map_err(Error::from)?;
        let local = listener.local_addr().map_err(Error::from)?;
        info!(%local, "replication endpoint listening");
        let hub = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "replica connected");
                        let hub = Arc::clone(&hub);
                        tokio::spawn(async move {
                            if let Err(e) = hub.handle_replica(stream).await {
                                debug!(%peer, error = %e, "replica stream ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "replication accept failed");
                        break;
                    }
                }
            }
        });
        Ok((handle, local))
    }

    async fn handle_replica(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, ChunkCodec);
        let mut reassembler = Reassembler::new(4096, Duration::from_secs(30));

        // The stream must open with Hello.
        let hello = loop {
            let chunk = frames
                .next()
                .await
                .ok_or(Error::Communication(CommunicationKind::Closed))??;
            if let Some((_, payload)) = reassembler.push(chunk)? {
                break ReplicationMsg::decode(&payload)?;
            }
        };
        let (node, applied_version) = match hello {
            ReplicationMsg::Hello {
                node,
                applied_version,
            } => (node, applied_version),
            _ => return Err(Error::Communication(CommunicationKind::CorruptMessage)),
        };

        let replica = self
            .replicas
            .read()
            .iter()
            .find(|r| r.name == node)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument {
                field: "node".to_string(),
                reason: format!("'{node}' is not a configured replica"),
            })?;
        info!(replica = %node, applied_version, "replica hello");
        replica.applied.store(applied_version, Ordering::Release);
        replica.set_state(ReplicaConnState::ConnectedPendingSync);

        // Install the live stream and the catch-up backlog atomically with
        // respect to ship(), so the replica sees every record exactly once
        // and in commit order.
        let (tx, mut rx) = mpsc::channel::<ReplicationMsg>(4096);
        {
            let retained = self.retained.lock();
            let oldest_retained = retained.front().map(|r| r.commit_version);
            let resumable = match oldest_retained {
                None => true,
                Some(oldest) => applied_version + 1 >= oldest,
            };
            if !resumable {
                // History past the replica's position was truncated; only
                // a full state transfer can close the gap.
                let provider = self
                    .state_provider
                    .read()
                    .clone()
                    .ok_or_else(|| Error::InvalidState("no state provider".to_string()))?;
                let (commit_version, snapshots) = provider.full_state()?;
                tx.try_send(ReplicationMsg::SnapshotTransfer {
                    commit_version,
                    snapshots,
                })
                .map_err(|_| Error::Communication(CommunicationKind::Closed))?;
                for record in retained.iter().filter(|r| r.commit_version > commit_version) {
                    tx.try_send(ReplicationMsg::Record(record.clone()))
                        .map_err(|_| Error::Communication(CommunicationKind::Closed))?;
                }
            } else {
                for record in retained.iter().filter(|r| r.commit_version > applied_version) {
                    tx.try_send(ReplicationMsg::Record(record.clone()))
                        .map_err(|_| Error::Communication(CommunicationKind::Closed))?;
                }
            }
            *replica.sender.lock() = Some(tx);
        }

        // Writer: drain queued messages onto the socket.
        let writer_replica = Arc::clone(&replica);
        let ids_hub = Arc::clone(&self);
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let bytes = match msg.encode() {
                    Ok(b) => b,
                    Err(_) => break,
                };
                let id = ids_hub.ids.next();
                let mut failed = false;
                for chunk in chunk_message(id, &bytes) {
                    if write_half.write_all(&chunk).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }
            writer_replica.disconnect();
        });

        // Reader: acknowledgements and heartbeats.
        let result = loop {
            let chunk = match frames.next().await {
                None => break Ok(()),
                Some(Err(e)) => break Err(e),
                Some(Ok(chunk)) => chunk,
            };
            let completed = match reassembler.push(chunk) {
                Ok(completed) => completed,
                Err(e) => break Err(e),
            };
            let Some((_, payload)) = completed else {
                continue;
            };
            match ReplicationMsg::decode(&payload) {
                Ok(ReplicationMsg::Ack { applied_version }) => {
                    replica.record_ack(
                        applied_version,
                        self.latest_version.load(Ordering::Acquire),
                        self.config.align_tolerance,
                    );
                }
                Ok(ReplicationMsg::Heartbeat) => {}
                Ok(_) => break Err(Error::Communication(CommunicationKind::CorruptMessage)),
                Err(e) => break Err(e),
            }
        };

        replica.disconnect();
        writer.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cv: Version) -> LogRecord {
        LogRecord {
            commit_version: cv,
            tx_id: cv,
            writes: Vec::new(),
        }
    }

    #[test]
    fn async_mode_never_blocks_commits() {
        let hub = ReplicationHub::new(HubConfig::default());
        hub.register_replica("r1", false);
        // No replica connected; shipping still succeeds immediately.
        hub.ship(&record(1)).unwrap();
        hub.ship(&record(2)).unwrap();
        let statuses = hub.statuses();
        assert_eq!(statuses[0].state, ReplicaConnState::NotStarted);
    }

    #[test]
    fn sync_mode_fails_fast_without_acks() {
        let hub = ReplicationHub::new(HubConfig {
            synchronous: true,
            ack_timeout: Duration::from_millis(50),
            ..HubConfig::default()
        });
        let replica = hub.register_replica("r1", true);
        // Simulate a connected sync replica that never acks.
        replica.set_state(ReplicaConnState::ConnectedSync);
        *replica.sender.lock() = Some(mpsc::channel(16).0);

        let err = hub.ship(&record(1)).unwrap_err();
        assert_eq!(err, Error::Communication(CommunicationKind::Timeout));
        assert_eq!(replica.state(), ReplicaConnState::Disconnected);

        // After the demotion, commits proceed.
        hub.ship(&record(2)).unwrap();
    }

    #[test]
    fn acks_unblock_sync_commits_and_promote() {
        let hub = ReplicationHub::new(HubConfig {
            synchronous: true,
            ack_timeout: Duration::from_secs(5),
            align_tolerance: 0,
            ..HubConfig::default()
        });
        let replica = hub.register_replica("r1", true);
        replica.set_state(ReplicaConnState::ConnectedPendingSync);
        *replica.sender.lock() = Some(mpsc::channel(16).0);
        hub.set_latest_version(0);

        // Catch-up ack promotes the replica to ConnectedSync.
        replica.record_ack(0, 0, 0);
        assert_eq!(replica.state(), ReplicaConnState::ConnectedSync);

        let hub2 = Arc::clone(&hub);
        let acker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let replica = hub2.replicas.read()[0].clone();
            replica.record_ack(1, 1, 0);
        });
        hub.ship(&record(1)).unwrap();
        acker.join().unwrap();
        assert_eq!(replica.applied(), 1);
        assert!(replica.aligned.load(Ordering::Acquire));
    }

    #[test]
    fn retained_window_is_bounded() {
        let hub = ReplicationHub::new(HubConfig {
            retain_records: 4,
            ..HubConfig::default()
        });
        for cv in 1..=10 {
            hub.ship(&record(cv)).unwrap();
        }
        let retained = hub.retained.lock();
        assert_eq!(retained.len(), 4);
        assert_eq!(retained.front().unwrap().commit_version, 7);
    }
}
