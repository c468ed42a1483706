//! Local-write leader election.
//!
//! Two members, one witness. The primary heartbeats its peer; a standby
//! that has not heard a heartbeat for the election timeout starts an
//! election. A node may become Primary only if it claims the witness OR
//! its peer explicitly confirms the promotion. One of the two must hold,
//! which rules out split-brain under any single failure.

use crate::roles::LocalWriteRole;
use crate::witness::Witness;
use helio_core::error::Result;
use helio_core::types::Version;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Result of an election-affecting request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionOutcome {
    /// The requested role change happened.
    Success,
    /// The caller is not in a local-write cluster, or holds the wrong
    /// role for the request.
    NotApplicable,
    /// An election is already in progress; retry later.
    Busy,
}

/// The channel to the cluster peer. The engine backs this with an RPC
/// client against the peer's election endpoint; tests wire two managers
/// directly.
pub trait PeerLink: Send + Sync {
    /// Deliver a heartbeat. Errors mean the peer is unreachable.
    fn send_heartbeat(&self, from: &str, role: LocalWriteRole, committed: Version) -> Result<()>;
    /// Ask the peer to confirm the caller's promotion. A reachable peer
    /// that is not itself Primary confirms.
    fn confirm_promotion(&self, from: &str) -> Result<bool>;
    /// Nudge the peer to elect itself (used by administrative failover).
    fn request_promotion(&self) -> Result<()>;
}

/// The per-node election state machine.
pub struct ElectionManager {
    node: String,
    role: Mutex<LocalWriteRole>,
    witness: Arc<dyn Witness>,
    peer: Arc<dyn PeerLink>,
    election_timeout: Duration,
    last_peer_heartbeat: Mutex<Instant>,
    election_in_progress: AtomicBool,
    shutdown: Arc<AtomicBool>,
    committed: Arc<dyn Fn() -> Version + Send + Sync>,
}

impl ElectionManager {
    /// Build a manager starting as Standby.
    pub fn new(
        node: &str,
        witness: Arc<dyn Witness>,
        peer: Arc<dyn PeerLink>,
        election_timeout: Duration,
        committed: Arc<dyn Fn() -> Version + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(ElectionManager {
            node: node.to_string(),
            role: Mutex::new(LocalWriteRole::Standby),
            witness,
            peer,
            election_timeout,
            last_peer_heartbeat: Mutex::new(Instant::now()),
            election_in_progress: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            committed,
        })
    }

    /// This node's current local-write role.
    pub fn role(&self) -> LocalWriteRole {
        *self.role.lock()
    }

    /// This node's name.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Whether the witness currently answers.
    pub fn witness_reachable(&self) -> bool {
        self.witness.is_reachable()
    }

    /// Handle a heartbeat from the peer. Two primaries resolve in favor
    /// of the witness holder; the other steps down.
    pub fn on_peer_heartbeat(&self, peer_role: LocalWriteRole) {
        *self.last_peer_heartbeat.lock() = Instant::now();
        if peer_role == LocalWriteRole::Primary && self.role() == LocalWriteRole::Primary {
            let holds_witness = self.witness.try_claim(&self.node).unwrap_or(false);
            if !holds_witness {
                warn!(node = %self.node, "dual primary detected, stepping down");
                self.step_down();
            }
        }
    }

    /// Handle the peer asking us to confirm its promotion. We confirm
    /// unless we believe we are Primary ourselves.
    pub fn on_confirm_request(&self, _from: &str) -> bool {
        if self.role() == LocalWriteRole::Primary {
            return false;
        }
        *self.last_peer_heartbeat.lock() = Instant::now();
        true
    }

    /// Try to become Primary now.
    pub fn try_become_primary(&self) -> ElectionOutcome {
        if self.role() == LocalWriteRole::Primary {
            return ElectionOutcome::Success;
        }
        if self
            .election_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ElectionOutcome::Busy;
        }
        let outcome = self.run_election();
        self.election_in_progress.store(false, Ordering::Release);
        outcome
    }

    fn run_election(&self) -> ElectionOutcome {
        // Path one: the witness arbitrates.
        match self.witness.try_claim(&self.node) {
            Ok(true) => {
                *self.role.lock() = LocalWriteRole::Primary;
                info!(node = %self.node, "elected primary via witness");
                return ElectionOutcome::Success;
            }
            Ok(false) => {
                // Witness held by the peer: it is (or is becoming) Primary.
                return ElectionOutcome::Busy;
            }
            Err(_) => {}
        }
        // Path two: the witness is unreachable, the peer must confirm.
        match self.peer.confirm_promotion(&self.node) {
            Ok(true) => {
                *self.role.lock() = LocalWriteRole::Primary;
                info!(node = %self.node, "elected primary via peer confirmation");
                ElectionOutcome::Success
            }
            _ => {
                warn!(node = %self.node, "election failed: witness unreachable, no peer confirmation");
                ElectionOutcome::Busy
            }
        }
    }

    /// Demote to Standby and release the witness claim.
    pub fn step_down(&self) {
        *self.role.lock() = LocalWriteRole::Standby;
        if let Err(e) = self.witness.release(&self.node) {
            warn!(node = %self.node, error = %e, "witness release failed");
        }
        info!(node = %self.node, "stepped down to standby");
    }

    /// Administrative failover: the Primary steps down and nudges the
    /// peer to elect itself.
    pub fn request_failover(&self) -> ElectionOutcome {
        if self.role() != LocalWriteRole::Primary {
            return ElectionOutcome::NotApplicable;
        }
        if self.election_in_progress.load(Ordering::Acquire) {
            return ElectionOutcome::Busy;
        }
        self.step_down();
        if let Err(e) = self.peer.request_promotion() {
            warn!(error = %e, "peer promotion nudge failed; it will elect on heartbeat loss");
        }
        ElectionOutcome::Success
    }

    /// Drive heartbeats and timeout-based elections until shutdown.
    pub fn start(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("helio-election-{}", this.node))
            .spawn(move || {
                while !this.shutdown.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    match this.role() {
                        LocalWriteRole::Primary => {
                            let committed = (this.committed)();
                            if this
                                .peer
                                .send_heartbeat(&this.node, LocalWriteRole::Primary, committed)
                                .is_err()
                            {
                                // Peer unreachable. Keep the role while the
                                // witness still backs it.
                                if !this.witness.try_claim(&this.node).unwrap_or(false) {
                                    warn!(node = %this.node, "lost witness while peer is gone");
                                    this.step_down();
                                }
                            }
                        }
                        LocalWriteRole::Standby => {
                            let _ = this.peer.send_heartbeat(
                                &this.node,
                                LocalWriteRole::Standby,
                                (this.committed)(),
                            );
                            let quiet = this.last_peer_heartbeat.lock().elapsed();
                            if quiet > this.election_timeout {
                                info!(node = %this.node, ?quiet, "heartbeat timeout, starting election");
                                this.try_become_primary();
                            }
                        }
                        LocalWriteRole::None => {}
                    }
                }
            })
            .expect("spawn election thread")
    }

    /// Stop the driver thread after its current sleep.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
