//! Replication scenarios: synchronous commit gating when the standby
//! dies, log shipping with catch-up, and witness-arbitrated failover.

mod common;

use common::{book, open_db, title_of, BOOK};
use heliodb::error::{CommunicationKind, ConflictKind};
use heliodb::{Error, TxnKind};
use helio_engine::EngineApplier;
use helio_replication::replica::{ReplicaClient, ReplicaConfig};
use helio_replication::witness::SharedFolderWitness;
use helio_replication::{
    ElectionManager, ElectionOutcome, LocalWriteRole, PeerLink, ReplicaConnState,
};
use helio_replication::RecordApplier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An applier that can be frozen, standing in for a standby that died
/// mid-commit: the connection stays up but acknowledgements stop.
struct FreezableApplier {
    inner: EngineApplier,
    frozen: Arc<AtomicBool>,
}

impl RecordApplier for FreezableApplier {
    fn applied_version(&self) -> u64 {
        self.inner.applied_version()
    }

    fn apply(&self, record: &helio_durability::LogRecord) -> heliodb::Result<()> {
        while self.frozen.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.inner.apply(record)
    }

    fn install_snapshot(
        &self,
        commit_version: u64,
        snapshots: Vec<helio_durability::SnapshotData>,
    ) -> heliodb::Result<()> {
        self.inner.install_snapshot(commit_version, snapshots)
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

// === Scenario: synchronous replication with a dying standby ===

#[tokio::test(flavor = "multi_thread")]
async fn sync_commit_aborts_when_the_standby_dies_and_recovers_after_return() {
    let primary_dir = tempfile::tempdir().unwrap();
    let standby_dir = tempfile::tempdir().unwrap();

    let primary = {
        let mut config = heliodb::DatabaseConfig::standalone("n1", primary_dir.path());
        config.hub.synchronous = true;
        config.hub.ack_timeout = Duration::from_millis(1000);
        heliodb::Database::open(
            config,
            heliodb::AssemblyBundle::for_model(common::book_model()),
        )
        .unwrap()
    };
    primary.hub().register_replica("n2", true);
    let (_hub_task, hub_addr) = Arc::clone(primary.hub())
        .serve("127.0.0.1:0")
        .await
        .unwrap();

    let standby = open_db("n2", standby_dir.path());
    let frozen = Arc::new(AtomicBool::new(false));
    let tailer = ReplicaClient::new(
        ReplicaConfig {
            node: "n2".to_string(),
            source_addr: hub_addr.to_string(),
            ack_interval: Duration::from_millis(50),
            reconnect_delay: Duration::from_millis(100),
        },
        Arc::new(FreezableApplier {
            inner: EngineApplier(Arc::clone(&standby)),
            frozen: Arc::clone(&frozen),
        }),
    );
    let tailer_task = tailer.spawn();

    // The standby connects, aligns, and becomes the sync replica.
    let hub = Arc::clone(primary.hub());
    wait_for("standby to reach ConnectedSync", Duration::from_secs(5), || {
        hub.statuses()
            .iter()
            .any(|r| r.state == ReplicaConnState::ConnectedSync)
    })
    .await;

    // A synchronous commit succeeds while the standby acknowledges.
    let p = Arc::clone(&primary);
    let id = tokio::task::spawn_blocking(move || {
        let mut txn = p.begin(TxnKind::ReadWrite).unwrap();
        let id = txn.create(BOOK, book("Replicated", "Author")).unwrap();
        txn.commit().unwrap();
        id
    })
    .await
    .unwrap();

    // The record lands on the standby.
    let s = Arc::clone(&standby);
    wait_for("standby to apply the record", Duration::from_secs(5), || {
        s.manager().current_version() >= 1
    })
    .await;
    let s = Arc::clone(&standby);
    let replicated_title = tokio::task::spawn_blocking(move || {
        let mut read = s.begin(TxnKind::Read).unwrap();
        title_of(&read.get(id).unwrap().unwrap())
    })
    .await
    .unwrap();
    assert_eq!(replicated_title, "Replicated");

    // The standby dies mid-commit: acknowledgements stop while the
    // in-flight synchronous commit waits, so it times out and aborts;
    // the replica is demoted.
    frozen.store(true, Ordering::Relaxed);
    let p = Arc::clone(&primary);
    let (err, doomed_id) = tokio::task::spawn_blocking(move || {
        let mut txn = p.begin(TxnKind::ReadWrite).unwrap();
        let doomed_id = txn.create(BOOK, book("Doomed", "Author")).unwrap();
        (txn.commit().unwrap_err(), doomed_id)
    })
    .await
    .unwrap();
    assert_eq!(err, Error::Communication(CommunicationKind::Timeout));

    // Nothing from the aborted commit is visible on the primary.
    let p = Arc::clone(&primary);
    let doomed_visible = tokio::task::spawn_blocking(move || {
        let mut read = p.begin(TxnKind::Read).unwrap();
        read.get(doomed_id).unwrap().is_some()
    })
    .await
    .unwrap();
    assert!(!doomed_visible, "aborted commits publish nothing");

    // Finish killing the dead standby's stream.
    tailer_task.abort();

    // With the dead replica demoted, later commits proceed, and when the
    // standby returns it catches up from its applied version.
    let p = Arc::clone(&primary);
    tokio::task::spawn_blocking(move || {
        let mut txn = p.begin(TxnKind::ReadWrite).unwrap();
        txn.create(BOOK, book("AfterDemotion", "Author")).unwrap();
        txn.commit().unwrap();
    })
    .await
    .unwrap();

    let returned = ReplicaClient::new(
        ReplicaConfig {
            node: "n2".to_string(),
            source_addr: hub_addr.to_string(),
            ack_interval: Duration::from_millis(50),
            reconnect_delay: Duration::from_millis(100),
        },
        Arc::new(EngineApplier(Arc::clone(&standby))),
    );
    let _returned_task = returned.spawn();

    let p = Arc::clone(&primary);
    let s = Arc::clone(&standby);
    wait_for("standby to catch up", Duration::from_secs(5), || {
        s.manager().current_version() == p.manager().current_version()
    })
    .await;

    primary.shutdown();
    standby.shutdown();
}

// === Scenario: witness-arbitrated failover ===

struct QuietPeer;
impl PeerLink for QuietPeer {
    fn send_heartbeat(
        &self,
        _: &str,
        _: LocalWriteRole,
        _: u64,
    ) -> heliodb::Result<()> {
        Err(Error::Communication(CommunicationKind::Closed))
    }
    fn confirm_promotion(&self, _: &str) -> heliodb::Result<bool> {
        Err(Error::Communication(CommunicationKind::Closed))
    }
    fn request_promotion(&self) -> heliodb::Result<()> {
        Err(Error::Communication(CommunicationKind::Closed))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn standby_is_elected_within_the_election_timeout() {
    let witness_dir = tempfile::tempdir().unwrap();
    let election_timeout = Duration::from_millis(2000);

    let witness_a = Arc::new(SharedFolderWitness::new(
        witness_dir.path(),
        Duration::from_secs(1),
    ));
    let witness_b = Arc::new(SharedFolderWitness::new(
        witness_dir.path(),
        Duration::from_secs(1),
    ));

    let a = ElectionManager::new(
        "n1",
        witness_a,
        Arc::new(QuietPeer),
        election_timeout,
        Arc::new(|| 0),
    );
    let b = ElectionManager::new(
        "n2",
        witness_b,
        Arc::new(QuietPeer),
        election_timeout,
        Arc::new(|| 0),
    );

    // n1 wins the initial election; n2 stays standby while the witness is
    // held.
    assert_eq!(a.try_become_primary(), ElectionOutcome::Success);
    assert_eq!(b.try_become_primary(), ElectionOutcome::Busy);
    assert_eq!(b.role(), LocalWriteRole::Standby);

    let driver = b.start(Duration::from_millis(50));

    // The primary disappears: its process dies, which releases its witness
    // claim (simulated here by stepping down).
    let vanished_at = Instant::now();
    a.step_down();

    let b2 = Arc::clone(&b);
    wait_for("standby to win the election", Duration::from_secs(10), move || {
        b2.role() == LocalWriteRole::Primary
    })
    .await;
    // Heartbeats were never flowing, so the standby's timeout had already
    // matured: the takeover completes within roughly one election timeout.
    assert!(
        vanished_at.elapsed() < election_timeout + Duration::from_secs(1),
        "takeover exceeded the election timeout window"
    );

    b.shutdown();
    driver.join().unwrap();
}

// === Scenario: conflicts replicate as versions, not as races ===

#[tokio::test(flavor = "multi_thread")]
async fn replicated_versions_preserve_commit_order() {
    let primary_dir = tempfile::tempdir().unwrap();
    let standby_dir = tempfile::tempdir().unwrap();

    let primary = open_db("n1", primary_dir.path());
    primary.hub().register_replica("n2", false);
    let (_hub_task, hub_addr) = Arc::clone(primary.hub())
        .serve("127.0.0.1:0")
        .await
        .unwrap();

    let standby = open_db("n2", standby_dir.path());
    let tailer = ReplicaClient::new(
        ReplicaConfig {
            node: "n2".to_string(),
            source_addr: hub_addr.to_string(),
            ack_interval: Duration::from_millis(50),
            reconnect_delay: Duration::from_millis(100),
        },
        Arc::new(EngineApplier(Arc::clone(&standby))),
    );
    tailer.spawn();

    // A chain of dependent commits, including a conflict that must not
    // ship anywhere.
    let p = Arc::clone(&primary);
    let id = tokio::task::spawn_blocking(move || {
        let mut txn = p.begin(TxnKind::ReadWrite).unwrap();
        let id = txn.create(BOOK, book("v1", "a")).unwrap();
        txn.commit().unwrap();

        let mut stale = p.begin(TxnKind::ReadWrite).unwrap();
        stale.get(id).unwrap();

        let mut fresh = p.begin(TxnKind::ReadWrite).unwrap();
        fresh.update(id, book("v2", "a")).unwrap();
        fresh.commit().unwrap();

        stale.update(id, book("stale", "a")).unwrap();
        assert_eq!(
            stale.commit().unwrap_err(),
            Error::Conflict(ConflictKind::WriteAfterRead)
        );
        id
    })
    .await
    .unwrap();

    let s = Arc::clone(&standby);
    let p = Arc::clone(&primary);
    wait_for("standby to apply both versions", Duration::from_secs(5), || {
        s.manager().current_version() == p.manager().current_version()
    })
    .await;

    let s = Arc::clone(&standby);
    let title = tokio::task::spawn_blocking(move || {
        let mut read = s.begin(TxnKind::Read).unwrap();
        title_of(&read.get(id).unwrap().unwrap())
    })
    .await
    .unwrap();
    assert_eq!(title, "v2", "the standby sees the committed head, never the aborted write");

    primary.shutdown();
    standby.shutdown();
}
