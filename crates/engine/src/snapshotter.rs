//! Periodic snapshots.
//!
//! A background thread captures each stream's object state at the current
//! committed version and hands it to the durability layer, which writes
//! atomically and then releases the log segments the snapshot covers.

use crate::database::Database;
use helio_core::types::Version;
use helio_durability::{SnapshotData, SnapshotObject};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// Capture per-stream snapshot data at `version`.
pub fn capture(db: &Database, version: Version) -> Vec<SnapshotData> {
    let model = db.model();
    let mut per_stream: Vec<SnapshotData> = (0..db.streams().len())
        .map(|_| SnapshotData {
            commit_version: version,
            classes: Vec::new(),
        })
        .collect();

    for partition in db.manager().store().partitions() {
        let class_id = partition.class_id();
        let stream = model
            .class(class_id)
            .map(|c| c.log_stream as usize)
            .unwrap_or(0)
            .min(per_stream.len() - 1);
        let mut objects = Vec::with_capacity(partition.len());
        partition.for_each(|sequence, chain| {
            if let Some(visible) = chain.visible_at(version) {
                if !visible.tombstone {
                    objects.push(SnapshotObject {
                        object_id: helio_core::types::ObjectId::new(class_id, sequence),
                        commit_version: visible.commit_version,
                        block: visible.block.clone(),
                    });
                }
            }
        });
        if !objects.is_empty() {
            per_stream[stream].classes.push((class_id, objects));
        }
    }
    per_stream
}

/// The background snapshot task. Holds the database weakly so the task
/// cannot keep a shut-down database (and its log locks) alive.
pub struct Snapshotter {
    db: Weak<Database>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl Snapshotter {
    /// Build a snapshotter over `db`.
    pub fn new(db: Weak<Database>, interval: Duration) -> Self {
        Snapshotter {
            db,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the background thread.
    pub fn start(&self) -> JoinHandle<()> {
        let db = self.db.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;
        std::thread::Builder::new()
            .name("helio-snapshot".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    let mut slept = Duration::ZERO;
                    while slept < interval && !shutdown.load(Ordering::Relaxed) {
                        let slice = Duration::from_millis(100).min(interval - slept);
                        std::thread::sleep(slice);
                        slept += slice;
                    }
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let Some(db) = db.upgrade() else { break };
                    match db.snapshot_now() {
                        Ok(version) => info!(version, "periodic snapshot complete"),
                        Err(e) => warn!(error = %e, "periodic snapshot failed"),
                    }
                }
            })
            .expect("spawn snapshot thread")
    }

    /// Stop after the current slice.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
