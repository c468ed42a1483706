//! The transaction manager.
//!
//! Coordinates the whole commit protocol:
//!
//! ```text
//! 1. mark Validating
//! 2. lock touched classes (striped, ascending class id)
//! 3. validate read fingerprint, scans, writes, unique keys
//! 4. allocate commit_version and append the log record
//!    (DURABILITY POINT: local fsync and, when configured, the
//!    synchronous replica acknowledgement)
//! 5. publish new chain heads and index entries
//! 6. unlock, mark Committed
//! ```
//!
//! A failure before step 4 returns a retriable conflict; a failure in
//! step 4 aborts the transaction with nothing published. After step 4 the
//! transaction cannot be cancelled.
//!
//! Commits on disjoint classes run in parallel; the log-order lock inside
//! step 4 keeps version allocation and record append atomic with respect
//! to each other.

use crate::registry::LiveTransactions;
use crate::sink::CommitSink;
use crate::transaction::{PendingWrite, TransactionContext};
use crate::validation;
use helio_core::error::{Error, NotFoundKind, Result};
use helio_core::model::{IndexKey, KeyRange, ModelDescriptor};
use helio_core::types::{IndexId, ObjectId, TxnKind, Version, WriteOp};
use helio_core::value::PropertyBlock;
use helio_durability::{LogRecord, RecordWrite};
use helio_storage::{IndexSet, ObjectStore, StoredVersion};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Stripe count for the per-class commit locks.
const LOCK_STRIPES: usize = 64;

/// Transaction lifecycle coordinator.
pub struct TransactionManager {
    committed_version: AtomicU64,
    next_txn_id: AtomicU64,
    class_locks: Box<[Mutex<()>]>,
    log_order: Mutex<()>,
    live: Arc<LiveTransactions>,
    store: Arc<ObjectStore>,
    indexes: Arc<IndexSet>,
    sink: Arc<dyn CommitSink>,
}

impl TransactionManager {
    /// A manager starting at version 0 (fresh database).
    pub fn new(store: Arc<ObjectStore>, indexes: Arc<IndexSet>, sink: Arc<dyn CommitSink>) -> Self {
        Self::with_recovered(store, indexes, sink, 0, 0)
    }

    /// A manager resuming after recovery: versions continue above
    /// `committed_version`, transaction ids above `max_txn_id`.
    pub fn with_recovered(
        store: Arc<ObjectStore>,
        indexes: Arc<IndexSet>,
        sink: Arc<dyn CommitSink>,
        committed_version: Version,
        max_txn_id: u64,
    ) -> Self {
        let live = Arc::new(LiveTransactions::new());
        live.advance_floor(committed_version);
        let class_locks: Vec<Mutex<()>> = (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect();
        TransactionManager {
            committed_version: AtomicU64::new(committed_version),
            next_txn_id: AtomicU64::new(max_txn_id + 1),
            class_locks: class_locks.into_boxed_slice(),
            log_order: Mutex::new(()),
            live,
            store,
            indexes,
            sink,
        }
    }

    /// The latest committed version.
    pub fn current_version(&self) -> Version {
        self.committed_version.load(Ordering::SeqCst)
    }

    /// Floor for the garbage collector.
    pub fn min_read_version(&self) -> Version {
        self.live.min_read_version()
    }

    /// The live-transaction registry.
    pub fn live(&self) -> &Arc<LiveTransactions> {
        &self.live
    }

    /// The object store this manager publishes into.
    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// The index set this manager maintains.
    pub fn indexes(&self) -> &Arc<IndexSet> {
        &self.indexes
    }

    // === Transaction operations ===

    /// Begin a transaction against the pinned `model`.
    pub fn begin(&self, kind: TxnKind, model: Arc<ModelDescriptor>) -> TransactionContext {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let read_version = self.committed_version.load(Ordering::SeqCst);
        self.live.register(txn_id, read_version);
        trace!(txn_id, read_version, ?kind, "begin");
        TransactionContext::new(txn_id, kind, read_version, model)
    }

    /// Read an object at the transaction's snapshot, honoring buffered
    /// writes, and record the read in the fingerprint.
    pub fn read(
        &self,
        txn: &mut TransactionContext,
        id: ObjectId,
    ) -> Result<Option<PropertyBlock>> {
        txn.ensure_active()?;
        if let Some(pending) = txn.pending(id) {
            // Read-your-writes: buffered state, no fingerprint entry.
            return Ok(pending.block.clone());
        }
        let partition = self.store.partition_for(id)?;
        let observed = partition.visible_meta(id, txn.read_version);
        txn.fingerprint
            .record_object(id, observed.map(|(v, _)| v).unwrap_or(0));
        match observed {
            Some((_, false)) => Ok(partition.read(id, txn.read_version).and_then(|v| v.block)),
            _ => Ok(None),
        }
    }

    /// Scan a sorted index over `range` at the snapshot, merging buffered
    /// writes, and record the scanned range.
    pub fn scan(
        &self,
        txn: &mut TransactionContext,
        index_id: IndexId,
        range: KeyRange,
    ) -> Result<Vec<(IndexKey, ObjectId)>> {
        txn.ensure_active()?;
        let index = txn.model.index(index_id)?.clone();
        let mut hits = self
            .indexes
            .scan_sorted(index_id, &range, txn.read_version)?;
        txn.fingerprint.record_scan(index_id, range.clone());

        // Read-your-writes: any object this transaction buffered a write
        // for is re-keyed from its buffered block. The committed entry is
        // dropped first, so an update that moved the key never shows at
        // its stale position, and a buffered delete hides the object.
        hits.retain(|(_, id)| txn.pending(*id).is_none());
        for (id, write) in txn.writes_in_order() {
            if id.class_id() != index.class_id {
                continue;
            }
            if let Some(block) = &write.block {
                let key = txn.model.extract_key(&index, block)?;
                if range.contains(&key) {
                    hits.push((key, id));
                }
            }
        }
        hits.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(hits)
    }

    /// Point lookup in a hash index at the snapshot. Recorded as a point
    /// scan so a concurrent insert of the same key fails validation.
    pub fn lookup(
        &self,
        txn: &mut TransactionContext,
        index_id: IndexId,
        key: &IndexKey,
    ) -> Result<Vec<ObjectId>> {
        txn.ensure_active()?;
        let index = txn.model.index(index_id)?.clone();
        let hits = self.indexes.lookup_hash(index_id, key, txn.read_version)?;
        txn.fingerprint
            .record_scan(index_id, KeyRange::point(key.clone()));

        // Read-your-writes, same discipline as scan: buffered writes
        // replace the committed binding entirely.
        let mut hits: Vec<ObjectId> = hits
            .into_iter()
            .filter(|id| txn.pending(*id).is_none())
            .collect();
        for (id, write) in txn.writes_in_order() {
            if id.class_id() != index.class_id {
                continue;
            }
            if let Some(block) = &write.block {
                if txn.model.extract_key(&index, block)? == *key {
                    hits.push(id);
                }
            }
        }
        Ok(hits)
    }

    /// Objects referring to `target` through the declared inverse
    /// reference, as of the snapshot.
    pub fn referrers(
        &self,
        txn: &mut TransactionContext,
        referring_class: u16,
        property: u16,
        target: ObjectId,
    ) -> Result<Vec<ObjectId>> {
        txn.ensure_active()?;
        txn.fingerprint.record_object(
            target,
            self.store
                .partition_for(target)?
                .visible_meta(target, txn.read_version)
                .map(|(v, _)| v)
                .unwrap_or(0),
        );
        Ok(self
            .indexes
            .referrers(referring_class, property, target, txn.read_version))
    }

    /// Create a new object; its id is issued immediately, its version at
    /// commit.
    pub fn insert(
        &self,
        txn: &mut TransactionContext,
        class: u16,
        block: PropertyBlock,
    ) -> Result<ObjectId> {
        txn.ensure_writable()?;
        txn.model.check_block(class, &block)?;
        let id = self.store.partition(class)?.allocate_id();
        txn.buffer_write(
            id,
            PendingWrite {
                op: WriteOp::Insert,
                block: Some(block),
            },
        );
        Ok(id)
    }

    /// Buffer a new version of an existing object.
    pub fn update(
        &self,
        txn: &mut TransactionContext,
        id: ObjectId,
        block: PropertyBlock,
    ) -> Result<()> {
        txn.ensure_writable()?;
        txn.model.check_block(id.class_id(), &block)?;
        self.require_visible(txn, id)?;
        txn.buffer_write(
            id,
            PendingWrite {
                op: WriteOp::Update,
                block: Some(block),
            },
        );
        Ok(())
    }

    /// Buffer a deletion.
    pub fn delete(&self, txn: &mut TransactionContext, id: ObjectId) -> Result<()> {
        txn.ensure_writable()?;
        self.require_visible(txn, id)?;
        txn.buffer_write(
            id,
            PendingWrite {
                op: WriteOp::Delete,
                block: None,
            },
        );
        Ok(())
    }

    /// Gate for update/delete: the object must be visible at the
    /// snapshot. Deliberately leaves no read-fingerprint entry; a write
    /// does not imply a read, and a concurrent newer head must surface as
    /// `WriteAfterWrite` from the write-set check, not as
    /// `WriteAfterRead`.
    fn require_visible(&self, txn: &TransactionContext, id: ObjectId) -> Result<()> {
        if let Some(pending) = txn.pending(id) {
            if pending.op == WriteOp::Delete {
                return Err(Error::NotFound(NotFoundKind::Object(id)));
            }
            return Ok(());
        }
        match self
            .store
            .partition_for(id)?
            .visible_meta(id, txn.read_version)
        {
            Some((_, false)) => Ok(()),
            _ => Err(Error::NotFound(NotFoundKind::Object(id))),
        }
    }

    /// Abort a transaction, discarding all buffered work.
    pub fn abort(&self, txn: &mut TransactionContext) -> Result<()> {
        txn.mark_aborted("aborted by caller")?;
        self.live.unregister(txn.txn_id);
        Ok(())
    }

    // === Commit ===

    /// Run the commit protocol. On a validation conflict the transaction is
    /// aborted and the typed conflict returned; the caller may retry with a
    /// fresh transaction.
    pub fn commit(&self, txn: &mut TransactionContext) -> Result<Version> {
        txn.ensure_active()?;
        if txn.kind == TxnKind::Read || txn.is_read_only() {
            // Snapshot reads serialize at their read version; nothing to
            // validate or publish.
            txn.mark_validating()?;
            txn.mark_committed(txn.read_version)?;
            self.live.unregister(txn.txn_id);
            return Ok(txn.read_version);
        }

        txn.mark_validating()?;
        let guards = self.lock_classes(&txn.touched_classes());

        if let Err(conflict) = validation::validate(txn, &self.store, &self.indexes) {
            drop(guards);
            self.live.unregister(txn.txn_id);
            txn.mark_aborted(conflict.to_string())?;
            return Err(conflict);
        }

        // Durability point. Version allocation and record append stay
        // atomic so the log and the replication stream see commit order.
        let commit_version;
        {
            let _order = self.log_order.lock();
            commit_version = self.committed_version.fetch_add(1, Ordering::SeqCst) + 1;
            let record = self.build_record(txn, commit_version);
            if let Err(e) = self.sink.append(&record) {
                drop(guards);
                self.live.unregister(txn.txn_id);
                txn.mark_aborted(format!("log append failed: {e}"))?;
                return Err(e);
            }
        }

        // Publication: link new heads, update indexes.
        for (id, write) in txn.writes_in_order() {
            let partition = self
                .store
                .partition_for(id)
                .expect("validated write targets a known class");
            let old_block = partition.head_block(id);
            let version = match write.op {
                WriteOp::Delete => StoredVersion::tombstone(commit_version),
                _ => StoredVersion::live(
                    commit_version,
                    write.block.clone().expect("live write carries a block"),
                ),
            };
            partition.publish(id, version);
            self.indexes
                .apply_write(
                    &txn.model,
                    id.class_id(),
                    id,
                    old_block.as_ref(),
                    write.block.as_ref(),
                    commit_version,
                )
                .expect("validated write maintains its indexes");
        }

        drop(guards);
        txn.mark_committed(commit_version)?;
        self.live.unregister(txn.txn_id);
        self.live.advance_floor(commit_version);
        trace!(txn_id = txn.txn_id, commit_version, "committed");
        Ok(commit_version)
    }

    fn build_record(&self, txn: &TransactionContext, commit_version: Version) -> LogRecord {
        LogRecord {
            commit_version,
            tx_id: txn.txn_id,
            writes: txn
                .writes_in_order()
                .map(|(id, write)| RecordWrite {
                    class_id: id.class_id(),
                    op: write.op,
                    object_id: id,
                    block: write.block.clone(),
                })
                .collect(),
        }
    }

    fn lock_classes(&self, classes: &[u16]) -> Vec<MutexGuard<'_, ()>> {
        // Stripe indices, ascending and deduplicated: every committer
        // acquires in the same order, so overlapping commits cannot
        // deadlock.
        let mut stripes: Vec<usize> = classes
            .iter()
            .map(|c| *c as usize % LOCK_STRIPES)
            .collect();
        stripes.sort_unstable();
        stripes.dedup();
        stripes
            .into_iter()
            .map(|s| self.class_locks[s].lock())
            .collect()
    }

    // === Replication / recovery apply ===

    /// Apply a record that already committed elsewhere (log replay or a
    /// replicated record). Publishes without validation and advances the
    /// committed version.
    pub fn apply_record(&self, model: &ModelDescriptor, record: &LogRecord) -> Result<()> {
        let classes: Vec<u16> = {
            let mut c: Vec<u16> = record.writes.iter().map(|w| w.class_id).collect();
            c.sort_unstable();
            c.dedup();
            c
        };
        let guards = self.lock_classes(&classes);
        for write in &record.writes {
            let partition = self.store.partition_for(write.object_id)?;
            partition.observe_id(write.object_id);
            let old_block = partition.head_block(write.object_id);
            let version = match write.op {
                WriteOp::Delete => StoredVersion::tombstone(record.commit_version),
                _ => StoredVersion::live(
                    record.commit_version,
                    write
                        .block
                        .clone()
                        .ok_or_else(|| Error::InvalidState("live write without block".into()))?,
                ),
            };
            partition.publish(write.object_id, version);
            self.indexes.apply_write(
                model,
                write.class_id,
                write.object_id,
                old_block.as_ref(),
                write.block.as_ref(),
                record.commit_version,
            )?;
        }
        drop(guards);
        self.committed_version
            .fetch_max(record.commit_version, Ordering::SeqCst);
        self.live.advance_floor(record.commit_version);
        Ok(())
    }
}
