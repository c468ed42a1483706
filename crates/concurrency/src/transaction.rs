//! Transaction context: the per-transaction state OCC validates.
//!
//! A transaction buffers writes locally and records a fingerprint of what
//! it read: per-object observed versions and per-index scanned key ranges.
//! Nothing becomes visible to other transactions before commit.

use helio_core::error::{Error, Result};
use helio_core::model::{KeyRange, ModelDescriptor};
use helio_core::types::{ClassId, IndexId, ObjectId, TxnId, TxnKind, Version, WriteOp};
use helio_core::value::PropertyBlock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle of a transaction.
///
/// ```text
/// Active ──► Validating ──► Committed(version)
///    │            │
///    └────────────┴───────► Aborted
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnStatus {
    /// Accepting reads and writes.
    Active,
    /// Inside the commit critical section.
    Validating,
    /// Published at the carried commit version.
    Committed(Version),
    /// Discarded.
    Aborted {
        /// Why the transaction ended.
        reason: String,
    },
}

/// One buffered write, applied at commit.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    /// Insert, update, or delete.
    pub op: WriteOp,
    /// The new block; `None` exactly for deletes.
    pub block: Option<PropertyBlock>,
}

/// What a transaction read, for commit-time validation.
#[derive(Debug, Default)]
pub struct ReadFingerprint {
    /// Observed visible commit version per object (0 = object was absent).
    pub objects: FxHashMap<ObjectId, Version>,
    /// Scanned key ranges per index.
    pub scans: Vec<(IndexId, KeyRange)>,
}

impl ReadFingerprint {
    /// Record an object read. A later read of the same object keeps the
    /// first observation; the snapshot can only ever produce one answer.
    pub fn record_object(&mut self, id: ObjectId, observed: Version) {
        self.objects.entry(id).or_insert(observed);
    }

    /// Record a scanned range.
    pub fn record_scan(&mut self, index: IndexId, range: KeyRange) {
        self.scans.push((index, range));
    }

    /// Classes touched by recorded object reads.
    pub fn read_classes(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.objects.keys().map(|id| id.class_id())
    }
}

/// The per-transaction state.
pub struct TransactionContext {
    /// Unique transaction id (read-write transactions only carry a
    /// log-visible id, but reads get one too for registry bookkeeping).
    pub txn_id: TxnId,
    /// Read or read-write, fixed at begin.
    pub kind: TxnKind,
    /// Snapshot version captured at begin; never changes.
    pub read_version: Version,
    /// The model this transaction runs against, pinned so a concurrent
    /// model update cannot pull descriptors out from under it.
    pub model: Arc<ModelDescriptor>,
    /// Buffered writes keyed by object, latest buffered write wins.
    pub write_set: FxHashMap<ObjectId, PendingWrite>,
    /// First-buffered order of the write set, for deterministic apply and
    /// log layout.
    write_order: Vec<ObjectId>,
    /// Read fingerprint.
    pub fingerprint: ReadFingerprint,
    /// Lifecycle state.
    pub status: TxnStatus,
    started: Instant,
}

impl TransactionContext {
    /// A fresh transaction at snapshot `read_version`.
    pub fn new(
        txn_id: TxnId,
        kind: TxnKind,
        read_version: Version,
        model: Arc<ModelDescriptor>,
    ) -> Self {
        TransactionContext {
            txn_id,
            kind,
            read_version,
            model,
            write_set: FxHashMap::default(),
            write_order: Vec::new(),
            fingerprint: ReadFingerprint::default(),
            status: TxnStatus::Active,
            started: Instant::now(),
        }
    }

    /// Whether reads and writes are still accepted.
    pub fn is_active(&self) -> bool {
        matches!(self.status, TxnStatus::Active)
    }

    /// Fail unless the transaction is active.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "transaction {} is {:?}",
                self.txn_id, self.status
            )))
        }
    }

    /// Fail unless the transaction may write.
    pub fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        if self.kind != TxnKind::ReadWrite {
            return Err(Error::InvalidState(format!(
                "transaction {} is read-only",
                self.txn_id
            )));
        }
        Ok(())
    }

    /// Buffer a write. A second write to the same object replaces the
    /// first but keeps its position in apply order.
    pub fn buffer_write(&mut self, id: ObjectId, write: PendingWrite) {
        if self.write_set.insert(id, write).is_none() {
            self.write_order.push(id);
        }
    }

    /// The buffered write for `id`, for read-your-writes.
    pub fn pending(&self, id: ObjectId) -> Option<&PendingWrite> {
        self.write_set.get(&id)
    }

    /// Buffered writes in first-write order.
    pub fn writes_in_order(&self) -> impl Iterator<Item = (ObjectId, &PendingWrite)> {
        self.write_order
            .iter()
            .map(move |id| (*id, self.write_set.get(id).expect("ordered id is buffered")))
    }

    /// Every class the transaction touched: written, read, or scanned.
    /// The commit section locks exactly these, in class-id order.
    pub fn touched_classes(&self) -> Vec<ClassId> {
        let mut classes: Vec<ClassId> = self
            .write_set
            .keys()
            .map(|id| id.class_id())
            .chain(self.fingerprint.read_classes())
            .chain(
                self.fingerprint
                    .scans
                    .iter()
                    .filter_map(|(index, _)| self.model.index(*index).ok().map(|i| i.class_id)),
            )
            .collect();
        classes.sort_unstable();
        classes.dedup();
        classes
    }

    /// Whether the transaction buffered nothing.
    pub fn is_read_only(&self) -> bool {
        self.write_set.is_empty()
    }

    /// Time since begin.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the transaction outlived `timeout`.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.started.elapsed() > timeout
    }

    /// Move to `Validating`. First step of commit.
    pub fn mark_validating(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.status = TxnStatus::Validating;
        Ok(())
    }

    /// Move to `Committed`.
    pub fn mark_committed(&mut self, version: Version) -> Result<()> {
        match self.status {
            TxnStatus::Validating => {
                self.status = TxnStatus::Committed(version);
                Ok(())
            }
            _ => Err(Error::InvalidState(format!(
                "cannot commit transaction {} from {:?}",
                self.txn_id, self.status
            ))),
        }
    }

    /// Abort and drop all buffered work. Legal from `Active` and
    /// `Validating`; terminal states reject.
    pub fn mark_aborted(&mut self, reason: impl Into<String>) -> Result<()> {
        match self.status {
            TxnStatus::Active | TxnStatus::Validating => {
                self.status = TxnStatus::Aborted {
                    reason: reason.into(),
                };
                self.write_set.clear();
                self.write_order.clear();
                Ok(())
            }
            _ => Err(Error::InvalidState(format!(
                "cannot abort transaction {} from {:?}",
                self.txn_id, self.status
            ))),
        }
    }

    /// The abort reason, if aborted.
    pub fn abort_reason(&self) -> Option<&str> {
        match &self.status {
            TxnStatus::Aborted { reason } => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helio_core::value::PropertyValue;

    fn txn(kind: TxnKind) -> TransactionContext {
        TransactionContext::new(1, kind, 10, Arc::new(ModelDescriptor::empty()))
    }

    fn put(n: i64) -> PendingWrite {
        PendingWrite {
            op: WriteOp::Update,
            block: Some(PropertyBlock::new(vec![PropertyValue::I64(n)])),
        }
    }

    // === Lifecycle ===

    #[test]
    fn begins_active() {
        let t = txn(TxnKind::ReadWrite);
        assert!(t.is_active());
        assert_eq!(t.read_version, 10);
        assert!(t.is_read_only());
    }

    #[test]
    fn commit_requires_validating() {
        let mut t = txn(TxnKind::ReadWrite);
        assert!(t.mark_committed(11).is_err());
        t.mark_validating().unwrap();
        t.mark_committed(11).unwrap();
        assert_eq!(t.status, TxnStatus::Committed(11));
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut t = txn(TxnKind::ReadWrite);
        t.mark_aborted("conflict").unwrap();
        assert!(t.mark_validating().is_err());
        assert!(t.mark_aborted("again").is_err());
        assert_eq!(t.abort_reason(), Some("conflict"));
    }

    #[test]
    fn abort_discards_buffered_writes() {
        let mut t = txn(TxnKind::ReadWrite);
        t.buffer_write(ObjectId::new(1, 1), put(1));
        t.mark_aborted("user").unwrap();
        assert!(t.write_set.is_empty());
        assert_eq!(t.writes_in_order().count(), 0);
    }

    #[test]
    fn read_only_transactions_refuse_writes() {
        let t = txn(TxnKind::Read);
        assert!(t.ensure_writable().is_err());
        assert!(t.ensure_active().is_ok());
    }

    // === Write buffering ===

    #[test]
    fn later_write_replaces_but_keeps_order() {
        let mut t = txn(TxnKind::ReadWrite);
        let a = ObjectId::new(1, 1);
        let b = ObjectId::new(1, 2);
        t.buffer_write(a, put(1));
        t.buffer_write(b, put(2));
        t.buffer_write(a, put(3));

        let order: Vec<ObjectId> = t.writes_in_order().map(|(id, _)| id).collect();
        assert_eq!(order, vec![a, b]);
        let block = t.pending(a).unwrap().block.as_ref().unwrap();
        assert_eq!(block.get(0).unwrap().as_i64(), Some(3));
    }

    // === Fingerprint ===

    #[test]
    fn first_observation_wins() {
        let mut fp = ReadFingerprint::default();
        let id = ObjectId::new(1, 1);
        fp.record_object(id, 5);
        fp.record_object(id, 7);
        assert_eq!(fp.objects[&id], 5);
    }

    #[test]
    fn touched_classes_cover_reads_and_writes() {
        let mut t = txn(TxnKind::ReadWrite);
        t.buffer_write(ObjectId::new(3, 1), put(1));
        t.fingerprint.record_object(ObjectId::new(1, 9), 2);
        t.fingerprint.record_object(ObjectId::new(3, 9), 2);
        assert_eq!(t.touched_classes(), vec![1, 3]);
    }
}
