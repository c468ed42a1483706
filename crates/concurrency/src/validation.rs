//! Commit-time validation.
//!
//! Runs under the striped class locks, against the current store state.
//! The first violated rule decides the typed conflict:
//!
//! 1. every fingerprinted object still has the observed head
//!    (`WriteAfterRead`)
//! 2. no scanned range gained an entry after the read version
//!    (`PhantomWrite`)
//! 3. no written object has a head past the read version
//!    (`WriteAfterWrite`)
//! 4. no unique index would gain a duplicate key
//!    (`UniqueIndexViolation`)
//!
//! Reference integrity is checked in the same pass: a block may not point
//! at an object that neither exists at the read version nor is created by
//! this transaction.

use crate::transaction::TransactionContext;
use helio_core::error::{ConflictKind, ConstraintKind, Error, Result};
use helio_core::types::{Version, WriteOp};
use helio_core::value::PropertyValue;
use helio_storage::{IndexSet, ObjectStore};

/// Validate `txn` for commit. The caller holds every touched class lock.
pub fn validate(txn: &TransactionContext, store: &ObjectStore, indexes: &IndexSet) -> Result<()> {
    // Rule 1: anti-dependency check over the read fingerprint.
    for (id, observed) in &txn.fingerprint.objects {
        let current = store
            .partition_for(*id)?
            .head_meta(*id)
            .map(|(v, _)| v)
            .unwrap_or(0);
        if current != *observed {
            return Err(Error::Conflict(ConflictKind::WriteAfterRead));
        }
    }

    // Rule 2: phantom check over scanned ranges.
    for (index, range) in &txn.fingerprint.scans {
        if indexes.any_inserted_after(*index, range, txn.read_version)? {
            return Err(Error::Conflict(ConflictKind::PhantomWrite));
        }
    }

    // Rules 3 and 4 plus reference integrity, per buffered write.
    for (id, write) in txn.writes_in_order() {
        let partition = store.partition_for(id)?;
        let head = partition.head_meta(id).map(|(v, _)| v).unwrap_or(0);
        if head > txn.read_version {
            return Err(Error::Conflict(ConflictKind::WriteAfterWrite));
        }
        if write.op == WriteOp::Insert && head != 0 {
            // A fresh id colliding with an existing chain means id reuse,
            // which only a concurrent writer could cause.
            return Err(Error::Conflict(ConflictKind::WriteAfterWrite));
        }

        if let Some(block) = &write.block {
            for value in block.values() {
                check_reference(txn, store, value)?;
            }
            for index in txn.model.indexes_for_class(id.class_id()) {
                if !index.unique {
                    continue;
                }
                let key = txn.model.extract_key(index, block)?;
                if indexes.unique_collision(index.id, &key, Version::MAX, id)? {
                    return Err(Error::Conflict(ConflictKind::UniqueIndexViolation));
                }
                // Two buffered writes introducing the same unique key are
                // caught here rather than racing each other in the index.
                let duplicate_in_txn = txn
                    .writes_in_order()
                    .filter(|(other, _)| *other != id)
                    .filter_map(|(_, w)| w.block.as_ref())
                    .filter_map(|b| txn.model.extract_key(index, b).ok())
                    .any(|other_key| other_key == key);
                if duplicate_in_txn {
                    return Err(Error::Conflict(ConflictKind::UniqueIndexViolation));
                }
            }
        }
    }
    Ok(())
}

fn check_reference(
    txn: &TransactionContext,
    store: &ObjectStore,
    value: &PropertyValue,
) -> Result<()> {
    match value {
        PropertyValue::Ref(target) if !target.is_null() => {
            let created_here = txn
                .pending(*target)
                .map(|w| w.op != WriteOp::Delete)
                .unwrap_or(false);
            if created_here {
                return Ok(());
            }
            let exists = store
                .partition_for(*target)?
                .visible_meta(*target, txn.read_version)
                .map(|(_, tombstone)| !tombstone)
                .unwrap_or(false);
            if !exists {
                return Err(Error::Constraint(ConstraintKind::DanglingReference(
                    *target,
                )));
            }
            Ok(())
        }
        PropertyValue::Array(items) => {
            for item in items {
                check_reference(txn, store, item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::PendingWrite;
    use helio_core::model::{
        ClassDescriptor, IndexDescriptor, IndexKind, ModelDescriptor, PropertyDescriptor,
        PropertyKind,
    };
    use helio_core::types::{ObjectId, TxnKind};
    use helio_core::value::PropertyBlock;
    use helio_storage::StoredVersion;
    use std::sync::Arc;

    fn model() -> Arc<ModelDescriptor> {
        let mut m = ModelDescriptor::empty();
        m.classes.push(ClassDescriptor {
            id: 1,
            name: "Book".to_string(),
            properties: vec![
                PropertyDescriptor {
                    id: 0,
                    name: "Title".to_string(),
                    kind: PropertyKind::Str,
                },
                PropertyDescriptor {
                    id: 1,
                    name: "Author".to_string(),
                    kind: PropertyKind::Reference { target: 2, nullable: true },
                },
            ],
            log_stream: 0,
        });
        m.classes.push(ClassDescriptor {
            id: 2,
            name: "Author".to_string(),
            properties: vec![PropertyDescriptor {
                id: 0,
                name: "Name".to_string(),
                kind: PropertyKind::Str,
            }],
            log_stream: 0,
        });
        m.indexes.push(IndexDescriptor {
            id: 1,
            name: "BookByTitle".to_string(),
            class_id: 1,
            kind: IndexKind::Hash,
            unique: true,
            properties: vec![0],
        });
        Arc::new(m)
    }

    fn book(title: &str, author: ObjectId) -> PropertyBlock {
        PropertyBlock::new(vec![
            PropertyValue::string(title),
            PropertyValue::Ref(author),
        ])
    }

    fn setup() -> (Arc<ModelDescriptor>, ObjectStore, IndexSet) {
        let model = model();
        let store = ObjectStore::for_model(&model);
        let indexes = IndexSet::for_model(&model);
        (model, store, indexes)
    }

    fn txn(model: &Arc<ModelDescriptor>, read_version: Version) -> TransactionContext {
        TransactionContext::new(1, TxnKind::ReadWrite, read_version, Arc::clone(model))
    }

    #[test]
    fn clean_transaction_validates() {
        let (model, store, indexes) = setup();
        let mut t = txn(&model, 5);
        let id = store.partition(1).unwrap().allocate_id();
        t.buffer_write(
            id,
            PendingWrite {
                op: WriteOp::Insert,
                block: Some(book("Gatsby", ObjectId::NULL)),
            },
        );
        validate(&t, &store, &indexes).unwrap();
    }

    #[test]
    fn write_after_read_detected() {
        let (model, store, indexes) = setup();
        let p = store.partition(1).unwrap();
        let id = p.allocate_id();
        p.publish(id, StoredVersion::live(3, book("Gatsby", ObjectId::NULL)));

        let mut t = txn(&model, 5);
        // Observed the version at commit 3; a concurrent writer then
        // published version 6.
        t.fingerprint.record_object(id, 3);
        p.publish(id, StoredVersion::live(6, book("Gatsby2", ObjectId::NULL)));

        assert_eq!(
            validate(&t, &store, &indexes),
            Err(Error::Conflict(ConflictKind::WriteAfterRead))
        );
    }

    #[test]
    fn write_after_write_detected() {
        let (model, store, indexes) = setup();
        let p = store.partition(1).unwrap();
        let id = p.allocate_id();
        p.publish(id, StoredVersion::live(3, book("Gatsby", ObjectId::NULL)));

        let mut t = txn(&model, 5);
        t.buffer_write(
            id,
            PendingWrite {
                op: WriteOp::Update,
                block: Some(book("Great Gatsby", ObjectId::NULL)),
            },
        );
        // Concurrent commit past the read version.
        p.publish(id, StoredVersion::live(6, book("Other", ObjectId::NULL)));

        assert_eq!(
            validate(&t, &store, &indexes),
            Err(Error::Conflict(ConflictKind::WriteAfterWrite))
        );
    }

    #[test]
    fn phantom_detected_on_scanned_range() {
        let (model, store, indexes) = setup();
        let mut t = txn(&model, 5);
        t.fingerprint
            .record_scan(1, helio_core::model::KeyRange::all());
        // A concurrent transaction inserts into the scanned index at 6.
        let id = store.partition(1).unwrap().allocate_id();
        indexes
            .apply_write(&model, 1, id, None, Some(&book("New", ObjectId::NULL)), 6)
            .unwrap();

        assert_eq!(
            validate(&t, &store, &indexes),
            Err(Error::Conflict(ConflictKind::PhantomWrite))
        );
    }

    #[test]
    fn unique_violation_detected() {
        let (model, store, indexes) = setup();
        let p = store.partition(1).unwrap();
        let existing = p.allocate_id();
        let block = book("Gatsby", ObjectId::NULL);
        p.publish(existing, StoredVersion::live(2, block.clone()));
        indexes.apply_write(&model, 1, existing, None, Some(&block), 2).unwrap();

        let mut t = txn(&model, 5);
        let fresh = p.allocate_id();
        t.buffer_write(
            fresh,
            PendingWrite {
                op: WriteOp::Insert,
                block: Some(book("Gatsby", ObjectId::NULL)),
            },
        );
        assert_eq!(
            validate(&t, &store, &indexes),
            Err(Error::Conflict(ConflictKind::UniqueIndexViolation))
        );
    }

    #[test]
    fn duplicate_unique_key_within_one_transaction() {
        let (model, store, indexes) = setup();
        let p = store.partition(1).unwrap();
        let mut t = txn(&model, 5);
        for _ in 0..2 {
            let id = p.allocate_id();
            t.buffer_write(
                id,
                PendingWrite {
                    op: WriteOp::Insert,
                    block: Some(book("Same Title", ObjectId::NULL)),
                },
            );
        }
        assert_eq!(
            validate(&t, &store, &indexes),
            Err(Error::Conflict(ConflictKind::UniqueIndexViolation))
        );
    }

    #[test]
    fn dangling_reference_rejected() {
        let (model, store, indexes) = setup();
        let mut t = txn(&model, 5);
        let id = store.partition(1).unwrap().allocate_id();
        let ghost = ObjectId::new(2, 999);
        t.buffer_write(
            id,
            PendingWrite {
                op: WriteOp::Insert,
                block: Some(book("Gatsby", ghost)),
            },
        );
        assert_eq!(
            validate(&t, &store, &indexes),
            Err(Error::Constraint(ConstraintKind::DanglingReference(ghost)))
        );
    }

    #[test]
    fn reference_to_object_created_in_same_transaction_is_fine() {
        let (model, store, indexes) = setup();
        let mut t = txn(&model, 5);
        let author = store.partition(2).unwrap().allocate_id();
        t.buffer_write(
            author,
            PendingWrite {
                op: WriteOp::Insert,
                block: Some(PropertyBlock::new(vec![PropertyValue::string("F.S.F.")])),
            },
        );
        let book_id = store.partition(1).unwrap().allocate_id();
        t.buffer_write(
            book_id,
            PendingWrite {
                op: WriteOp::Insert,
                block: Some(book("Gatsby", author)),
            },
        );
        validate(&t, &store, &indexes).unwrap();
    }
}
