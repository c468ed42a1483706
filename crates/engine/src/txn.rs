//! The transaction handle handed to operation handlers.
//!
//! A `Txn` borrows the database; it cannot outlive it, and the model
//! descriptor it was born under stays pinned until the transaction ends.

use crate::database::Database;
use helio_concurrency::TransactionContext;
use helio_core::error::Result;
use helio_core::model::{IndexKey, KeyRange, ModelDescriptor};
use helio_core::types::{ClassId, IndexId, ObjectId, PropertyId, TxnKind, Version};
use helio_core::value::PropertyBlock;
use std::sync::Arc;

/// A transaction bound to its database.
pub struct Txn<'db> {
    db: &'db Database,
    ctx: TransactionContext,
}

impl<'db> std::fmt::Debug for Txn<'db> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("txn_id", &self.ctx.txn_id)
            .field("kind", &self.ctx.kind)
            .field("read_version", &self.ctx.read_version)
            .finish()
    }
}

impl<'db> Txn<'db> {
    pub(crate) fn new(db: &'db Database, ctx: TransactionContext) -> Self {
        Txn { db, ctx }
    }

    /// The pinned model descriptor.
    pub fn model(&self) -> &Arc<ModelDescriptor> {
        &self.ctx.model
    }

    /// The snapshot version this transaction reads at.
    pub fn read_version(&self) -> Version {
        self.ctx.read_version
    }

    /// Whether this transaction may write.
    pub fn is_read_write(&self) -> bool {
        self.ctx.kind == TxnKind::ReadWrite
    }

    /// Create an object of `class`.
    pub fn create(&mut self, class: ClassId, block: PropertyBlock) -> Result<ObjectId> {
        self.db.manager().insert(&mut self.ctx, class, block)
    }

    /// Read an object.
    pub fn get(&mut self, id: ObjectId) -> Result<Option<PropertyBlock>> {
        self.db.manager().read(&mut self.ctx, id)
    }

    /// Replace an object's properties.
    pub fn update(&mut self, id: ObjectId, block: PropertyBlock) -> Result<()> {
        self.db.manager().update(&mut self.ctx, id, block)
    }

    /// Delete an object.
    pub fn delete(&mut self, id: ObjectId) -> Result<()> {
        self.db.manager().delete(&mut self.ctx, id)
    }

    /// Range scan over a sorted index.
    pub fn scan(&mut self, index: IndexId, range: KeyRange) -> Result<Vec<(IndexKey, ObjectId)>> {
        self.db.manager().scan(&mut self.ctx, index, range)
    }

    /// Point lookup in a hash index.
    pub fn lookup(&mut self, index: IndexId, key: &IndexKey) -> Result<Vec<ObjectId>> {
        self.db.manager().lookup(&mut self.ctx, index, key)
    }

    /// Who points at `target` through the declared inverse reference.
    pub fn referrers(
        &mut self,
        referring_class: ClassId,
        property: PropertyId,
        target: ObjectId,
    ) -> Result<Vec<ObjectId>> {
        self.db
            .manager()
            .referrers(&mut self.ctx, referring_class, property, target)
    }

    /// Commit; returns the commit version.
    pub fn commit(mut self) -> Result<Version> {
        self.db.manager().commit(&mut self.ctx)
    }

    /// Abort, discarding buffered writes.
    pub fn abort(mut self) -> Result<()> {
        self.db.manager().abort(&mut self.ctx)
    }
}
