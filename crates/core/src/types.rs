//! Object identifiers, versions, and transaction kinds.
//!
//! Object ids are signed 64-bit values that carry their owning class in the
//! high bits so the store can dispatch to the right partition without a
//! lookup:
//!
//! ```text
//!  bit 63   bits 48..62      bits 0..47
//! ┌───────┬──────────────┬─────────────────┐
//! │ sign  │  class id    │    sequence     │
//! └───────┴──────────────┴─────────────────┘
//! ```
//!
//! Zero is reserved for the null reference; the sign bit is never set for a
//! valid id.

use serde::{Deserialize, Serialize};

/// Identifier of a class in the model descriptor. At most 15 bits are used
/// so that ids stay positive inside an [`ObjectId`].
pub type ClassId = u16;

/// Identifier of a property within its class.
pub type PropertyId = u16;

/// Identifier of a secondary index.
pub type IndexId = u32;

/// Unique id of a read-write transaction.
pub type TxnId = u64;

/// A commit version. Monotonically increasing, assigned at commit time.
/// Version 0 means "before the first commit" and is also used to record a
/// read of a missing object in the read fingerprint.
pub type Version = u64;

/// Number of low bits holding the per-class sequence.
pub const SEQUENCE_BITS: u32 = 48;

/// Largest sequence an [`ObjectId`] can carry.
pub const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Largest class id an [`ObjectId`] can carry (15 bits; the sign bit must
/// stay clear).
pub const MAX_CLASS_ID: ClassId = (1 << 15) - 1;

/// A database object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub i64);

impl ObjectId {
    /// The null reference.
    pub const NULL: ObjectId = ObjectId(0);

    /// Build an id from its class and sequence parts.
    ///
    /// # Panics
    /// Panics if `class` or `sequence` exceed their field widths. Sequence
    /// exhaustion is an engine invariant failure, not an input error.
    pub fn new(class: ClassId, sequence: u64) -> Self {
        assert!(class <= MAX_CLASS_ID, "class id out of range");
        assert!(sequence <= MAX_SEQUENCE, "object sequence exhausted");
        ObjectId(((class as i64) << SEQUENCE_BITS) | sequence as i64)
    }

    /// Whether this is the null reference.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// The owning class encoded in the high bits.
    #[inline]
    pub fn class_id(&self) -> ClassId {
        ((self.0 as u64) >> SEQUENCE_BITS) as ClassId
    }

    /// The low-bit sequence.
    #[inline]
    pub fn sequence(&self) -> u64 {
        (self.0 as u64) & MAX_SEQUENCE
    }

    /// A valid id is positive and carries a class. Null is not valid as a
    /// stored key but is a legal reference value.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}:{}", self.class_id(), self.sequence())
        }
    }
}

/// The kind of a transaction, fixed at begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnKind {
    /// Snapshot reads only. Never validated, never assigned a commit version.
    Read,
    /// May read and write; validated at commit.
    ReadWrite,
}

/// The operation a write performs on its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    /// A new object with a freshly issued id.
    Insert,
    /// A new version of an existing object.
    Update,
    /// A tombstone version.
    Delete,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_round_trips_parts() {
        let id = ObjectId::new(7, 123_456);
        assert_eq!(id.class_id(), 7);
        assert_eq!(id.sequence(), 123_456);
        assert!(id.is_valid());
        assert!(!id.is_null());
    }

    #[test]
    fn null_is_zero() {
        assert!(ObjectId::NULL.is_null());
        assert!(!ObjectId::NULL.is_valid());
        assert_eq!(ObjectId::NULL.class_id(), 0);
    }

    #[test]
    fn max_fields_stay_positive() {
        let id = ObjectId::new(MAX_CLASS_ID, MAX_SEQUENCE);
        assert!(id.0 > 0);
        assert_eq!(id.class_id(), MAX_CLASS_ID);
        assert_eq!(id.sequence(), MAX_SEQUENCE);
    }

    #[test]
    #[should_panic(expected = "class id out of range")]
    fn class_id_overflow_panics() {
        let _ = ObjectId::new(MAX_CLASS_ID + 1, 0);
    }

    #[test]
    fn display_formats_parts() {
        assert_eq!(ObjectId::new(3, 9).to_string(), "3:9");
        assert_eq!(ObjectId::NULL.to_string(), "null");
    }
}
