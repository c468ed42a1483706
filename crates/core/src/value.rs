//! Property values and packed property blocks.
//!
//! A committed object version stores its properties as a `PropertyBlock`:
//! an immutable, shared slice of values in the class's declared property
//! order. Strings hold interned handles and blobs hold out-of-line
//! refcounted handles; both serialize by value so blocks can cross the WAL
//! and the wire.

use crate::blob::BlobRef;
use crate::error::{Error, Result};
use crate::intern::InternedStr;
use crate::types::ObjectId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Absent value (null string, null blob, or unset scalar).
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 8-bit integer.
    I8(i8),
    /// Signed 16-bit integer.
    I16(i16),
    /// Signed 32-bit integer.
    I32(i32),
    /// Signed 64-bit integer.
    I64(i64),
    /// Unsigned 8-bit integer.
    U8(u8),
    /// Unsigned 16-bit integer.
    U16(u16),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// Interned string.
    Str(InternedStr),
    /// Out-of-line blob.
    Blob(BlobRef),
    /// Reference to another object; `ObjectId::NULL` is the null reference.
    Ref(ObjectId),
    /// Array of scalars.
    Array(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Convenience constructor interning `s`.
    pub fn string(s: &str) -> Self {
        PropertyValue::Str(InternedStr::new(s))
    }

    /// The referenced object id, if this is a reference.
    pub fn as_ref_id(&self) -> Option<ObjectId> {
        match self {
            PropertyValue::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// The string contents, if this is a string.
    pub fn as_str(&self) -> Option<Arc<str>> {
        match self {
            PropertyValue::Str(s) => Some(s.as_arc()),
            _ => None,
        }
    }

    /// The i64 payload, if this is a 64-bit signed integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::I64(v) => Some(*v),
            _ => None,
        }
    }
}

/// An immutable, shared block of property values in declared order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyBlock {
    #[serde(with = "arc_slice")]
    values: Arc<[PropertyValue]>,
}

mod arc_slice {
    use super::PropertyValue;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(values: &Arc<[PropertyValue]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        values.as_ref().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<[PropertyValue]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let values = Vec::<PropertyValue>::deserialize(deserializer)?;
        Ok(values.into())
    }
}

impl PropertyBlock {
    /// Build a block from values in declared property order.
    pub fn new(values: Vec<PropertyValue>) -> Self {
        PropertyBlock {
            values: values.into(),
        }
    }

    /// Value at the declared property position.
    pub fn get(&self, position: usize) -> Option<&PropertyValue> {
        self.values.get(position)
    }

    /// All values in declared order.
    pub fn values(&self) -> &[PropertyValue] {
        &self.values
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the block has no properties.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Encode to the packed on-disk/wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode from the packed form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> PropertyBlock {
        PropertyBlock::new(vec![
            PropertyValue::string("Gatsby"),
            PropertyValue::I64(1925),
            PropertyValue::Ref(ObjectId::new(2, 17)),
            PropertyValue::Null,
            PropertyValue::Array(vec![PropertyValue::U8(1), PropertyValue::U8(2)]),
        ])
    }

    #[test]
    fn block_preserves_declared_order() {
        let block = sample_block();
        assert_eq!(block.len(), 5);
        assert_eq!(block.get(0).unwrap().as_str().as_deref(), Some("Gatsby"));
        assert_eq!(block.get(1).unwrap().as_i64(), Some(1925));
        assert_eq!(
            block.get(2).unwrap().as_ref_id(),
            Some(ObjectId::new(2, 17))
        );
    }

    #[test]
    fn encode_decode_round_trip() {
        let block = sample_block();
        let bytes = block.encode().unwrap();
        let back = PropertyBlock::decode(&bytes).unwrap();
        assert_eq!(block, back);
    }

    #[test]
    fn blob_survives_encoding() {
        let block = PropertyBlock::new(vec![PropertyValue::Blob(BlobRef::new(b"abc", 4))]);
        let back = PropertyBlock::decode(&block.encode().unwrap()).unwrap();
        match back.get(0).unwrap() {
            PropertyValue::Blob(b) => {
                assert_eq!(b.bytes(), b"abc");
                assert_eq!(b.commit_version(), 4);
            }
            other => panic!("expected blob, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(PropertyBlock::decode(&[0xff; 3]).is_err());
    }
}
