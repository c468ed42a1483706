//! Order-preserving index key encoding.
//!
//! Sorted indexes compare keys as raw bytes, so every component is encoded
//! so that byte order equals value order: integers are sign-flipped
//! big-endian, floats use the standard total-order bit transform, strings
//! are terminated with an escaped sentinel so no string is a prefix of
//! another.

use crate::error::{Error, Result};
use crate::value::PropertyValue;
use serde::{Deserialize, Serialize};

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_SIGNED: u8 = 0x02;
const TAG_UNSIGNED: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_REF: u8 = 0x06;

/// A fully encoded index key. Byte comparison equals value comparison.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexKey(Vec<u8>);

impl IndexKey {
    /// Start building a composite key.
    pub fn builder() -> IndexKeyBuilder {
        IndexKeyBuilder(Vec::new())
    }

    /// Encode a single-component key.
    pub fn single(value: &PropertyValue) -> Result<IndexKey> {
        let mut b = IndexKey::builder();
        b.push(value)?;
        Ok(b.finish())
    }

    /// The raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The immediate successor in byte order. Used to turn an inclusive
    /// point into an exclusive upper bound.
    pub fn successor(&self) -> IndexKey {
        let mut bytes = self.0.clone();
        bytes.push(0x00);
        IndexKey(bytes)
    }
}

/// Incremental composite-key builder.
pub struct IndexKeyBuilder(Vec<u8>);

impl IndexKeyBuilder {
    /// Append one component.
    pub fn push(&mut self, value: &PropertyValue) -> Result<()> {
        let out = &mut self.0;
        match value {
            PropertyValue::Null => out.push(TAG_NULL),
            PropertyValue::Bool(v) => {
                out.push(TAG_BOOL);
                out.push(*v as u8);
            }
            PropertyValue::I8(v) => push_signed(out, *v as i64),
            PropertyValue::I16(v) => push_signed(out, *v as i64),
            PropertyValue::I32(v) => push_signed(out, *v as i64),
            PropertyValue::I64(v) => push_signed(out, *v),
            PropertyValue::U8(v) => push_unsigned(out, *v as u64),
            PropertyValue::U16(v) => push_unsigned(out, *v as u64),
            PropertyValue::U32(v) => push_unsigned(out, *v as u64),
            PropertyValue::U64(v) => push_unsigned(out, *v),
            PropertyValue::F32(v) => push_float(out, *v as f64),
            PropertyValue::F64(v) => push_float(out, *v),
            PropertyValue::Str(s) => {
                out.push(TAG_STRING);
                for b in s.as_arc().as_bytes() {
                    if *b == 0x00 {
                        out.extend_from_slice(&[0x00, 0xff]);
                    } else {
                        out.push(*b);
                    }
                }
                out.extend_from_slice(&[0x00, 0x00]);
            }
            PropertyValue::Ref(id) => {
                out.push(TAG_REF);
                out.extend_from_slice(&((id.0 as u64) ^ (1 << 63)).to_be_bytes());
            }
            PropertyValue::Blob(_) | PropertyValue::Array(_) => {
                return Err(Error::InvalidArgument {
                    field: "index key".to_string(),
                    reason: "blobs and arrays cannot be index key components".to_string(),
                })
            }
        }
        Ok(())
    }

    /// Finish the key.
    pub fn finish(self) -> IndexKey {
        IndexKey(self.0)
    }
}

fn push_signed(out: &mut Vec<u8>, v: i64) {
    out.push(TAG_SIGNED);
    out.extend_from_slice(&((v as u64) ^ (1 << 63)).to_be_bytes());
}

fn push_unsigned(out: &mut Vec<u8>, v: u64) {
    out.push(TAG_UNSIGNED);
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_float(out: &mut Vec<u8>, v: f64) {
    out.push(TAG_FLOAT);
    let bits = v.to_bits();
    let ordered = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
    out.extend_from_slice(&ordered.to_be_bytes());
}

/// A half-open or inclusive range over index keys, as captured by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound; `None` means unbounded.
    pub start: Option<IndexKey>,
    /// Upper bound; `None` means unbounded.
    pub end: Option<IndexKey>,
    /// Whether `end` is inclusive.
    pub end_inclusive: bool,
}

impl KeyRange {
    /// The unbounded range.
    pub fn all() -> Self {
        KeyRange {
            start: None,
            end: None,
            end_inclusive: false,
        }
    }

    /// A single-key range.
    pub fn point(key: IndexKey) -> Self {
        KeyRange {
            start: Some(key.clone()),
            end: Some(key),
            end_inclusive: true,
        }
    }

    /// `[start, end)`.
    pub fn half_open(start: IndexKey, end: IndexKey) -> Self {
        KeyRange {
            start: Some(start),
            end: Some(end),
            end_inclusive: false,
        }
    }

    /// Whether `key` falls inside this range.
    pub fn contains(&self, key: &IndexKey) -> bool {
        if let Some(start) = &self.start {
            if key < start {
                return false;
            }
        }
        if let Some(end) = &self.end {
            if self.end_inclusive {
                if key > end {
                    return false;
                }
            } else if key >= end {
                return false;
            }
        }
        true
    }
}
