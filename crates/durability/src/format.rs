//! Log record format.
//!
//! One record per committed transaction (per touched stream). Records are
//! framed so a reader can detect a torn tail without trusting anything
//! after the damage:
//!
//! ```text
//! ┌──────────────┬────────────┬───────────┬─────────────────┬────────────┐
//! │ Length (4)   │ Format (1) │ Flags (1) │ Payload (var)   │ CRC32 (4)  │
//! └──────────────┴────────────┴───────────┴─────────────────┴────────────┘
//! ```
//!
//! Length counts format byte, flags, and payload. The CRC covers the same
//! bytes. Packed streams compress the payload; the frame itself is never
//! compressed, so torn-write detection is identical for both forms.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use helio_core::error::{Error, PersistenceKind, Result};
use helio_core::types::{ClassId, ObjectId, TxnId, Version, WriteOp};
use helio_core::value::PropertyBlock;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Current record format version.
pub const RECORD_FORMAT_VERSION: u8 = 1;

/// Flag bit marking a zstd-compressed payload.
pub const FLAG_PACKED: u8 = 0b0000_0001;

/// Compression level for packed streams. Low level favors throughput.
const PACKED_LEVEL: i32 = 1;

/// One write inside a committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordWrite {
    /// The written class.
    pub class_id: ClassId,
    /// Insert, update, or delete.
    pub op: WriteOp,
    /// The written object.
    pub object_id: ObjectId,
    /// New property block; `None` exactly for deletes.
    pub block: Option<PropertyBlock>,
}

/// The log record of one committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Commit version assigned by the transaction manager.
    pub commit_version: Version,
    /// Id of the committing transaction.
    pub tx_id: TxnId,
    /// All writes, in apply order.
    pub writes: Vec<RecordWrite>,
}

impl LogRecord {
    /// Keep only writes whose class persists to `stream_of(class) == stream`.
    /// Returns `None` when nothing in the record belongs to the stream.
    pub fn project(&self, stream: u8, stream_of: impl Fn(ClassId) -> u8) -> Option<LogRecord> {
        let writes: Vec<RecordWrite> = self
            .writes
            .iter()
            .filter(|w| stream_of(w.class_id) == stream)
            .cloned()
            .collect();
        if writes.is_empty() {
            None
        } else {
            Some(LogRecord {
                commit_version: self.commit_version,
                tx_id: self.tx_id,
                writes,
            })
        }
    }

    /// Encode into a framed record.
    pub fn encode(&self, packed: bool) -> Result<Vec<u8>> {
        let raw = bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))?;
        let (payload, flags) = if packed {
            let compressed = zstd::encode_all(&raw[..], PACKED_LEVEL)
                .map_err(|e| Error::Persistence(PersistenceKind::IoError(e.to_string())))?;
            (compressed, FLAG_PACKED)
        } else {
            (raw, 0)
        };

        let mut framed = Vec::with_capacity(payload.len() + 10);
        framed
            .write_u32::<LittleEndian>((payload.len() + 2) as u32)
            .expect("vec write");
        framed.push(RECORD_FORMAT_VERSION);
        framed.push(flags);
        framed.extend_from_slice(&payload);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&framed[4..]);
        framed
            .write_u32::<LittleEndian>(hasher.finalize())
            .expect("vec write");
        Ok(framed)
    }

    /// Decode one framed record from `input`, advancing it. Returns
    /// `Ok(None)` at a clean end of input; a torn or corrupt frame is an
    /// error the reader translates into truncation.
    pub fn decode_from(input: &mut &[u8]) -> Result<Option<LogRecord>> {
        if input.is_empty() {
            return Ok(None);
        }
        if input.len() < 4 {
            return Err(corrupt("torn length prefix"));
        }
        let mut cursor = *input;
        let len = cursor.read_u32::<LittleEndian>().expect("slice read") as usize;
        if len < 2 || cursor.len() < len + 4 {
            return Err(corrupt("torn record body"));
        }
        let body = &cursor[..len];
        let mut crc_bytes = &cursor[len..len + 4];
        let stored_crc = crc_bytes.read_u32::<LittleEndian>().expect("slice read");

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            return Err(corrupt("crc mismatch"));
        }

        let format = body[0];
        if format != RECORD_FORMAT_VERSION {
            return Err(corrupt(&format!("unknown record format {format}")));
        }
        let flags = body[1];
        let payload = &body[2..];
        let raw: Vec<u8>;
        let record_bytes: &[u8] = if flags & FLAG_PACKED != 0 {
            raw = decompress(payload)?;
            &raw
        } else {
            payload
        };
        let record: LogRecord = bincode::deserialize(record_bytes)
            .map_err(|e| corrupt(&format!("payload decode: {e}")))?;

        *input = &cursor[len + 4..];
        Ok(Some(record))
    }
}

fn decompress(payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    zstd::Decoder::new(payload)
        .and_then(|mut d| d.read_to_end(&mut out))
        .map_err(|e| corrupt(&format!("packed payload: {e}")))?;
    Ok(out)
}

fn corrupt(reason: &str) -> Error {
    Error::Persistence(PersistenceKind::CorruptLog(reason.to_string()))
}
