//! Chunk layout and message chunking.
//!
//! ```text
//! ┌────────────────┬──────────────────┬────────────────┬───────────┬─────────┐
//! │ chunk_size u32 │ header_version   │ message_id u64 │ flags u8  │ payload │
//! │ little-endian  │ u32              │                │           │         │
//! └────────────────┴──────────────────┴────────────────┴───────────┴─────────┘
//! ```
//!
//! `chunk_size` counts the whole chunk, header included. Flag bit 0 marks
//! the first chunk of a message, bit 1 the last; a sole chunk sets both.

use bytes::{BufMut, Bytes, BytesMut};

/// Bytes in the fixed chunk header.
pub const HEADER_LEN: usize = 17;

/// The protocol header version this build speaks.
pub const HEADER_VERSION: u32 = 1;

/// Total size of a small chunk. A message whose payload fits here travels
/// as a sole chunk.
pub const SMALL_CHUNK_SIZE: usize = 4 * 1024;

/// Total size of a large chunk, used once a message outgrows a small one.
pub const LARGE_CHUNK_SIZE: usize = 64 * 1024;

/// First-chunk flag bit.
pub const FLAG_FIRST: u8 = 0b0000_0001;

/// Last-chunk flag bit.
pub const FLAG_LAST: u8 = 0b0000_0010;

/// A decoded chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Total chunk size in bytes, header included.
    pub chunk_size: u32,
    /// Protocol header version.
    pub header_version: u32,
    /// Owning message id.
    pub message_id: u64,
    /// First/last flag bits.
    pub flags: u8,
}

impl ChunkHeader {
    /// Whether this chunk starts its message.
    pub fn is_first(&self) -> bool {
        self.flags & FLAG_FIRST != 0
    }

    /// Whether this chunk ends its message.
    pub fn is_last(&self) -> bool {
        self.flags & FLAG_LAST != 0
    }

    /// Payload bytes carried by the chunk.
    pub fn payload_len(&self) -> usize {
        self.chunk_size as usize - HEADER_LEN
    }

    /// Write the header into `out`.
    pub fn encode_into(&self, out: &mut BytesMut) {
        out.put_u32_le(self.chunk_size);
        out.put_u32_le(self.header_version);
        out.put_u64_le(self.message_id);
        out.put_u8(self.flags);
    }

    /// Parse a header from exactly [`HEADER_LEN`] bytes.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> ChunkHeader {
        ChunkHeader {
            chunk_size: u32::from_le_bytes(bytes[0..4].try_into().expect("fixed slice")),
            header_version: u32::from_le_bytes(bytes[4..8].try_into().expect("fixed slice")),
            message_id: u64::from_le_bytes(bytes[8..16].try_into().expect("fixed slice")),
            flags: bytes[16],
        }
    }
}

/// A decoded chunk: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// The header.
    pub header: ChunkHeader,
    /// The payload bytes.
    pub payload: Bytes,
}

fn encode_chunk(message_id: u64, flags: u8, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    ChunkHeader {
        chunk_size: (HEADER_LEN + payload.len()) as u32,
        header_version: HEADER_VERSION,
        message_id,
        flags,
    }
    .encode_into(&mut out);
    out.put_slice(payload);
    out.freeze()
}

/// Split a full message payload into wire chunks.
///
/// A payload that fits one small chunk travels as a sole small chunk; a
/// writer that outgrows the small buffer promotes it into a large chunk
/// before anything is sent, so the wire never fragments a message that a
/// single frame could carry. Beyond one large chunk the payload splits
/// across large chunks with first/last flags.
pub fn chunk_message(message_id: u64, payload: &[u8]) -> Vec<Bytes> {
    const LARGE_PAYLOAD: usize = LARGE_CHUNK_SIZE - HEADER_LEN;

    if payload.len() <= LARGE_PAYLOAD {
        // Sole chunk: a small frame when the payload fits one, otherwise
        // promoted to a single large frame rather than fragmented.
        return vec![encode_chunk(message_id, FLAG_FIRST | FLAG_LAST, payload)];
    }

    let mut chunks = Vec::with_capacity(payload.len() / LARGE_PAYLOAD + 1);
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + LARGE_PAYLOAD).min(payload.len());
        let mut flags = 0;
        if offset == 0 {
            flags |= FLAG_FIRST;
        }
        if end == payload.len() {
            flags |= FLAG_LAST;
        }
        chunks.push(encode_chunk(message_id, flags, &payload[offset..end]));
        offset = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = ChunkHeader {
            chunk_size: 1234,
            header_version: HEADER_VERSION,
            message_id: 0xDEAD_BEEF,
            flags: FLAG_FIRST,
        };
        let mut out = BytesMut::new();
        header.encode_into(&mut out);
        assert_eq!(out.len(), HEADER_LEN);
        let bytes: [u8; HEADER_LEN] = out[..].try_into().unwrap();
        assert_eq!(ChunkHeader::decode(&bytes), header);
    }

    #[test]
    fn small_payload_is_a_sole_small_chunk() {
        let payload = vec![7u8; 100];
        let chunks = chunk_message(42, &payload);
        assert_eq!(chunks.len(), 1);
        let header_bytes: [u8; HEADER_LEN] = chunks[0][..HEADER_LEN].try_into().unwrap();
        let header = ChunkHeader::decode(&header_bytes);
        assert!(header.is_first() && header.is_last());
        assert_eq!(header.chunk_size as usize, HEADER_LEN + 100);
        assert!(header.chunk_size as usize <= SMALL_CHUNK_SIZE);
    }

    #[test]
    fn outgrown_small_chunk_is_promoted_not_fragmented() {
        // Larger than a small chunk, but fits one large chunk: the wire
        // must carry exactly one frame.
        let payload = vec![1u8; SMALL_CHUNK_SIZE + 1];
        let chunks = chunk_message(1, &payload);
        assert_eq!(chunks.len(), 1);
        let header_bytes: [u8; HEADER_LEN] = chunks[0][..HEADER_LEN].try_into().unwrap();
        let header = ChunkHeader::decode(&header_bytes);
        assert!(header.is_first() && header.is_last());
        assert!(header.chunk_size as usize > SMALL_CHUNK_SIZE);
        assert!(header.chunk_size as usize <= LARGE_CHUNK_SIZE);
    }

    #[test]
    fn large_payload_splits_with_correct_flags() {
        let payload = vec![2u8; LARGE_CHUNK_SIZE * 2];
        let chunks = chunk_message(1, &payload);
        assert!(chunks.len() > 2);
        for (i, chunk) in chunks.iter().enumerate() {
            let header_bytes: [u8; HEADER_LEN] = chunk[..HEADER_LEN].try_into().unwrap();
            let header = ChunkHeader::decode(&header_bytes);
            assert_eq!(header.is_first(), i == 0);
            assert_eq!(header.is_last(), i == chunks.len() - 1);
            assert!(header.chunk_size as usize <= LARGE_CHUNK_SIZE);
        }
    }

    #[test]
    fn chunks_reassemble_to_the_original() {
        for len in [
            0,
            1,
            SMALL_CHUNK_SIZE - HEADER_LEN, // exactly small
            SMALL_CHUNK_SIZE - HEADER_LEN + 1,
            LARGE_CHUNK_SIZE - HEADER_LEN,
            LARGE_CHUNK_SIZE - HEADER_LEN + 1,
            2 * LARGE_CHUNK_SIZE,
        ] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut rebuilt = Vec::new();
            for chunk in chunk_message(9, &payload) {
                rebuilt.extend_from_slice(&chunk[HEADER_LEN..]);
            }
            assert_eq!(rebuilt, payload, "payload len {len}");
        }
    }
}
