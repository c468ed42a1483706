//! Fragment reassembly with backpressure.
//!
//! One reassembler per connection, driven by the connection's single
//! receive task. A first chunk publishes an awaiter; follow-up chunks
//! attach to it; the last chunk completes the message. When the number of
//! queued chunks crosses the bound, the caller pauses socket reads until
//! the backlog drains. A chunk timeout abandons messages whose peers went
//! quiet mid-transfer.

use crate::chunk::Chunk;
use bytes::{Bytes, BytesMut};
use helio_core::error::{CommunicationKind, Error, Result};
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tracing::warn;

struct PartialMessage {
    chunks: Vec<Bytes>,
    bytes: usize,
    last_chunk_at: Instant,
}

/// Per-connection chunk reassembler.
pub struct Reassembler {
    pending: FxHashMap<u64, PartialMessage>,
    queued_chunks: usize,
    max_queued_chunks: usize,
    chunk_timeout: Duration,
}

impl Reassembler {
    /// Build with a backpressure bound and a timeout for quiet transfers.
    pub fn new(max_queued_chunks: usize, chunk_timeout: Duration) -> Self {
        Reassembler {
            pending: FxHashMap::default(),
            queued_chunks: 0,
            max_queued_chunks,
            chunk_timeout,
        }
    }

    /// Feed one chunk. Returns the completed message when its last chunk
    /// arrives. Protocol violations (an unannounced continuation, or a
    /// duplicate first chunk) are errors that close the connection.
    pub fn push(&mut self, chunk: Chunk) -> Result<Option<(u64, Bytes)>> {
        let id = chunk.header.message_id;
        let first = chunk.header.is_first();
        let last = chunk.header.is_last();

        if first && last {
            return Ok(Some((id, chunk.payload)));
        }

        if first {
            if self.pending.contains_key(&id) {
                return Err(Error::Communication(CommunicationKind::CorruptMessage));
            }
            self.pending.insert(
                id,
                PartialMessage {
                    bytes: chunk.payload.len(),
                    chunks: vec![chunk.payload],
                    last_chunk_at: Instant::now(),
                },
            );
            self.queued_chunks += 1;
            return Ok(None);
        }

        let Some(partial) = self.pending.get_mut(&id) else {
            return Err(Error::Communication(CommunicationKind::CorruptMessage));
        };
        partial.bytes += chunk.payload.len();
        partial.chunks.push(chunk.payload);
        partial.last_chunk_at = Instant::now();

        if !last {
            self.queued_chunks += 1;
            return Ok(None);
        }

        let partial = self.pending.remove(&id).expect("looked up above");
        self.queued_chunks -= partial.chunks.len() - 1;
        let mut payload = BytesMut::with_capacity(partial.bytes);
        for piece in partial.chunks {
            payload.extend_from_slice(&piece);
        }
        Ok(Some((id, payload.freeze())))
    }

    /// Whether socket reads should pause until the backlog drains.
    pub fn over_limit(&self) -> bool {
        self.queued_chunks > self.max_queued_chunks
    }

    /// Drop transfers whose last chunk is older than the timeout. Returns
    /// the abandoned message ids.
    pub fn expire(&mut self) -> Vec<u64> {
        let timeout = self.chunk_timeout;
        let mut expired = Vec::new();
        self.pending.retain(|id, partial| {
            if partial.last_chunk_at.elapsed() > timeout {
                expired.push(*id);
                false
            } else {
                true
            }
        });
        for id in &expired {
            warn!(message_id = id, "chunk timeout, abandoning message");
        }
        if !expired.is_empty() {
            self.queued_chunks = self.pending.values().map(|p| p.chunks.len()).sum();
        }
        expired
    }

    /// Messages currently mid-reassembly.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_message, ChunkHeader, HEADER_LEN, LARGE_CHUNK_SIZE};

    fn decode(bytes: &Bytes) -> Chunk {
        let header_bytes: [u8; HEADER_LEN] = bytes[..HEADER_LEN].try_into().unwrap();
        Chunk {
            header: ChunkHeader::decode(&header_bytes),
            payload: bytes.slice(HEADER_LEN..),
        }
    }

    fn reassembler() -> Reassembler {
        Reassembler::new(64, Duration::from_secs(5))
    }

    #[test]
    fn sole_chunk_completes_immediately() {
        let mut r = reassembler();
        let chunks = chunk_message(5, b"tiny");
        let (id, payload) = r.push(decode(&chunks[0])).unwrap().unwrap();
        assert_eq!(id, 5);
        assert_eq!(&payload[..], b"tiny");
        assert_eq!(r.in_flight(), 0);
    }

    #[test]
    fn multi_chunk_message_reassembles() {
        let mut r = reassembler();
        let payload: Vec<u8> = (0..LARGE_CHUNK_SIZE * 2 + 17).map(|i| (i % 255) as u8).collect();
        let chunks = chunk_message(9, &payload);
        assert!(chunks.len() >= 3);

        let mut result = None;
        for chunk in &chunks {
            result = r.push(decode(chunk)).unwrap();
        }
        let (id, rebuilt) = result.unwrap();
        assert_eq!(id, 9);
        assert_eq!(&rebuilt[..], &payload[..]);
        assert_eq!(r.in_flight(), 0);
        assert!(!r.over_limit());
    }

    #[test]
    fn interleaved_messages_keep_separate_awaiters() {
        let mut r = reassembler();
        let a: Vec<u8> = vec![1; LARGE_CHUNK_SIZE * 2];
        let b: Vec<u8> = vec![2; LARGE_CHUNK_SIZE * 2];
        let chunks_a = chunk_message(1, &a);
        let chunks_b = chunk_message(2, &b);

        // Interleave: a0 b0 a1 b1 ...
        let mut done = Vec::new();
        for (ca, cb) in chunks_a.iter().zip(chunks_b.iter()) {
            if let Some(hit) = r.push(decode(ca)).unwrap() {
                done.push(hit);
            }
            if let Some(hit) = r.push(decode(cb)).unwrap() {
                done.push(hit);
            }
        }
        assert_eq!(done.len(), 2);
        assert!(done.iter().any(|(id, p)| *id == 1 && p[0] == 1));
        assert!(done.iter().any(|(id, p)| *id == 2 && p[0] == 2));
    }

    #[test]
    fn continuation_without_first_is_corrupt() {
        let mut r = reassembler();
        let payload = vec![0u8; LARGE_CHUNK_SIZE * 2];
        let chunks = chunk_message(3, &payload);
        assert!(matches!(
            r.push(decode(&chunks[1])),
            Err(Error::Communication(CommunicationKind::CorruptMessage))
        ));
    }

    #[test]
    fn duplicate_first_is_corrupt() {
        let mut r = reassembler();
        let payload = vec![0u8; LARGE_CHUNK_SIZE * 2];
        let chunks = chunk_message(3, &payload);
        r.push(decode(&chunks[0])).unwrap();
        assert!(r.push(decode(&chunks[0])).is_err());
    }

    #[test]
    fn backpressure_trips_past_the_bound() {
        let mut r = Reassembler::new(2, Duration::from_secs(5));
        let payload = vec![0u8; LARGE_CHUNK_SIZE * 4];
        let chunks = chunk_message(3, &payload);
        r.push(decode(&chunks[0])).unwrap();
        assert!(!r.over_limit());
        r.push(decode(&chunks[1])).unwrap();
        r.push(decode(&chunks[2])).unwrap();
        assert!(r.over_limit());
    }

    #[test]
    fn quiet_transfers_expire() {
        let mut r = Reassembler::new(64, Duration::from_millis(1));
        let payload = vec![0u8; LARGE_CHUNK_SIZE * 2];
        let chunks = chunk_message(3, &payload);
        r.push(decode(&chunks[0])).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(r.expire(), vec![3]);
        assert_eq!(r.in_flight(), 0);
        assert_eq!(r.expire(), Vec::<u64>::new());
    }
}
