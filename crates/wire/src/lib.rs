//! Chunked binary framing for the HelioDB RPC protocol
//!
//! Messages travel as one or more chunks. Small messages ride a single
//! small chunk; larger payloads split across large chunks with first/last
//! flags. The receiver reassembles per message id with backpressure and a
//! chunk timeout; the sender tracks pending requests in per-core shards.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod codec;
pub mod message_id;
pub mod pending;
pub mod reassembly;

pub use chunk::{chunk_message, Chunk, ChunkHeader, FLAG_FIRST, FLAG_LAST, HEADER_LEN, HEADER_VERSION, LARGE_CHUNK_SIZE, SMALL_CHUNK_SIZE};
pub use codec::ChunkCodec;
pub use message_id::{direction_of, Direction, MessageIdAllocator};
pub use pending::PendingRequests;
pub use reassembly::Reassembler;
