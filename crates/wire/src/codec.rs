//! tokio-util codec for wire chunks.
//!
//! Decoding enforces the structural rules that close a connection when
//! violated: a sane chunk size, a supported header version, and a nonzero
//! message id.

use crate::chunk::{Chunk, ChunkHeader, HEADER_LEN, HEADER_VERSION, LARGE_CHUNK_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use helio_core::error::{CommunicationKind, Error};
use tokio_util::codec::{Decoder, Encoder};

/// Chunk encoder/decoder for a framed TCP stream.
#[derive(Debug, Default)]
pub struct ChunkCodec;

impl Decoder for ChunkCodec {
    type Item = Chunk;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Chunk>, Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let header_bytes: [u8; HEADER_LEN] = src[..HEADER_LEN].try_into().expect("checked len");
        let header = ChunkHeader::decode(&header_bytes);

        if (header.chunk_size as usize) < HEADER_LEN
            || header.chunk_size as usize > LARGE_CHUNK_SIZE
        {
            return Err(Error::Communication(CommunicationKind::CorruptMessage));
        }
        if header.header_version != HEADER_VERSION {
            return Err(Error::Communication(CommunicationKind::UnsupportedHeader(
                header.header_version,
            )));
        }
        if header.message_id == 0 {
            // The reserved sentinel must never travel.
            return Err(Error::Communication(CommunicationKind::CorruptMessage));
        }
        if src.len() < header.chunk_size as usize {
            src.reserve(header.chunk_size as usize - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(header.payload_len()).freeze();
        Ok(Some(Chunk { header, payload }))
    }
}

impl Encoder<Bytes> for ChunkCodec {
    type Error = Error;

    /// Encoded chunks are produced by [`crate::chunk::chunk_message`];
    /// the encoder just copies them onto the stream.
    fn encode(&mut self, chunk: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        dst.extend_from_slice(&chunk);
        Ok(())
    }
}
