//! Incremental serving wire format.
//!
//! Wire format: all multi-byte integers are big-endian.
//!
//! Commands (peer -> server) are embedded in a stream that also carries
//! unrelated bytes, so each one is introduced by the `INCR` marker:
//! magic:u32 | kind:i16 | file_id:i16 | index_or_count:i32
//!
//! Responses (server -> peer) are batched into chunks:
//! chunk_len:u32 | (file_id:i16 | compression:i16 | block_idx:i32 | block_size:i16 | payload)*

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fixed transfer unit.
pub const BLOCK_SIZE: usize = 4096;

/// Compressed payloads at or above this size are sent raw instead.
pub const COMPRESSED_SIZE_MAX: usize = BLOCK_SIZE * 95 / 100;

/// Command marker, the ASCII bytes "INCR" read big-endian.
pub const INCR_MAGIC: u32 = 0x494e_4352;

/// Size of the marker that precedes every command.
pub const MAGIC_SIZE: usize = 4;

/// Size of a command after the marker.
pub const REQUEST_SIZE: usize = 8;

/// Size of the header in front of every block payload.
pub const RESPONSE_HEADER_SIZE: usize = 10;

/// Size of the length prefix in front of every chunk.
pub const CHUNK_HEADER_SIZE: usize = 4;

/// File id reserved for the "all requested data sent" notice.
pub const DONE_FILE_ID: FileId = -1;

/// Handshake acknowledgment written once before serving starts.
pub const OKAY: &[u8; 4] = b"OKAY";

pub type FileId = i16;
pub type BlockIndex = i32;

/// Number of blocks needed to cover `bytes`.
pub fn blocks_for_size(bytes: u64) -> usize {
    bytes.div_ceil(BLOCK_SIZE as u64) as usize
}

/// Byte offset of the first byte of `index`.
pub fn block_offset(index: usize) -> u64 {
    index as u64 * BLOCK_SIZE as u64
}

// =============================================================================
// Request kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum RequestKind {
    ServingComplete = 0,
    BlockMissing = 1,
    Prefetch = 2,
    Destroy = 3,
}

impl RequestKind {
    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(Self::ServingComplete),
            1 => Some(Self::BlockMissing),
            2 => Some(Self::Prefetch),
            3 => Some(Self::Destroy),
            _ => None,
        }
    }
}

// =============================================================================
// Request (peer -> server)
// =============================================================================

/// A decoded control command.
///
/// The last 4 bytes on the wire are a block index for `BlockMissing` and a
/// block count for `Prefetch`; the kind decides which one is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ServingComplete,
    BlockMissing {
        file_id: FileId,
        block_index: BlockIndex,
    },
    Prefetch {
        file_id: FileId,
        block_count: i32,
    },
    Destroy,
    Unknown {
        kind: i16,
        file_id: FileId,
        payload: i32,
    },
}

impl Request {
    /// Decode the 8 bytes that follow the marker.
    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        if payload.remaining() < REQUEST_SIZE {
            anyhow::bail!(
                "Request payload too short: expected {} bytes, got {}",
                REQUEST_SIZE,
                payload.remaining()
            );
        }
        let kind = payload.get_i16();
        let file_id = payload.get_i16();
        let value = payload.get_i32();

        Ok(match RequestKind::from_i16(kind) {
            Some(RequestKind::ServingComplete) => Self::ServingComplete,
            Some(RequestKind::BlockMissing) => Self::BlockMissing {
                file_id,
                block_index: value,
            },
            Some(RequestKind::Prefetch) => Self::Prefetch {
                file_id,
                block_count: value,
            },
            Some(RequestKind::Destroy) => Self::Destroy,
            None => Self::Unknown {
                kind,
                file_id,
                payload: value,
            },
        })
    }

    /// Encode as a full marker-prefixed command, the way a peer sends it.
    pub fn encode(&self) -> Bytes {
        let (kind, file_id, value) = match *self {
            Self::ServingComplete => (RequestKind::ServingComplete as i16, 0, 0),
            Self::BlockMissing {
                file_id,
                block_index,
            } => (RequestKind::BlockMissing as i16, file_id, block_index),
            Self::Prefetch {
                file_id,
                block_count,
            } => (RequestKind::Prefetch as i16, file_id, block_count),
            Self::Destroy => (RequestKind::Destroy as i16, 0, 0),
            Self::Unknown {
                kind,
                file_id,
                payload,
            } => (kind, file_id, payload),
        };

        let mut buf = BytesMut::with_capacity(MAGIC_SIZE + REQUEST_SIZE);
        buf.put_u32(INCR_MAGIC);
        buf.put_i16(kind);
        buf.put_i16(file_id);
        buf.put_i32(value);
        buf.freeze()
    }
}

// =============================================================================
// Compression kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum CompressionKind {
    None = 0,
    Lz4 = 1,
}

impl CompressionKind {
    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            _ => None,
        }
    }
}

// =============================================================================
// Response header (server -> peer)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub file_id: FileId,
    pub compression: CompressionKind,
    pub block_index: BlockIndex,
    pub block_size: i16,
}

impl ResponseHeader {
    /// Header of the zero-payload notice sent once every block went out.
    pub fn done() -> Self {
        Self {
            file_id: DONE_FILE_ID,
            compression: CompressionKind::None,
            block_index: 0,
            block_size: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.file_id == DONE_FILE_ID
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_i16(self.file_id);
        buf.put_i16(self.compression as i16);
        buf.put_i32(self.block_index);
        buf.put_i16(self.block_size);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_SIZE);
        self.put(&mut buf);
        buf.freeze()
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < RESPONSE_HEADER_SIZE {
            anyhow::bail!("Response header truncated");
        }
        let file_id = buf.get_i16();
        let raw_compression = buf.get_i16();
        let compression = CompressionKind::from_i16(raw_compression)
            .with_context(|| format!("Unknown compression kind {}", raw_compression))?;
        let block_index = buf.get_i32();
        let block_size = buf.get_i16();
        if block_size < 0 {
            anyhow::bail!("Negative block size {}", block_size);
        }

        Ok(Self {
            file_id,
            compression,
            block_index,
            block_size,
        })
    }
}

// =============================================================================
// Response frames and chunks (peer side)
// =============================================================================

#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub header: ResponseHeader,
    pub payload: Bytes,
}

impl ResponseFrame {
    /// Original block bytes, decompressing LZ4 payloads.
    pub fn decompressed(&self) -> Result<Vec<u8>> {
        match self.header.compression {
            CompressionKind::None => Ok(self.payload.to_vec()),
            CompressionKind::Lz4 => {
                lz4_flex::block::decompress(&self.payload, BLOCK_SIZE).with_context(|| {
                    format!(
                        "Failed to decompress block {} of file {}",
                        self.header.block_index, self.header.file_id
                    )
                })
            }
        }
    }
}

/// Split one chunk body (the bytes after its length prefix) into frames.
pub fn decode_chunk(mut body: Bytes) -> Result<Vec<ResponseFrame>> {
    let mut frames = Vec::new();
    while body.has_remaining() {
        let header = ResponseHeader::decode(&mut body)?;
        let len = header.block_size as usize;
        if body.remaining() < len {
            anyhow::bail!(
                "Response payload truncated: expected {} bytes, got {}",
                len,
                body.remaining()
            );
        }
        let payload = body.split_to(len);
        frames.push(ResponseFrame { header, payload });
    }
    Ok(frames)
}

/// Split a captured transport byte stream into chunk bodies.
pub fn split_chunks(mut stream: Bytes) -> Result<Vec<Bytes>> {
    let mut chunks = Vec::new();
    while stream.has_remaining() {
        if stream.remaining() < CHUNK_HEADER_SIZE {
            anyhow::bail!("Chunk header truncated");
        }
        let len = stream.get_u32() as usize;
        if stream.remaining() < len {
            anyhow::bail!(
                "Chunk body truncated: expected {} bytes, got {}",
                len,
                stream.remaining()
            );
        }
        chunks.push(stream.split_to(len));
    }
    Ok(chunks)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_is_ascii_incr() {
        assert_eq!(&INCR_MAGIC.to_be_bytes(), b"INCR");
    }

    #[test]
    fn test_compressed_size_max() {
        // 0.95 * 4096 = 3891.2
        assert_eq!(COMPRESSED_SIZE_MAX, 3891);
    }

    #[test]
    fn test_blocks_for_size() {
        assert_eq!(blocks_for_size(0), 0);
        assert_eq!(blocks_for_size(1), 1);
        assert_eq!(blocks_for_size(4096), 1);
        assert_eq!(blocks_for_size(4097), 2);
        assert_eq!(blocks_for_size(10000), 3);
    }

    #[test]
    fn test_request_decode_block_missing() {
        let bytes = [0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x01, 0x00];
        let req = Request::decode(&bytes).unwrap();
        assert_eq!(
            req,
            Request::BlockMissing {
                file_id: 2,
                block_index: 256
            }
        );
    }

    #[test]
    fn test_request_decode_unknown_kind() {
        let bytes = [0x00, 0x09, 0x00, 0x01, 0xff, 0xff, 0xff, 0xff];
        let req = Request::decode(&bytes).unwrap();
        assert_eq!(
            req,
            Request::Unknown {
                kind: 9,
                file_id: 1,
                payload: -1
            }
        );
    }

    #[test]
    fn test_request_decode_too_short() {
        assert!(Request::decode(&[0x00, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_request_encode_layout() {
        let encoded = Request::Prefetch {
            file_id: 3,
            block_count: 7,
        }
        .encode();
        assert_eq!(
            encoded.as_ref(),
            &[b'I', b'N', b'C', b'R', 0, 2, 0, 3, 0, 0, 0, 7]
        );
        let decoded = Request::decode(&encoded[MAGIC_SIZE..]).unwrap();
        assert_eq!(
            decoded,
            Request::Prefetch {
                file_id: 3,
                block_count: 7
            }
        );
    }

    #[test]
    fn test_done_header_layout() {
        let encoded = ResponseHeader::done().encode();
        assert_eq!(encoded.as_ref(), &[0xff, 0xff, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_chunk_with_two_frames() {
        let mut body = BytesMut::new();
        ResponseHeader {
            file_id: 0,
            compression: CompressionKind::None,
            block_index: 4,
            block_size: 3,
        }
        .put(&mut body);
        body.put_slice(b"abc");
        ResponseHeader::done().put(&mut body);

        let frames = decode_chunk(body.freeze()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].header.block_index, 4);
        assert_eq!(frames[0].decompressed().unwrap(), b"abc");
        assert!(frames[1].header.is_done());
        assert!(frames[1].payload.is_empty());
    }

    #[test]
    fn test_decode_chunk_truncated_payload() {
        let mut body = BytesMut::new();
        ResponseHeader {
            file_id: 0,
            compression: CompressionKind::None,
            block_index: 0,
            block_size: 100,
        }
        .put(&mut body);
        body.put_slice(&[0u8; 10]);
        assert!(decode_chunk(body.freeze()).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_compression() {
        let mut buf = Bytes::from_static(&[0, 0, 0, 7, 0, 0, 0, 0, 0, 0]);
        assert!(ResponseHeader::decode(&mut buf).is_err());
    }

    #[test]
    fn test_lz4_frame_decompresses() {
        let raw = vec![b'z'; BLOCK_SIZE];
        let compressed = lz4_flex::block::compress(&raw);
        let frame = ResponseFrame {
            header: ResponseHeader {
                file_id: 0,
                compression: CompressionKind::Lz4,
                block_index: 0,
                block_size: compressed.len() as i16,
            },
            payload: Bytes::from(compressed),
        };
        assert_eq!(frame.decompressed().unwrap(), raw);
    }

    #[test]
    fn test_split_chunks() {
        let mut stream = BytesMut::new();
        stream.put_u32(3);
        stream.put_slice(b"abc");
        stream.put_u32(0);
        let chunks = split_chunks(stream.freeze()).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_ref(), b"abc");
        assert!(chunks[1].is_empty());
    }
}
