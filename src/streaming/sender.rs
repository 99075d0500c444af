//! Block sender.
//!
//! Reads one block of a served file, picks raw or LZ4 payload, prefixes the
//! response header and hands the frame to the output chunker. A block is read
//! and sent at most once per connection.

use crate::error::Result;
use crate::streaming::chunker::OutputChunker;
use crate::streaming::files::ServedFile;
use crate::streaming::protocol::{
    BlockIndex, CompressionKind, ResponseHeader, BLOCK_SIZE, COMPRESSED_SIZE_MAX,
    RESPONSE_HEADER_SIZE,
};
use tokio::io::AsyncWrite;

/// What happened to a block handed to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Encoded and queued for the transport
    Sent,
    /// Already delivered earlier, nothing was read or written
    Skipped,
}

pub struct BlockSender {
    raw: Box<[u8; BLOCK_SIZE]>,
    frame: Vec<u8>,
    compressed: u64,
    uncompressed: u64,
}

impl Default for BlockSender {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockSender {
    pub fn new() -> Self {
        let bound = lz4_flex::block::get_maximum_output_size(BLOCK_SIZE).max(BLOCK_SIZE);
        Self {
            raw: Box::new([0u8; BLOCK_SIZE]),
            frame: vec![0u8; RESPONSE_HEADER_SIZE + bound],
            compressed: 0,
            uncompressed: 0,
        }
    }

    /// Build the response frame for `index`, or `None` if it was already sent.
    ///
    /// Does not touch the bitmap or the counters; `send_block` updates both
    /// once the frame is handed off.
    pub fn encode(
        &mut self,
        file: &ServedFile,
        index: usize,
    ) -> Result<Option<(CompressionKind, &[u8])>> {
        if index < file.block_count() && file.is_sent(index) {
            return Ok(None);
        }
        let bytes_read = file.read_block(index, &mut self.raw)?;
        let raw = &self.raw[..bytes_read];

        let (compression, payload_len) = {
            let out = &mut self.frame[RESPONSE_HEADER_SIZE..];
            match lz4_flex::block::compress_into(raw, out) {
                Ok(n) if n > 0 && n < COMPRESSED_SIZE_MAX => (CompressionKind::Lz4, n),
                _ => {
                    out[..bytes_read].copy_from_slice(raw);
                    (CompressionKind::None, bytes_read)
                }
            }
        };
        let header = ResponseHeader {
            file_id: file.id,
            compression,
            block_index: index as BlockIndex,
            block_size: payload_len as i16,
        };
        header.put(&mut &mut self.frame[..RESPONSE_HEADER_SIZE]);

        tracing::trace!(
            file_id = file.id,
            index,
            raw = bytes_read,
            payload = payload_len,
            ?compression,
            "Encoded block"
        );
        Ok(Some((
            compression,
            &self.frame[..RESPONSE_HEADER_SIZE + payload_len],
        )))
    }

    /// Encode `index` and queue it on `out`, then mark it sent.
    pub async fn send_block<W: AsyncWrite + Unpin>(
        &mut self,
        file: &mut ServedFile,
        index: usize,
        out: &mut OutputChunker<W>,
        flush: bool,
    ) -> Result<SendOutcome> {
        let Some((compression, frame)) = self.encode(file, index)? else {
            return Ok(SendOutcome::Skipped);
        };
        out.send(frame, flush).await?;
        file.mark_sent(index)?;
        match compression {
            CompressionKind::Lz4 => self.compressed += 1,
            CompressionKind::None => self.uncompressed += 1,
        }
        Ok(SendOutcome::Sent)
    }

    /// Blocks sent LZ4-compressed so far.
    pub fn compressed(&self) -> u64 {
        self.compressed
    }

    /// Blocks sent raw so far.
    pub fn uncompressed(&self) -> u64 {
        self.uncompressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServeError;
    use crate::streaming::protocol::{decode_chunk, split_chunks};
    use bytes::Bytes;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn served(tmp: &TempDir, content: &[u8]) -> ServedFile {
        let path: PathBuf = tmp.path().join("served.bin");
        fs::write(&path, content).unwrap();
        ServedFile::open(0, &path).unwrap()
    }

    /// Deterministic bytes LZ4 cannot shrink.
    fn noise(len: usize) -> Vec<u8> {
        noise_seeded(len, 0x9e37_79b9_7f4a_7c15)
    }

    fn noise_seeded(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn test_compressible_block_uses_lz4() {
        let tmp = TempDir::new().unwrap();
        let file = served(&tmp, &vec![b'a'; BLOCK_SIZE]);
        let mut sender = BlockSender::new();

        let (compression, frame) = sender.encode(&file, 0).unwrap().unwrap();
        assert_eq!(compression, CompressionKind::Lz4);
        let frames = decode_chunk(Bytes::copy_from_slice(frame)).unwrap();
        assert_eq!(frames[0].header.compression, CompressionKind::Lz4);
        assert!((frames[0].header.block_size as usize) < COMPRESSED_SIZE_MAX);
        assert_eq!(frames[0].decompressed().unwrap(), vec![b'a'; BLOCK_SIZE]);
    }

    #[test]
    fn test_incompressible_block_sent_raw() {
        let tmp = TempDir::new().unwrap();
        let content = noise(BLOCK_SIZE);
        let file = served(&tmp, &content);
        let mut sender = BlockSender::new();

        let (compression, frame) = sender.encode(&file, 0).unwrap().unwrap();
        assert_eq!(compression, CompressionKind::None);
        let frames = decode_chunk(Bytes::copy_from_slice(frame)).unwrap();
        assert_eq!(frames[0].header.compression, CompressionKind::None);
        assert_eq!(frames[0].header.block_size as usize, BLOCK_SIZE);
        assert_eq!(frames[0].payload.as_ref(), content.as_slice());
    }

    /// Random bytes followed by zeros. The LZ4 output grows by about one
    /// byte per random byte, so sweeping the split hits every size near the
    /// raw fallback threshold.
    fn block_compressing_to(target: usize) -> Vec<u8> {
        (1..16u64)
            .flat_map(|seed| (0..=BLOCK_SIZE).map(move |split| (seed, split)))
            .map(|(seed, split)| {
                let mut block = noise_seeded(split, seed);
                block.resize(BLOCK_SIZE, 0);
                block
            })
            .find(|block| lz4_flex::block::compress(block).len() == target)
            .unwrap_or_else(|| panic!("no block compresses to {} bytes", target))
    }

    fn encoded_kind(content: &[u8]) -> (CompressionKind, usize) {
        let tmp = TempDir::new().unwrap();
        let file = served(&tmp, content);
        let mut sender = BlockSender::new();
        let (compression, frame) = sender.encode(&file, 0).unwrap().unwrap();
        (compression, frame.len() - RESPONSE_HEADER_SIZE)
    }

    #[test]
    fn test_compression_threshold_is_strict() {
        assert_eq!(COMPRESSED_SIZE_MAX, 3891);

        let below = block_compressing_to(COMPRESSED_SIZE_MAX - 1);
        assert_eq!(
            encoded_kind(&below),
            (CompressionKind::Lz4, COMPRESSED_SIZE_MAX - 1)
        );

        let at = block_compressing_to(COMPRESSED_SIZE_MAX);
        assert_eq!(encoded_kind(&at), (CompressionKind::None, BLOCK_SIZE));
    }

    #[test]
    fn test_short_tail_block() {
        let tmp = TempDir::new().unwrap();
        let content = noise(10000);
        let file = served(&tmp, &content);
        let mut sender = BlockSender::new();

        let (_, frame) = sender.encode(&file, 2).unwrap().unwrap();
        let frames = decode_chunk(Bytes::copy_from_slice(frame)).unwrap();
        assert_eq!(frames[0].header.block_index, 2);
        assert_eq!(frames[0].decompressed().unwrap(), &content[8192..]);
    }

    #[test]
    fn test_out_of_range_is_error() {
        let tmp = TempDir::new().unwrap();
        let file = served(&tmp, &[1u8; 100]);
        let mut sender = BlockSender::new();
        let err = sender.encode(&file, 1).unwrap_err();
        assert!(matches!(err, ServeError::BlockOutOfRange { .. }));
    }

    #[tokio::test]
    async fn test_send_block_at_most_once() {
        let tmp = TempDir::new().unwrap();
        let mut file = served(&tmp, &vec![7u8; 3 * BLOCK_SIZE]);
        let mut sender = BlockSender::new();
        let mut out = OutputChunker::new(Vec::new(), 1 << 20);

        let first = sender.send_block(&mut file, 1, &mut out, true).await.unwrap();
        let written = out.get_ref().len();
        let second = sender.send_block(&mut file, 1, &mut out, true).await.unwrap();

        assert_eq!(first, SendOutcome::Sent);
        assert_eq!(second, SendOutcome::Skipped);
        assert_eq!(out.get_ref().len(), written);
        assert!(file.is_sent(1));
        assert_eq!(file.sent_count(), 1);
        assert_eq!(sender.compressed() + sender.uncompressed(), 1);

        let chunks = split_chunks(Bytes::from(out.into_inner())).unwrap();
        assert_eq!(chunks.len(), 1);
        let frames = decode_chunk(chunks[0].clone()).unwrap();
        assert_eq!(frames[0].header.file_id, 0);
        assert_eq!(frames[0].header.block_index, 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_not_counted() {
        let tmp = TempDir::new().unwrap();
        let mut file = served(&tmp, &vec![7u8; BLOCK_SIZE]);
        let mut sender = BlockSender::new();
        let (peer, writer) = tokio::io::duplex(64);
        drop(peer);
        let mut out = OutputChunker::new(writer, 1 << 20);

        for _ in 0..2 {
            let err = sender
                .send_block(&mut file, 0, &mut out, true)
                .await
                .unwrap_err();
            assert!(matches!(err, ServeError::TransportWrite { .. }));
        }
        assert!(!file.is_sent(0));
        assert_eq!(sender.compressed(), 0);
        assert_eq!(sender.uncompressed(), 0);
    }

    #[tokio::test]
    async fn test_counters_follow_delivery() {
        let tmp = TempDir::new().unwrap();
        let mut content = vec![b'a'; BLOCK_SIZE];
        content.extend(noise(BLOCK_SIZE));
        let mut file = served(&tmp, &content);
        let mut sender = BlockSender::new();
        let mut out = OutputChunker::new(Vec::new(), 1 << 20);

        sender.send_block(&mut file, 0, &mut out, false).await.unwrap();
        sender.send_block(&mut file, 1, &mut out, false).await.unwrap();
        sender.send_block(&mut file, 1, &mut out, false).await.unwrap();
        assert_eq!(sender.compressed(), 1);
        assert_eq!(sender.uncompressed(), 1);
    }
}
