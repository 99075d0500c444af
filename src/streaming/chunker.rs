//! Output buffering for response frames.
//!
//! Frames are appended to a pending chunk whose first 4 bytes are reserved for
//! a big-endian length. The chunk goes out in a single write when it grows past
//! the flush threshold or when a caller asks for an immediate flush.

use crate::error::{Result, ServeError};
use crate::streaming::protocol::CHUNK_HEADER_SIZE;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub struct OutputChunker<W> {
    writer: W,
    pending: BytesMut,
    flush_threshold: usize,
    bytes_sent: u64,
    chunks_sent: u64,
}

impl<W: AsyncWrite + Unpin> OutputChunker<W> {
    pub fn new(writer: W, flush_threshold: usize) -> Self {
        Self {
            writer,
            pending: BytesMut::with_capacity(flush_threshold + CHUNK_HEADER_SIZE),
            flush_threshold,
            bytes_sent: 0,
            chunks_sent: 0,
        }
    }

    /// Append one encoded frame, flushing if requested or over the threshold.
    pub async fn send(&mut self, frame: &[u8], flush: bool) -> Result<()> {
        if self.pending.is_empty() {
            self.pending.put_u32(0);
        }
        self.pending.extend_from_slice(frame);
        if flush || self.pending.len() > self.flush_threshold {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write out the pending chunk, if any.
    ///
    /// The chunk is dropped even if the write fails; the caller finds out the
    /// transport is gone on its next read.
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let body_len = (self.pending.len() - CHUNK_HEADER_SIZE) as u32;
        self.pending[..CHUNK_HEADER_SIZE].copy_from_slice(&body_len.to_be_bytes());

        let chunk = self.pending.split();
        let bytes = chunk.len();
        let written = async {
            self.writer.write_all(&chunk).await?;
            self.writer.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                self.bytes_sent += bytes as u64;
                self.chunks_sent += 1;
                tracing::trace!(bytes, "Flushed chunk");
                Ok(())
            }
            Err(source) => Err(ServeError::TransportWrite { bytes, source }),
        }
    }

    /// Bytes buffered but not yet written, chunk header included.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Direct access to the transport, bypassing chunk framing.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
