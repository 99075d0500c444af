//! Command extraction from a shared byte stream.
//!
//! The transport carries protocol commands mixed with unrelated traffic. Every
//! byte in front of an `INCR` marker is forwarded verbatim to the passthrough
//! sink; the marker and the fixed-size command after it are consumed.

use crate::streaming::protocol::{Request, INCR_MAGIC, MAGIC_SIZE, REQUEST_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAGIC_BYTES: [u8; MAGIC_SIZE] = INCR_MAGIC.to_be_bytes();

/// Result of one extraction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The bytes that followed a marker
    Frame(Bytes),
    /// Nothing complete arrived before the wait ran out
    Pending,
    /// Blocking wait timed out after serving was already complete
    Idle,
    /// Transport reached end-of-stream or failed
    Closed,
}

/// Result of reading one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Request(Request),
    /// No complete command available right now
    Nothing,
    /// Stop serving: transport closed, or idle after everything was sent
    Terminate,
}

/// Locate the first marker.
///
/// Positions closer than 4 bytes to the end are not checked, so the last four
/// bytes always stay buffered until more data arrives. Returns the number of
/// bytes that can be forwarded and whether a marker starts right after them.
fn find_magic(buf: &[u8]) -> (usize, bool) {
    let scan_len = buf.len().saturating_sub(MAGIC_SIZE);
    match buf
        .windows(MAGIC_SIZE)
        .take(scan_len)
        .position(|w| w == MAGIC_BYTES)
    {
        Some(pos) => (pos, true),
        None => (scan_len, false),
    }
}

/// Length of the longest tail of `buf` that could be the start of a marker.
fn marker_prefix_suffix(buf: &[u8]) -> usize {
    (1..=buf.len().min(MAGIC_SIZE))
        .rev()
        .find(|&k| buf[buf.len() - k..] == MAGIC_BYTES[..k])
        .unwrap_or(0)
}

pub struct FrameScanner<R, P> {
    reader: R,
    passthrough: P,
    buffer: BytesMut,
    scratch: Box<[u8]>,
    idle_timeout: Duration,
    passthrough_bytes: u64,
}

impl<R, P> FrameScanner<R, P>
where
    R: AsyncRead + Unpin,
    P: AsyncWrite + Unpin,
{
    pub fn new(reader: R, passthrough: P, capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            reader,
            passthrough,
            buffer: BytesMut::with_capacity(capacity),
            scratch: vec![0u8; capacity].into_boxed_slice(),
            idle_timeout,
            passthrough_bytes: 0,
        }
    }

    /// Find the next marker followed by `size` bytes and return those bytes.
    ///
    /// With `blocking` the wait for more data lasts up to the idle timeout,
    /// otherwise the transport is only probed. `idle_exit` turns a blocking
    /// timeout into [`ScanOutcome::Idle`].
    pub async fn extract(&mut self, size: usize, blocking: bool, idle_exit: bool) -> ScanOutcome {
        loop {
            let (skip, found) = find_magic(&self.buffer);
            if skip > 0 {
                self.forward(skip).await;
            }

            if found && self.buffer.len() >= MAGIC_SIZE + size {
                self.buffer.advance(MAGIC_SIZE);
                return ScanOutcome::Frame(self.buffer.split_to(size).freeze());
            }

            let room = self.scratch.len().saturating_sub(self.buffer.len());
            if room == 0 {
                // A marker followed by more than the buffer can hold
                tracing::warn!(
                    buffered = self.buffer.len(),
                    "Incoming buffer full without a complete command"
                );
                self.forward(self.buffer.len()).await;
                continue;
            }

            let wait = if blocking {
                self.idle_timeout
            } else {
                Duration::ZERO
            };
            let read =
                tokio::time::timeout(wait, self.reader.read(&mut self.scratch[..room])).await;

            match read {
                Ok(Ok(0)) => {
                    tracing::debug!("Transport reached end of stream");
                    break;
                }
                Ok(Ok(n)) => {
                    self.buffer.extend_from_slice(&self.scratch[..n]);
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Failed to read from transport");
                    break;
                }
                Err(_elapsed) => {
                    // A partial command stays buffered while probing so it can
                    // still be assembled by a later read.
                    if blocking {
                        self.forward(self.buffer.len()).await;
                    } else if !found {
                        let keep = marker_prefix_suffix(&self.buffer);
                        self.forward(self.buffer.len() - keep).await;
                    }
                    if blocking {
                        tracing::warn!(
                            timeout_ms = self.idle_timeout.as_millis() as u64,
                            "Timed out waiting for data from peer"
                        );
                        if idle_exit {
                            return ScanOutcome::Idle;
                        }
                    }
                    return ScanOutcome::Pending;
                }
            }
        }

        self.forward(self.buffer.len()).await;
        ScanOutcome::Closed
    }

    /// Read one command.
    pub async fn read_request(&mut self, blocking: bool, idle_exit: bool) -> ReadOutcome {
        match self.extract(REQUEST_SIZE, blocking, idle_exit).await {
            ScanOutcome::Frame(bytes) => match Request::decode(&bytes) {
                Ok(request) => ReadOutcome::Request(request),
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed command");
                    ReadOutcome::Nothing
                }
            },
            ScanOutcome::Pending => ReadOutcome::Nothing,
            ScanOutcome::Idle | ScanOutcome::Closed => ReadOutcome::Terminate,
        }
    }

    /// Move `n` buffered bytes to the passthrough sink.
    async fn forward(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let bytes = self.buffer.split_to(n);
        let written = async {
            self.passthrough.write_all(&bytes).await?;
            self.passthrough.flush().await
        }
        .await;
        match written {
            Ok(()) => self.passthrough_bytes += n as u64,
            Err(e) => tracing::warn!(error = %e, bytes = n, "Failed to forward passthrough bytes"),
        }
    }

    /// Bytes forwarded to the passthrough sink so far.
    pub fn passthrough_bytes(&self) -> u64 {
        self.passthrough_bytes
    }

    /// Bytes read but not yet consumed or forwarded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn passthrough_ref(&self) -> &P {
        &self.passthrough
    }

    pub fn into_parts(self) -> (R, P) {
        (self.reader, self.passthrough)
    }
}
