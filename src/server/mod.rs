//! Incremental serving loop.
//!
//! One `Server` per connection owns every piece of per-connection state:
//! the file bitmaps, the prefetch queue and the pending output chunk. Each
//! iteration reads at most one command (blocking only when there is no
//! prefetch work), dispatches it, then runs one prefetch tick.

use crate::config::ServeConfig;
use crate::error::{Result, ServeError};
use crate::streaming::{
    chunker::OutputChunker,
    files::FileRegistry,
    prefetch::{PrefetchQueue, PrefetchRejected},
    protocol::{BlockIndex, FileId, Request, ResponseHeader, OKAY},
    scanner::{FrameScanner, ReadOutcome},
    sender::{BlockSender, SendOutcome},
    stats::ServeStats,
};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Whether the loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub struct Server<R, W, P> {
    config: ServeConfig,
    files: FileRegistry,
    scanner: FrameScanner<R, P>,
    out: OutputChunker<W>,
    sender: BlockSender,
    prefetch: PrefetchQueue,
    stats: ServeStats,
    /// The done notice went out
    done_sent: bool,
    /// The peer reported it has everything
    peer_complete: bool,
    started: Option<Instant>,
}

impl<R, W, P> Server<R, W, P>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    P: AsyncWrite + Unpin,
{
    /// `reader`/`writer` are the two directions of the peer transport,
    /// `passthrough` receives every non-protocol byte read from it.
    pub fn new(
        files: FileRegistry,
        reader: R,
        writer: W,
        passthrough: P,
        config: ServeConfig,
    ) -> Self {
        let scanner = FrameScanner::new(
            reader,
            passthrough,
            config.read_buffer_size,
            config.idle_timeout(),
        );
        let out = OutputChunker::new(writer, config.chunk_flush_bytes());
        Self {
            config,
            files,
            scanner,
            out,
            sender: BlockSender::new(),
            prefetch: PrefetchQueue::new(),
            stats: ServeStats::new(),
            done_sent: false,
            peer_complete: false,
            started: None,
        }
    }

    /// Acknowledge the connection, then serve until the peer tears it down.
    pub async fn serve(mut self) -> Result<ServeStats> {
        self.handshake().await?;
        tracing::info!(files = self.files.len(), "Serving...");

        loop {
            self.notify_if_done().await;

            let blocking = self.prefetch.is_empty();
            if blocking {
                // No idea how long the wait is, so push out whatever is pending
                self.flush().await;
            }

            let idle_exit = self.done_sent || self.peer_complete;
            let outcome = self.scanner.read_request(blocking, idle_exit).await;
            self.started.get_or_insert_with(Instant::now);

            match outcome {
                ReadOutcome::Terminate => {
                    tracing::debug!("Transport closed or idle, stopping");
                    break;
                }
                ReadOutcome::Nothing => {}
                ReadOutcome::Request(request) => {
                    if self.handle_request(request).await == Flow::Stop {
                        break;
                    }
                }
            }

            self.run_tick().await;
        }

        let stats = self.stats();
        tracing::debug!(
            passthrough_bytes = self.scanner.passthrough_bytes(),
            "Serve loop finished"
        );
        Ok(stats)
    }

    /// Write the `OKAY` acknowledgment on the transport.
    pub async fn handshake(&mut self) -> Result<()> {
        let writer = self.out.get_mut();
        writer.write_all(OKAY).await.map_err(ServeError::Handshake)?;
        writer.flush().await.map_err(ServeError::Handshake)?;
        Ok(())
    }

    /// Dispatch one decoded command.
    pub async fn handle_request(&mut self, request: Request) -> Flow {
        match request {
            Request::Destroy => return Flow::Stop,
            Request::ServingComplete => {
                // The peer has everything, but keep serving until it disconnects
                self.peer_complete = true;
                self.stats().log_summary();
            }
            Request::BlockMissing {
                file_id,
                block_index,
            } => self.handle_miss(file_id, block_index).await,
            Request::Prefetch {
                file_id,
                block_count,
            } => self.handle_prefetch(file_id, block_count),
            Request::Unknown {
                kind,
                file_id,
                payload,
            } => {
                tracing::warn!(kind, file_id, payload, "Invalid request");
            }
        }
        Flow::Continue
    }

    async fn handle_miss(&mut self, file_id: FileId, block_index: BlockIndex) {
        self.stats.misses += 1;

        let valid = self.files.total_block_count(file_id).and_then(|blocks| {
            usize::try_from(block_index)
                .ok()
                .filter(|&index| index < blocks)
                .map(|index| (index, blocks))
        });
        let Some((index, blocks)) = valid else {
            tracing::warn!(file_id, block_index, "Received invalid data request");
            return;
        };

        match self.send(file_id, index, true).await {
            Ok(SendOutcome::Sent) => {
                self.stats.misses_sent += 1;
                // The reader likely wants the blocks right after this one too
                self.prefetch
                    .push_lookahead(file_id, index + 1, self.config.lookahead_blocks, blocks);
            }
            Ok(SendOutcome::Skipped) => {
                tracing::trace!(file_id, index, "Missed block was already sent");
            }
            Err(e) => {
                tracing::error!(file_id, index, error = %e, "Failed to send block");
            }
        }
    }

    fn handle_prefetch(&mut self, file_id: FileId, block_count: i32) {
        let Some(blocks) = self.files.total_block_count(file_id) else {
            tracing::warn!(file_id, "Received invalid prefetch request");
            return;
        };
        match self.prefetch.push_file(file_id, blocks) {
            Ok(()) => {
                tracing::debug!(file_id, block_count, blocks, "Received prefetch request");
            }
            Err(PrefetchRejected::Duplicate) => {
                tracing::warn!(file_id, "Received duplicate prefetch request");
            }
        }
    }

    /// Send up to the per-tick budget of queued blocks.
    ///
    /// Only blocks actually sent count against the budget, so already
    /// delivered blocks are skipped for free.
    pub async fn run_tick(&mut self) {
        let mut budget = self.config.prefetch_blocks_per_tick;
        while budget > 0 {
            let Some((file_id, index)) = self.prefetch.next_block() else {
                break;
            };
            match self.send(file_id, index, false).await {
                Ok(SendOutcome::Sent) => {
                    budget -= 1;
                    self.stats.prefetch_sent += 1;
                }
                Ok(SendOutcome::Skipped) => {}
                Err(e) => {
                    tracing::error!(file_id, index, error = %e, "Failed to send block");
                }
            }
        }
    }

    async fn send(&mut self, file_id: FileId, index: usize, flush: bool) -> Result<SendOutcome> {
        let file = self
            .files
            .get_mut(file_id)
            .ok_or(ServeError::UnknownFile(file_id))?;
        self.sender
            .send_block(file, index, &mut self.out, flush)
            .await
    }

    /// Send the done notice once everything has gone out.
    async fn notify_if_done(&mut self) {
        if self.done_sent || !self.prefetch.is_empty() || !self.files.all_sent() {
            return;
        }
        tracing::info!("All files should be loaded. Notifying the peer.");
        if let Err(e) = self.out.send(&ResponseHeader::done().encode(), true).await {
            tracing::warn!(error = %e, "Failed to send done notice");
        }
        self.done_sent = true;
    }

    /// Push out the pending chunk, if any.
    pub async fn flush(&mut self) {
        if let Err(e) = self.out.flush().await {
            tracing::warn!(error = %e, "Failed to flush output");
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> ServeStats {
        ServeStats {
            compressed: self.sender.compressed(),
            uncompressed: self.sender.uncompressed(),
            bytes_sent: self.out.bytes_sent(),
            chunks_sent: self.out.chunks_sent(),
            elapsed: self.started.map(|t| t.elapsed()).unwrap_or_default(),
            ..self.stats.clone()
        }
    }

    pub fn files(&self) -> &FileRegistry {
        &self.files
    }

    pub fn prefetch_queue(&self) -> &PrefetchQueue {
        &self.prefetch
    }

    pub fn done_sent(&self) -> bool {
        self.done_sent
    }

    pub fn output(&self) -> &OutputChunker<W> {
        &self.out
    }
}
