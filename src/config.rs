//! Serve tuning knobs.
//!
//! Defaults match the protocol constants the peer expects. A TOML file can
//! override them and CLI flags override the file.

use crate::error::{Result, ServeError};
use crate::streaming::protocol::{BLOCK_SIZE, MAGIC_SIZE, REQUEST_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Blocking wait for the next command before giving up (5 minutes).
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 300_000;

/// Blocks sent by one scheduler tick.
pub const DEFAULT_PREFETCH_BLOCKS_PER_TICK: usize = 128;

/// Blocks queued right after a served miss.
pub const DEFAULT_LOOKAHEAD_BLOCKS: usize = 7;

/// Pending output is flushed once it grows past this many blocks.
pub const DEFAULT_CHUNK_FLUSH_BLOCKS: usize = 31;

/// Capacity of the incoming data buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServeConfig {
    pub idle_timeout_ms: u64,
    pub prefetch_blocks_per_tick: usize,
    pub lookahead_blocks: usize,
    pub chunk_flush_blocks: usize,
    pub read_buffer_size: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            prefetch_blocks_per_tick: DEFAULT_PREFETCH_BLOCKS_PER_TICK,
            lookahead_blocks: DEFAULT_LOOKAHEAD_BLOCKS,
            chunk_flush_blocks: DEFAULT_CHUNK_FLUSH_BLOCKS,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ServeConfig {
    /// Load from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ServeError::FileIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_ms == 0 {
            return Err(ServeError::Config(
                "idle_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.prefetch_blocks_per_tick == 0 {
            return Err(ServeError::Config(
                "prefetch_blocks_per_tick must be greater than zero".to_string(),
            ));
        }
        if self.read_buffer_size < MAGIC_SIZE + REQUEST_SIZE {
            return Err(ServeError::Config(format!(
                "read_buffer_size must hold at least one command ({} bytes)",
                MAGIC_SIZE + REQUEST_SIZE
            )));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Pending output size that triggers a flush.
    pub fn chunk_flush_bytes(&self) -> usize {
        self.chunk_flush_blocks * BLOCK_SIZE
    }
}
