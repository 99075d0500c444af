//! Serve statistics.

use serde::Serialize;
use std::time::Duration;

/// Counters for one served connection.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ServeStats {
    /// Block-missing requests received, valid or not
    pub misses: u64,

    /// Misses that caused a block to be sent
    pub misses_sent: u64,

    /// Blocks sent by the prefetch scheduler
    pub prefetch_sent: u64,

    /// Blocks sent LZ4-compressed
    pub compressed: u64,

    /// Blocks sent raw
    pub uncompressed: u64,

    /// Bytes written to the transport, chunk headers included
    pub bytes_sent: u64,

    /// Chunks written to the transport
    pub chunks_sent: u64,

    /// Time since the first command read
    #[serde(serialize_with = "serialize_millis", rename = "elapsed_ms")]
    pub elapsed: Duration,
}

impl ServeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks_sent(&self) -> u64 {
        self.compressed + self.uncompressed
    }

    pub fn megabytes_sent(&self) -> f64 {
        self.bytes_sent as f64 / 1024.0 / 1024.0
    }

    /// Log the final summary.
    pub fn log_summary(&self) {
        tracing::info!(
            misses = self.misses,
            unique_misses = self.misses_sent,
            prefetched = self.prefetch_sent,
            compressed = self.compressed,
            uncompressed = self.uncompressed,
            mb = %format!("{:.3}", self.megabytes_sent()),
            elapsed_ms = %format!("{:.3}", self.elapsed.as_secs_f64() * 1000.0),
            "Streaming completed"
        );
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_sent() {
        let stats = ServeStats {
            compressed: 3,
            uncompressed: 2,
            ..ServeStats::new()
        };
        assert_eq!(stats.blocks_sent(), 5);
    }

    #[test]
    fn test_json_shape() {
        let stats = ServeStats {
            misses: 4,
            misses_sent: 2,
            bytes_sent: 2 * 1024 * 1024,
            elapsed: Duration::from_millis(1500),
            ..ServeStats::new()
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["misses"], 4);
        assert_eq!(value["misses_sent"], 2);
        assert_eq!(value["elapsed_ms"], 1500);
        assert!((stats.megabytes_sent() - 2.0).abs() < f64::EPSILON);
    }
}
