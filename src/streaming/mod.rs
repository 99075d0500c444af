//! Incremental block streaming protocol.
//!
//! Serves fixed-size blocks of a set of local files to a peer that reads them
//! incrementally. The peer asks for missing blocks and hints whole-file
//! prefetches; everything else on the same stream is passed through.
//!
//! # Architecture
//!
//! ```text
//! transport --> FrameScanner --+--> passthrough sink
//!                              |
//!                              +--> Request --> Server
//!                                                 |
//!            PrefetchQueue <----------------------+
//!                  |                              |
//!                  +--> BlockSender (files + lz4) +--> OutputChunker --> transport
//! ```
//!
//! # Wire format
//!
//! Commands: `"INCR" | kind:i16 | file_id:i16 | index_or_count:i32`
//! Responses: `len:u32 | (file_id:i16 | compression:i16 | block_idx:i32 | size:i16 | payload)*`

pub mod chunker;
pub mod files;
pub mod prefetch;
pub mod protocol;
pub mod scanner;
pub mod sender;
pub mod stats;

pub use chunker::OutputChunker;
pub use files::{FileRegistry, ServedFile};
pub use prefetch::{PrefetchQueue, PrefetchRange, PrefetchRejected};
pub use scanner::{FrameScanner, ReadOutcome, ScanOutcome};
pub use sender::{BlockSender, SendOutcome};
pub use stats::ServeStats;

pub use protocol::{
    BlockIndex, CompressionKind, FileId, Request, RequestKind, ResponseFrame, ResponseHeader,
    BLOCK_SIZE, COMPRESSED_SIZE_MAX, DONE_FILE_ID, INCR_MAGIC, OKAY,
};

pub use protocol::{decode_chunk, split_chunks};
