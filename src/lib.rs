//! incr-serve - incremental file streaming server.
//!
//! Streams the blocks of a fixed set of files to a peer over a shared byte
//! stream, answering block misses immediately and prefetching the rest in
//! the background.

pub mod config;
pub mod error;
pub mod server;
pub mod streaming;
pub mod transport;

pub use config::ServeConfig;
pub use error::{Result, ServeError};
pub use server::Server;
