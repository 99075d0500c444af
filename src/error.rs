use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::streaming::protocol::FileId;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("Failed to read {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Block {index} is past the end of file {file_id} ({blocks} blocks)")]
    BlockOutOfRange {
        file_id: FileId,
        index: i64,
        blocks: usize,
    },

    #[error("Unknown file id {0}")]
    UnknownFile(FileId),

    #[error("Too many files: {0} (file ids are 16-bit)")]
    TooManyFiles(usize),

    #[error("Handshake failed, connection is dead: {0}")]
    Handshake(#[source] io::Error),

    #[error("Failed to write {bytes} bytes to transport: {source}")]
    TransportWrite {
        bytes: usize,
        #[source]
        source: io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ServeError>;

impl From<toml::de::Error> for ServeError {
    fn from(err: toml::de::Error) -> Self {
        ServeError::Config(err.to_string())
    }
}
