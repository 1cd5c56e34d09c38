use thiserror::Error;

use crate::types::Digest;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupted record at offset {offset}: {reason}")]
    Decode { offset: u64, reason: String },

    #[error("Truncated record at offset {offset} ({remaining} trailing bytes)")]
    Truncated { offset: u64, remaining: usize },

    #[error("Timed out after {timeout_ms}ms waiting for lock on {resources:?}")]
    LockTimeout {
        resources: Vec<String>,
        timeout_ms: u64,
    },

    #[error("Ledger divergence detected on {count} digests")]
    LedgerDivergence { count: usize },

    #[error("Pool integrity fault: {digest} referenced by {path} is missing from the pool")]
    PoolIntegrity { digest: Digest, path: String },

    #[error("Chunk not found: {digest}")]
    ChunkNotFound { digest: Digest },

    #[error("Chunk {digest} is corrupted in the pool")]
    CorruptedChunk { digest: Digest },

    #[error("Backup {host}/{number} not found")]
    BackupNotFound { host: String, number: u32 },

    #[error("Backup {host}/{number} already exists")]
    BackupExists { host: String, number: u32 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when a record stream ended mid-record: everything before
    /// `offset` was decoded and delivered.
    pub fn is_recoverable_truncation(&self) -> bool {
        matches!(self, Error::Truncated { .. })
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Error::LockTimeout { .. })
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Other(format!("bincode: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
