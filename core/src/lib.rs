pub mod chunker;
pub mod codec;
pub mod error;
mod fsutil;
pub mod ledger;
pub mod lock;
pub mod manifest;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod refcnt;
pub mod restore;
pub mod scanner;
pub mod store;
pub mod types;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};
pub use ledger::Ledger;
pub use lock::{LocalLockService, LockService, with_lock};
pub use pipeline::{BackupOptions, BackupRun, FileSource, LocalFileSource, Stage};
pub use pool::{ChunkPool, PutOutcome};
pub use refcnt::{RefCounter, SweepOptions, SweepReport, VerifyOptions, VerifyReport};
pub use store::{BackupInfo, BackupState, Store};
pub use types::*;
