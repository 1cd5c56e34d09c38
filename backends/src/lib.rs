pub mod backend;
pub mod local;
pub mod lock_file;
pub mod lock_quorum;
pub mod pool;
pub mod retry;

pub use backend::{Backend, ObjectInfo};
pub use local::LocalBackend;
pub use lock_file::FileLockService;
pub use lock_quorum::QuorumLockService;
pub use pool::ContentPool;
pub use retry::{RetryConfig, Retryable, retry_with_backoff};
