use crate::{Digest, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    pub stored_size: u64,
    /// False when the digest was already present and nothing was written.
    pub written: bool,
}

/// Content-addressed chunk storage.
///
/// `put` of a digest that already exists never rewrites the payload; it only
/// refreshes the object's last-touched time so a pending sweep skips it.
/// `delete` is reserved for the garbage-collection sweep.
#[async_trait]
pub trait ChunkPool: Send + Sync {
    async fn put(&self, digest: &Digest, data: Bytes) -> Result<PutOutcome>;

    async fn exists(&self, digest: &Digest) -> Result<bool>;

    /// Logical bytes; fails with `Error::ChunkNotFound` when absent.
    async fn get(&self, digest: &Digest) -> Result<Bytes>;

    async fn delete(&self, digest: &Digest) -> Result<()>;

    async fn last_touched(&self, digest: &Digest) -> Result<Option<DateTime<Utc>>>;

    /// Every digest physically present.
    async fn list(&self) -> Result<Vec<Digest>>;
}
