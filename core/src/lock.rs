//! Named mutual exclusion consumed by every ledger mutation.
//!
//! Each scope has its own resource name: `host:<name>` for a host ledger and
//! its backups, `pool` for the pool ledger and the unused set. When both are
//! needed the host lock is always taken first.

use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

pub const POOL_RESOURCE: &str = "pool";

pub fn host_resource(host: &str) -> String {
    format!("host:{}", host)
}

/// Proof of a held lock. Hand it back to the service that issued it.
#[derive(Debug)]
pub struct LockHandle {
    token: String,
    resources: Vec<String>,
}

impl LockHandle {
    pub fn new(token: impl Into<String>, resources: Vec<String>) -> Self {
        Self {
            token: token.into(),
            resources,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Takes every resource or none. Fails with `Error::LockTimeout` if they
    /// could not all be held within `timeout`.
    async fn acquire(&self, resources: &[String], timeout: Duration) -> Result<LockHandle>;

    async fn release(&self, handle: LockHandle) -> Result<()>;
}

/// Runs `f` while holding `resources`, releasing on success and on error.
pub async fn with_lock<F, Fut, T>(
    locks: &dyn LockService,
    resources: &[String],
    timeout: Duration,
    f: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let handle = locks.acquire(resources, timeout).await?;
    debug!(resources = ?resources, "Lock acquired");
    let result = f().await;
    let released = locks.release(handle).await;
    debug!(resources = ?resources, "Lock released");
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
    }
}

/// In-process lock table for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct LocalLockService {
    held: Mutex<HashMap<String, String>>,
    released: Notify,
    next_token: AtomicU64,
}

impl LocalLockService {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(&self, resources: &[String], token: &str) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if resources.iter().any(|r| held.contains_key(r)) {
            return false;
        }
        for resource in resources {
            held.insert(resource.clone(), token.to_string());
        }
        true
    }
}

#[async_trait]
impl LockService for LocalLockService {
    async fn acquire(&self, resources: &[String], timeout: Duration) -> Result<LockHandle> {
        let token = format!("local-{}", self.next_token.fetch_add(1, Ordering::Relaxed));
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_take(resources, &token) {
                return Ok(LockHandle::new(token, resources.to_vec()));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::LockTimeout {
                    resources: resources.to_vec(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<()> {
        {
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            for resource in handle.resources() {
                if held.get(resource).map(String::as_str) == Some(handle.token()) {
                    held.remove(resource);
                }
            }
        }
        self.released.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_contention_times_out() {
        let locks = LocalLockService::new();
        let held = locks
            .acquire(&names(&["host:a"]), Duration::from_millis(10))
            .await
            .unwrap();
        let err = locks
            .acquire(&names(&["host:a", "pool"]), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_lock_timeout());

        // The failed attempt must not have grabbed "pool" either.
        let pool = locks
            .acquire(&names(&["pool"]), Duration::from_millis(10))
            .await
            .unwrap();
        locks.release(pool).await.unwrap();
        locks.release(held).await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let locks = Arc::new(LocalLockService::new());
        let held = locks
            .acquire(&names(&["pool"]), Duration::from_millis(10))
            .await
            .unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire(&names(&["pool"]), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.release(held).await.unwrap();
        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.resources(), &names(&["pool"])[..]);
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let locks = LocalLockService::new();
        let resources = names(&["host:b"]);
        let result: Result<()> = with_lock(&locks, &resources, Duration::from_millis(10), || async {
            Err(Error::Other("finalize failed".into()))
        })
        .await;
        assert!(result.is_err());

        let value = with_lock(&locks, &resources, Duration::from_millis(10), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_single_holder_at_a_time() {
        let locks = Arc::new(LocalLockService::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            tasks.push(tokio::spawn(async move {
                let resources = names(&["host:c"]);
                with_lock(locks.as_ref(), &resources, Duration::from_secs(5), || async {
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }
}
