use async_trait::async_trait;
use larder_core::lock::{LockHandle, LockService};
use larder_core::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Majority lock over independent nodes. A lock is held once more than half
/// of the nodes granted it; a minority grant is released before retrying.
pub struct QuorumLockService {
    nodes: Vec<Arc<dyn LockService>>,
    attempt_timeout: Duration,
    held: Mutex<HashMap<String, Vec<(usize, LockHandle)>>>,
    next_token: AtomicU64,
}

impl QuorumLockService {
    pub fn new(nodes: Vec<Arc<dyn LockService>>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::Config("quorum lock needs at least one node".into()));
        }
        Ok(Self {
            nodes,
            attempt_timeout: Duration::from_millis(50),
            held: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        })
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    async fn release_all(&self, grants: Vec<(usize, LockHandle)>) {
        for (index, handle) in grants {
            if let Err(e) = self.nodes[index].release(handle).await {
                warn!(node = index, error = %e, "Failed to release quorum member");
            }
        }
    }

    /// One round over every node. Returns the grants when a majority agreed.
    async fn try_round(&self, resources: &[String]) -> Option<Vec<(usize, LockHandle)>> {
        let mut grants = Vec::with_capacity(self.nodes.len());
        for (index, node) in self.nodes.iter().enumerate() {
            match node.acquire(resources, self.attempt_timeout).await {
                Ok(handle) => grants.push((index, handle)),
                Err(e) if e.is_lock_timeout() => {}
                Err(e) => warn!(node = index, error = %e, "Quorum member unavailable"),
            }
        }

        if grants.len() >= self.quorum() {
            Some(grants)
        } else {
            debug!(
                granted = grants.len(),
                needed = self.quorum(),
                "No quorum, backing off"
            );
            self.release_all(grants).await;
            None
        }
    }
}

#[async_trait]
impl LockService for QuorumLockService {
    async fn acquire(&self, resources: &[String], timeout: Duration) -> Result<LockHandle> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(grants) = self.try_round(resources).await {
                let token = format!("quorum-{}", self.next_token.fetch_add(1, Ordering::Relaxed));
                self.held
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(token.clone(), grants);
                return Ok(LockHandle::new(token, resources.to_vec()));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout {
                    resources: resources.to_vec(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            // Random pause so competing clients do not split the nodes forever.
            let pause = Duration::from_millis(rand::random::<u64>() % 20 + 1);
            tokio::time::sleep(pause.min(deadline - now)).await;
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<()> {
        let grants = self
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(handle.token());
        match grants {
            Some(grants) => self.release_all(grants).await,
            None => warn!(token = handle.token(), "Released a lock this service does not hold"),
        }
        Ok(())
    }
}
