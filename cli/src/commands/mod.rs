pub mod backup;
pub mod backups;
pub mod fsck;
pub mod gc;
pub mod remove;
pub mod restore;

use crate::Cli;
use crate::config::{Config, LockBackend};
use anyhow::{Context as _, Result};
use larder_backends::{
    Backend, ContentPool, FileLockService, LocalBackend, QuorumLockService, RetryConfig,
    retry_with_backoff,
};
use larder_core::{LockService, RefCounter, Store};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything a command needs, built once from flags and configuration.
pub struct Context {
    pub config: Config,
    pub counter: RefCounter,
    pub pool: ContentPool<LocalBackend>,
    retry: RetryConfig,
}

impl Context {
    pub async fn open(cli: &Cli) -> Result<Self> {
        let config = Config::load(cli.config.as_deref())?;
        let store_path = config.store_path(cli.store.as_deref())?;
        info!("Opening store at: {}", store_path.display());

        let store = Store::new(&store_path);
        let pool = ContentPool::new(LocalBackend::new(store.pool_dir()))
            .with_compression_level(config.compression_level);
        pool.backend()
            .init()
            .await
            .with_context(|| format!("Failed to prepare pool in {}", store_path.display()))?;

        let locks = lock_service(&config, &store_path)?;
        let counter = RefCounter::new(store, locks, config.lock_timeout());
        Ok(Self {
            retry: config.lock_retry(),
            config,
            counter,
            pool,
        })
    }

    pub fn store(&self) -> &Store {
        self.counter.store()
    }

    /// Re-runs `operation` while it fails on lock contention.
    pub async fn retrying<F, Fut, T>(&self, name: &str, operation: F) -> larder_core::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = larder_core::Result<T>>,
    {
        retry_with_backoff(&self.retry, name, operation).await
    }
}

fn lock_service(config: &Config, store: &Path) -> Result<Arc<dyn LockService>> {
    let directories = config.lock_directories(store);
    match config.lock.backend {
        LockBackend::File => {
            if directories.len() > 1 {
                warn!(
                    count = directories.len(),
                    "File locking uses only the first lock directory"
                );
            }
            Ok(Arc::new(FileLockService::new(&directories[0])))
        }
        LockBackend::Quorum => {
            let nodes = directories
                .iter()
                .map(|dir| Arc::new(FileLockService::new(dir)) as Arc<dyn LockService>)
                .collect();
            Ok(Arc::new(QuorumLockService::new(nodes)?))
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GiB");
    }
}
