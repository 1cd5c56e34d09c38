use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use larder_backends::RetryConfig;
use larder_core::chunker::DEFAULT_CHUNK_SIZE;
use larder_core::{BackupOptions, SweepOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_path: Option<PathBuf>,
    pub chunk_size: usize,
    pub parallelism: usize,
    pub compression_level: u32,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub lock: LockConfig,
    pub gc: GcConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    File,
    Quorum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub backend: LockBackend,
    /// Empty means `<store>/locks`. A quorum uses each entry as one node.
    pub directories: Vec<PathBuf>,
    pub timeout_ms: u64,
    pub retry: LockRetry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockRetry {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub grace_secs: u64,
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallelism: 4,
            compression_level: 6,
            includes: Vec::new(),
            excludes: Vec::new(),
            lock: LockConfig::default(),
            gc: GcConfig::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::File,
            directories: Vec::new(),
            timeout_ms: 30_000,
            retry: LockRetry::default(),
        }
    }
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            grace_secs: 24 * 60 * 60,
            batch_size: 1024,
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "larder").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads `path`, which must exist, or the default location if it does.
    /// With neither, every field keeps its default.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => {
                    debug!("No configuration file, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::parse(&text)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if self.parallelism == 0 {
            bail!("parallelism must be greater than zero");
        }
        if self.compression_level > 9 {
            bail!("compression_level must be between 0 and 9");
        }
        if self.gc.batch_size == 0 {
            bail!("gc.batch_size must be greater than zero");
        }
        if self.lock.backend == LockBackend::Quorum && self.lock.directories.len() < 3 {
            bail!("a quorum lock needs at least three lock.directories");
        }
        Ok(())
    }

    /// `--store` wins over the configured path.
    pub fn store_path(&self, flag: Option<&Path>) -> Result<PathBuf> {
        flag.map(Path::to_path_buf)
            .or_else(|| self.store_path.clone())
            .ok_or_else(|| anyhow!("Store path required (--store, LARDER_STORE or store_path in config)"))
    }

    pub fn lock_directories(&self, store: &Path) -> Vec<PathBuf> {
        if self.lock.directories.is_empty() {
            vec![store.join("locks")]
        } else {
            self.lock.directories.clone()
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock.timeout_ms)
    }

    pub fn lock_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.lock.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.lock.retry.initial_backoff_ms),
            ..Default::default()
        }
    }

    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions {
            chunk_size: self.chunk_size,
            parallelism: self.parallelism,
        }
    }

    pub fn sweep_options(&self) -> SweepOptions {
        SweepOptions {
            grace: Duration::from_secs(self.gc.grace_secs),
            batch_size: self.gc.batch_size,
        }
    }
}
