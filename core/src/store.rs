use crate::fsutil::{is_not_found, write_atomic};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const POOL_DIR: &str = "pool";
const HOSTS_DIR: &str = "hosts";
const LEDGER_FILE: &str = "refcnt.ledger";
const UNUSED_FILE: &str = "unused.ledger";
const BACKUP_INFO_FILE: &str = "backup.json";
const JOURNAL_FILE: &str = "manifest.journal";
const MANIFEST_FILE: &str = "manifest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupState {
    Running,
    Complete,
    Failed,
    /// Removal started; the ledgers may or may not have been decremented.
    Removing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStats {
    pub files: u64,
    pub bytes: u64,
    pub reused_files: u64,
    pub new_chunks: u64,
    pub new_stored_bytes: u64,
    pub journal_entries: u64,
}

/// Metadata of one backup; only `Complete` backups are live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub host: String,
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub state: BackupState,
    pub degraded: bool,
    #[serde(default)]
    pub failed_files: Vec<String>,
    #[serde(default)]
    pub stats: BackupStats,
}

impl BackupInfo {
    pub fn is_live(&self) -> bool {
        self.state == BackupState::Complete
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{} {:?}{} - {} files at {}",
            self.host,
            self.number,
            self.state,
            if self.degraded { " (degraded)" } else { "" },
            self.stats.files,
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Filesystem layout of a store:
///
/// ```text
/// store/
/// ├── pool/                  chunk payloads, pool ledger, unused set
/// └── hosts/<host>/
///     ├── refcnt.ledger      host ledger
///     └── <n>/               one directory per backup
///         ├── backup.json
///         ├── manifest.journal
///         ├── manifest
///         └── refcnt.ledger
/// ```
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pool_dir(&self) -> PathBuf {
        self.root.join(POOL_DIR)
    }

    pub fn pool_ledger_path(&self) -> PathBuf {
        self.pool_dir().join(LEDGER_FILE)
    }

    pub fn unused_path(&self) -> PathBuf {
        self.pool_dir().join(UNUSED_FILE)
    }

    pub fn host_dir(&self, host: &str) -> PathBuf {
        self.root.join(HOSTS_DIR).join(host)
    }

    pub fn host_ledger_path(&self, host: &str) -> PathBuf {
        self.host_dir(host).join(LEDGER_FILE)
    }

    pub fn backup_dir(&self, host: &str, number: u32) -> PathBuf {
        self.host_dir(host).join(number.to_string())
    }

    pub fn journal_path(&self, host: &str, number: u32) -> PathBuf {
        self.backup_dir(host, number).join(JOURNAL_FILE)
    }

    pub fn manifest_path(&self, host: &str, number: u32) -> PathBuf {
        self.backup_dir(host, number).join(MANIFEST_FILE)
    }

    pub fn backup_ledger_path(&self, host: &str, number: u32) -> PathBuf {
        self.backup_dir(host, number).join(LEDGER_FILE)
    }

    fn backup_info_path(&self, host: &str, number: u32) -> PathBuf {
        self.backup_dir(host, number).join(BACKUP_INFO_FILE)
    }

    pub async fn list_hosts(&self) -> Result<Vec<String>> {
        let mut hosts = Vec::new();
        let mut entries = match fs::read_dir(self.root.join(HOSTS_DIR)).await {
            Ok(entries) => entries,
            Err(e) if is_not_found(&e) => return Ok(hosts),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    hosts.push(name.to_string());
                }
            }
        }
        hosts.sort();
        Ok(hosts)
    }

    /// Every backup of `host` with readable metadata, oldest first.
    pub async fn list_backups(&self, host: &str) -> Result<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        let mut entries = match fs::read_dir(self.host_dir(host)).await {
            Ok(entries) => entries,
            Err(e) if is_not_found(&e) => return Ok(backups),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let Some(number) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            match self.load_backup(host, number).await {
                Ok(info) => backups.push(info),
                Err(e) => warn!(host, number, error = %e, "Skipping unreadable backup"),
            }
        }
        backups.sort_by_key(|b| b.number);
        Ok(backups)
    }

    pub async fn live_backups(&self, host: &str) -> Result<Vec<BackupInfo>> {
        let mut backups = self.list_backups(host).await?;
        backups.retain(BackupInfo::is_live);
        Ok(backups)
    }

    pub async fn latest_live_backup(&self, host: &str) -> Result<Option<BackupInfo>> {
        Ok(self.live_backups(host).await?.pop())
    }

    pub async fn load_backup(&self, host: &str, number: u32) -> Result<BackupInfo> {
        let data = match fs::read(self.backup_info_path(host, number)).await {
            Ok(data) => data,
            Err(e) if is_not_found(&e) => {
                return Err(Error::BackupNotFound {
                    host: host.to_string(),
                    number,
                });
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn save_backup(&self, info: &BackupInfo) -> Result<()> {
        let data = serde_json::to_vec_pretty(info)?;
        write_atomic(&self.backup_info_path(&info.host, info.number), &data).await
    }

    /// Allocates the next backup number for `host`. Directory creation is the
    /// allocation, so two concurrent callers never share a number.
    pub async fn create_backup(&self, host: &str) -> Result<BackupInfo> {
        validate_host(host)?;
        fs::create_dir_all(self.host_dir(host)).await?;

        let mut number = self
            .list_backups(host)
            .await?
            .last()
            .map(|b| b.number + 1)
            .unwrap_or(0);
        loop {
            match fs::create_dir(self.backup_dir(host, number)).await {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => number += 1,
                Err(e) => return Err(e.into()),
            }
        }

        let info = BackupInfo {
            host: host.to_string(),
            number,
            started_at: Utc::now(),
            completed_at: None,
            state: BackupState::Running,
            degraded: false,
            failed_files: Vec::new(),
            stats: BackupStats::default(),
        };
        self.save_backup(&info).await?;
        debug!(host, number, "Created backup");
        Ok(info)
    }

    pub async fn delete_backup_dir(&self, host: &str, number: u32) -> Result<()> {
        match fs::remove_dir_all(self.backup_dir(host, number)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub fn validate_host(host: &str) -> Result<()> {
    let valid = !host.is_empty()
        && host != "."
        && host != ".."
        && !host.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid host name: {:?}", host)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backup_numbers_are_sequential() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let first = store.create_backup("alpha").await.unwrap();
        let second = store.create_backup("alpha").await.unwrap();
        let other = store.create_backup("beta").await.unwrap();
        assert_eq!((first.number, second.number, other.number), (0, 1, 0));
        assert_eq!(store.list_hosts().await.unwrap(), vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_only_complete_backups_are_live() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let mut done = store.create_backup("alpha").await.unwrap();
        let _running = store.create_backup("alpha").await.unwrap();
        done.state = BackupState::Complete;
        store.save_backup(&done).await.unwrap();

        let live = store.live_backups("alpha").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].number, 0);
        assert_eq!(store.list_backups("alpha").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_backup_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        assert!(store.list_hosts().await.unwrap().is_empty());
        assert!(matches!(
            store.load_backup("alpha", 3).await,
            Err(Error::BackupNotFound { number: 3, .. })
        ));
    }

    #[test]
    fn test_host_names_cannot_escape_the_store() {
        assert!(validate_host("web-01").is_ok());
        assert!(validate_host("").is_err());
        assert!(validate_host("..").is_err());
        assert!(validate_host("a/b").is_err());
    }
}
