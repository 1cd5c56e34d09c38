use async_trait::async_trait;
use fs4::FileExt;
use larder_core::lock::{LockHandle, LockService};
use larder_core::{Error, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Advisory `flock` locks on files under a shared directory, so separate
/// processes (or hosts on a shared filesystem) exclude each other.
pub struct FileLockService {
    dir: PathBuf,
    poll_interval: Duration,
    /// Written into each lock file while held, for operators.
    holder: String,
    held: Mutex<HashMap<String, Vec<File>>>,
    next_token: AtomicU64,
}

impl FileLockService {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            poll_interval: Duration::from_millis(25),
            holder: format!(
                "{} {}",
                hostname::get()
                    .map(|h| h.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "unknown".to_string()),
                std::process::id()
            ),
            held: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(dir: &Path, resource: &str) -> PathBuf {
        let name: String = resource
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        dir.join(format!("{}.lock", name))
    }
}

/// Locks every resource or none. `Ok(None)` means one was held elsewhere.
fn try_lock_all(
    dir: &Path,
    resources: &[String],
    holder: &str,
) -> std::io::Result<Option<Vec<File>>> {
    std::fs::create_dir_all(dir)?;
    let mut files = Vec::with_capacity(resources.len());
    for resource in resources {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(FileLockService::lock_path(dir, resource))?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                file.set_len(0)?;
                file.write_all(holder.as_bytes())?;
                files.push(file);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                let mut current = String::new();
                let _ = file.read_to_string(&mut current);
                debug!(resource = %resource, holder = %current.trim(), "Lock file busy");
                unlock_all(files);
                return Ok(None);
            }
            Err(err) => {
                unlock_all(files);
                return Err(err);
            }
        }
    }
    Ok(Some(files))
}

fn unlock_all(files: Vec<File>) {
    for file in files {
        if let Err(e) = FileExt::unlock(&file) {
            warn!(error = %e, "Failed to unlock lock file");
        }
    }
}

#[async_trait]
impl LockService for FileLockService {
    async fn acquire(&self, resources: &[String], timeout: Duration) -> Result<LockHandle> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let attempt = {
                let dir = self.dir.clone();
                let resources = resources.to_vec();
                let holder = self.holder.clone();
                tokio::task::spawn_blocking(move || try_lock_all(&dir, &resources, &holder))
                    .await
                    .map_err(|e| Error::Other(format!("lock task failed: {}", e)))??
            };

            if let Some(files) = attempt {
                let token = format!("file-{}", self.next_token.fetch_add(1, Ordering::Relaxed));
                self.held
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(token.clone(), files);
                debug!(resources = ?resources, dir = %self.dir.display(), "File lock acquired");
                return Ok(LockHandle::new(token, resources.to_vec()));
            }

            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Err(Error::LockTimeout {
                    resources: resources.to_vec(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<()> {
        let files = self
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(handle.token());
        match files {
            Some(files) => unlock_all(files),
            None => warn!(token = handle.token(), "Released a lock this service does not hold"),
        }
        Ok(())
    }
}
