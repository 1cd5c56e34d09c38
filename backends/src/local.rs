use crate::backend::{Backend, ObjectInfo};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use larder_core::{Error, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

const TEMP_SUFFIX: &str = ".tmp";

pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    /// Each writer gets its own temp name, so concurrent writers of one
    /// path never share a file and the last rename wins.
    fn temp_path(full_path: &Path) -> PathBuf {
        let name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        full_path.with_file_name(format!(".{}.{}{}", name, Uuid::new_v4().simple(), TEMP_SUFFIX))
    }

    fn is_temp_name(name: &str) -> bool {
        name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(path)).await?)
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let data = fs::read(self.full_path(path)).await?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let full_path = self.full_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp = Self::temp_path(&full_path);
        let result = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp, &full_path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&temp).await;
            return Err(Error::Backend(format!("Failed to write {}: {}", path, e)));
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Backend(format!("Failed to delete {}: {}", path, e))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut results = Vec::new();
        let mut pending = vec![self.full_path(prefix)];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let name = entry.file_name();
                if Self::is_temp_name(&name.to_string_lossy()) {
                    continue;
                }
                if let Ok(relative) = entry.path().strip_prefix(&self.base_path) {
                    let parts: Vec<_> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    results.push(parts.join("/"));
                }
            }
        }

        results.sort();
        debug!(prefix, objects = results.len(), "Listed objects");
        Ok(results)
    }

    async fn stat(&self, path: &str) -> Result<Option<ObjectInfo>> {
        let metadata = match fs::metadata(self.full_path(path)).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Backend(format!("Failed to stat {}: {}", path, e))),
        };
        let modified: DateTime<Utc> = metadata.modified()?.into();
        Ok(Some(ObjectInfo {
            path: path.to_string(),
            size: metadata.len(),
            modified,
        }))
    }

    async fn touch(&self, path: &str) -> Result<bool> {
        let file = match fs::OpenOptions::new()
            .write(true)
            .open(self.full_path(path))
            .await
        {
            Ok(file) => file.into_std().await,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        tokio::task::spawn_blocking(move || file.set_modified(SystemTime::now()))
            .await
            .map_err(|e| Error::Backend(format!("touch task failed: {}", e)))??;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.init().await.unwrap();

        backend.write("ab/cd/one", Bytes::from_static(b"1")).await.unwrap();
        backend.write("ab/two", Bytes::from_static(b"22")).await.unwrap();
        backend.write("ab/two", Bytes::from_static(b"222")).await.unwrap();

        assert_eq!(backend.read("ab/two").await.unwrap(), Bytes::from_static(b"222"));
        assert_eq!(backend.list("").await.unwrap(), vec!["ab/cd/one", "ab/two"]);
        assert_eq!(backend.list("ab/cd").await.unwrap(), vec!["ab/cd/one"]);
        assert_eq!(backend.stat("ab/two").await.unwrap().unwrap().size, 3);

        backend.delete("ab/two").await.unwrap();
        backend.delete("ab/two").await.unwrap();
        assert!(!backend.exists("ab/two").await.unwrap());
        assert!(backend.stat("ab/two").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_object_reads_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        match backend.read("nope").await {
            Err(Error::Io(e)) => assert_eq!(e.kind(), ErrorKind::NotFound),
            other => panic!("unexpected: {:?}", other.map(|b| b.len())),
        }
        assert!(!backend.touch("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_touch_moves_mtime_forward() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.write("obj", Bytes::from_static(b"x")).await.unwrap();

        let old = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(86_400);
        std::fs::File::options()
            .write(true)
            .open(dir.path().join("obj"))
            .unwrap()
            .set_modified(old)
            .unwrap();
        let before = backend.stat("obj").await.unwrap().unwrap().modified;

        assert!(backend.touch("obj").await.unwrap());
        let after = backend.stat("obj").await.unwrap().unwrap().modified;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_concurrent_writers_of_one_path() {
        let dir = tempfile::tempdir().unwrap();
        let backend = std::sync::Arc::new(LocalBackend::new(dir.path()));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let backend = backend.clone();
            tasks.push(tokio::spawn(async move {
                backend
                    .write("same/object", Bytes::from_static(b"identical"))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(
            backend.read("same/object").await.unwrap(),
            Bytes::from_static(b"identical")
        );
        assert_eq!(backend.list("").await.unwrap(), vec!["same/object"]);
    }
}
