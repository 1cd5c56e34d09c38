use crate::backend::Backend;
use crate::retry::{RetryConfig, retry_with_backoff};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use larder_core::pool::{ChunkPool, PutOutcome};
use larder_core::{Digest, Error, Result};
use std::io::{Read, Write};
use tracing::{debug, error};

const OBJECT_SUFFIX: &str = ".zz";

/// Content-addressed chunk store over any [`Backend`]. Payloads are
/// zlib-compressed and sharded as `aa/bb/<hex>.zz` by digest prefix.
pub struct ContentPool<B> {
    backend: B,
    level: Compression,
    retry: RetryConfig,
}

impl<B: Backend> ContentPool<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            level: Compression::default(),
            retry: RetryConfig::quick(),
        }
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn object_path(digest: &Digest) -> String {
        let hex = digest.to_hex();
        format!("{}/{}/{}{}", &hex[0..2], &hex[2..4], hex, OBJECT_SUFFIX)
    }

    fn digest_from_path(path: &str) -> Option<Digest> {
        let name = path.rsplit('/').next()?;
        name.strip_suffix(OBJECT_SUFFIX)?.parse().ok()
    }
}

fn compress(data: &[u8], level: Compression) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), level);
    encoder.write_all(data)?;
    encoder.finish()
}

fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(format!("blocking task failed: {}", e)))
}

#[async_trait]
impl<B: Backend> ChunkPool for ContentPool<B> {
    async fn put(&self, digest: &Digest, data: Bytes) -> Result<PutOutcome> {
        let path = Self::object_path(digest);
        if let Some(existing) = self.backend.stat(&path).await? {
            // Refresh the mtime so a sweep marked before this write skips it.
            // A false touch means a sweep deleted it in between; rewrite.
            if self.backend.touch(&path).await? {
                debug!(digest = %digest, "Chunk already stored");
                return Ok(PutOutcome {
                    stored_size: existing.size,
                    written: false,
                });
            }
            debug!(digest = %digest, "Chunk vanished before touch, storing again");
        }

        let level = self.level;
        let payload = Bytes::from(blocking(move || compress(&data, level)).await??);
        let stored_size = payload.len() as u64;
        retry_with_backoff(&self.retry, "pool put", || {
            self.backend.write(&path, payload.clone())
        })
        .await?;
        debug!(digest = %digest, stored_size, "Stored chunk");
        Ok(PutOutcome {
            stored_size,
            written: true,
        })
    }

    async fn exists(&self, digest: &Digest) -> Result<bool> {
        self.backend.exists(&Self::object_path(digest)).await
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        let payload = match self.backend.read(&Self::object_path(digest)).await {
            Ok(payload) => payload,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ChunkNotFound { digest: *digest });
            }
            Err(e) => return Err(e),
        };

        let data = blocking(move || decompress(&payload)).await?;
        let data = match data {
            Ok(data) if Digest::from_data(&data) == *digest => data,
            _ => {
                error!(digest = %digest, "Stored chunk does not match its digest");
                return Err(Error::CorruptedChunk { digest: *digest });
            }
        };
        Ok(Bytes::from(data))
    }

    async fn delete(&self, digest: &Digest) -> Result<()> {
        self.backend.delete(&Self::object_path(digest)).await
    }

    async fn last_touched(&self, digest: &Digest) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .backend
            .stat(&Self::object_path(digest))
            .await?
            .map(|info| info.modified))
    }

    async fn list(&self) -> Result<Vec<Digest>> {
        Ok(self
            .backend
            .list("")
            .await?
            .iter()
            .filter_map(|path| Self::digest_from_path(path))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalBackend;

    fn pool(dir: &tempfile::TempDir) -> ContentPool<LocalBackend> {
        ContentPool::new(LocalBackend::new(dir.path())).with_compression_level(6)
    }

    #[test]
    fn test_object_path_is_sharded() {
        let digest = Digest::from_data(b"chunk");
        let hex = digest.to_hex();
        let path = ContentPool::<LocalBackend>::object_path(&digest);
        assert_eq!(path, format!("{}/{}/{}.zz", &hex[..2], &hex[2..4], hex));
        assert_eq!(ContentPool::<LocalBackend>::digest_from_path(&path), Some(digest));
        assert_eq!(ContentPool::<LocalBackend>::digest_from_path("refcnt.ledger"), None);
    }

    #[tokio::test]
    async fn test_put_then_get_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        let data = Bytes::from(vec![7u8; 10_000]);
        let digest = Digest::from_data(&data);

        let first = pool.put(&digest, data.clone()).await.unwrap();
        assert!(first.written);
        assert!(first.stored_size < 10_000);
        assert!(pool.exists(&digest).await.unwrap());
        assert_eq!(pool.get(&digest).await.unwrap(), data);
        assert_eq!(pool.list().await.unwrap(), vec![digest]);
    }

    #[tokio::test]
    async fn test_redundant_put_keeps_bytes_and_touches() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        let data = Bytes::from_static(b"same content");
        let digest = Digest::from_data(&data);
        pool.put(&digest, data.clone()).await.unwrap();

        let path = dir.path().join(ContentPool::<LocalBackend>::object_path(&digest));
        let stored = std::fs::read(&path).unwrap();
        let old = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(86_400);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let again = pool.put(&digest, data).await.unwrap();
        assert!(!again.written);
        assert_eq!(again.stored_size, stored.len() as u64);
        assert_eq!(std::fs::read(&path).unwrap(), stored);
        let touched = pool.last_touched(&digest).await.unwrap().unwrap();
        assert!(touched > DateTime::<Utc>::from(old));
    }

    /// Deletes the object when touched, as a concurrent sweep would
    /// between `stat` and `touch`.
    struct SweptOnTouch(LocalBackend);

    #[async_trait]
    impl Backend for SweptOnTouch {
        async fn init(&self) -> Result<()> {
            self.0.init().await
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            self.0.exists(path).await
        }
        async fn read(&self, path: &str) -> Result<Bytes> {
            self.0.read(path).await
        }
        async fn write(&self, path: &str, data: Bytes) -> Result<()> {
            self.0.write(path, data).await
        }
        async fn delete(&self, path: &str) -> Result<()> {
            self.0.delete(path).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.0.list(prefix).await
        }
        async fn stat(&self, path: &str) -> Result<Option<crate::backend::ObjectInfo>> {
            self.0.stat(path).await
        }
        async fn touch(&self, path: &str) -> Result<bool> {
            self.0.delete(path).await?;
            self.0.touch(path).await
        }
    }

    #[tokio::test]
    async fn test_put_rewrites_chunk_deleted_before_touch() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ContentPool::new(SweptOnTouch(LocalBackend::new(dir.path())));
        let data = Bytes::from_static(b"racing a sweep");
        let digest = Digest::from_data(&data);
        assert!(pool.put(&digest, data.clone()).await.unwrap().written);

        let again = pool.put(&digest, data.clone()).await.unwrap();
        assert!(again.written);
        assert!(pool.exists(&digest).await.unwrap());
        assert_eq!(pool.get(&digest).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_missing_and_corrupted_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        let digest = Digest::from_data(b"absent");
        assert!(matches!(
            pool.get(&digest).await,
            Err(Error::ChunkNotFound { .. })
        ));
        assert!(pool.last_touched(&digest).await.unwrap().is_none());

        // Valid zlib of the wrong content under this digest's path.
        let wrong = compress(b"other bytes", Compression::default()).unwrap();
        pool.backend()
            .write(&ContentPool::<LocalBackend>::object_path(&digest), Bytes::from(wrong))
            .await
            .unwrap();
        assert!(matches!(
            pool.get(&digest).await,
            Err(Error::CorruptedChunk { .. })
        ));

        pool.delete(&digest).await.unwrap();
        assert!(!pool.exists(&digest).await.unwrap());
    }
}
