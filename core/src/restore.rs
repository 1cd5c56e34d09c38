use crate::codec::RecordReader;
use crate::pool::ChunkPool;
use crate::store::Store;
use crate::types::{FileManifest, JournalEntry};
use crate::{Digest, Error, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

/// Streams a backup's compacted manifest until `path` is found.
pub async fn find_file(store: &Store, host: &str, number: u32, path: &[u8]) -> Result<FileManifest> {
    let info = store.load_backup(host, number).await?;
    if !info.is_live() {
        return Err(Error::Other(format!(
            "backup {}/{} is {:?}, not restorable",
            host, number, info.state
        )));
    }

    let mut reader = RecordReader::<_, JournalEntry>::open(&store.manifest_path(host, number)).await?;
    while let Some((_, entry)) = reader.next().await? {
        if entry.manifest.path == path {
            return Ok(entry.manifest);
        }
    }
    Err(Error::Other(format!(
        "{} not found in backup {}/{}",
        String::from_utf8_lossy(path),
        host,
        number
    )))
}

/// Writes the content of one file of a live backup to `writer`, chunk by
/// chunk. A referenced chunk missing from the pool is an integrity fault.
pub async fn restore_file<W: AsyncWrite + Unpin>(
    store: &Store,
    pool: &dyn ChunkPool,
    host: &str,
    number: u32,
    path: &[u8],
    writer: &mut W,
) -> Result<u64> {
    let manifest = find_file(store, host, number, path).await?;
    if !manifest.stat.is_file() {
        return Err(Error::Other(format!(
            "{} is not a regular file",
            manifest.display_path()
        )));
    }

    let mut whole = blake3::Hasher::new();
    let mut written = 0u64;
    for chunk in &manifest.chunks {
        let data = match pool.get(&chunk.digest).await {
            Ok(data) => data,
            Err(Error::ChunkNotFound { digest }) => {
                error!(
                    host,
                    number,
                    path = %manifest.display_path(),
                    digest = %digest,
                    "Live backup references a chunk missing from the pool"
                );
                return Err(Error::PoolIntegrity {
                    digest,
                    path: manifest.display_path(),
                });
            }
            Err(e) => return Err(e),
        };
        whole.update(&data);
        writer.write_all(&data).await?;
        written += data.len() as u64;
    }
    writer.flush().await?;

    if let Some(expected) = manifest.digest {
        let actual = Digest::from(whole.finalize());
        if actual != expected {
            return Err(Error::Other(format!(
                "restored {} does not match its recorded digest",
                manifest.display_path()
            )));
        }
    }
    debug!(path = %manifest.display_path(), bytes = written, "Restored file");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LocalLockService;
    use crate::pipeline::{BackupOptions, BackupRun, LocalFileSource};
    use crate::refcnt::RefCounter;
    use crate::scanner::{ScanFilter, Scanner};
    use crate::testutil::MemoryPool;
    use std::sync::Arc;
    use std::time::Duration;

    async fn backed_up(content: &[u8]) -> (tempfile::TempDir, RefCounter, MemoryPool, u32) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir_all(source.join("docs")).unwrap();
        std::fs::write(source.join("docs/report.bin"), content).unwrap();

        let counter = RefCounter::new(
            Store::new(dir.path().join("store")),
            Arc::new(LocalLockService::new()),
            Duration::from_secs(5),
        );
        let pool = MemoryPool::new();
        let options = BackupOptions {
            chunk_size: 16,
            parallelism: 2,
        };
        let info = BackupRun::new(&counter, &pool, &LocalFileSource, options)
            .run("alpha", Scanner::new(&source, ScanFilter::default()))
            .await
            .unwrap();
        (dir, counter, pool, info.number)
    }

    #[tokio::test]
    async fn test_restore_reproduces_content() {
        let content: Vec<u8> = (0..100u8).collect();
        let (_dir, counter, pool, number) = backed_up(&content).await;

        let mut out = Vec::new();
        let written = restore_file(counter.store(), &pool, "alpha", number, b"/docs/report.bin", &mut out)
            .await
            .unwrap();
        assert_eq!(written, 100);
        assert_eq!(out, content);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_integrity_fault_not_not_found() {
        let content: Vec<u8> = (0..40u8).collect();
        let (_dir, counter, pool, number) = backed_up(&content).await;
        pool.remove_behind_the_back(&Digest::from_data(&content[16..32]));

        let mut out = Vec::new();
        let err = restore_file(counter.store(), &pool, "alpha", number, b"/docs/report.bin", &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolIntegrity { .. }));
    }

    #[tokio::test]
    async fn test_unknown_path_and_directory() {
        let (_dir, counter, pool, number) = backed_up(b"x").await;
        let mut out = Vec::new();
        assert!(
            restore_file(counter.store(), &pool, "alpha", number, b"/nope", &mut out)
                .await
                .is_err()
        );
        assert!(
            restore_file(counter.store(), &pool, "alpha", number, b"/docs", &mut out)
                .await
                .is_err()
        );
        assert!(find_file(counter.store(), "alpha", number, b"/docs").await.unwrap().stat.is_dir());
    }
}
