use crate::chunker::{Chunker, DEFAULT_CHUNK_SIZE};
use crate::codec::RecordWriter;
use crate::manifest::ManifestIndex;
use crate::pool::ChunkPool;
use crate::progress::{NoProgress, Progress, ProgressSink, TaskNode, TaskState, report_task};
use crate::refcnt::RefCounter;
use crate::scanner::{ScanEntry, Scanner, path_bytes};
use crate::store::{BackupInfo, BackupState};
use crate::types::{ChunkRef, FileManifest};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::AsyncRead;
use tracing::{debug, error, info, warn};

/// Stages of one backup run. Ledgers are only touched in
/// `FinalizingRefcounts`, after the journal and manifest are durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Scanning,
    Hashing,
    DiffingAgainstPrevious,
    WritingJournal,
    FinalizingRefcounts,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct BackupOptions {
    pub chunk_size: usize,
    /// Files hashed concurrently.
    pub parallelism: usize,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallelism: 4,
        }
    }
}

pub type FileStream = Box<dyn AsyncRead + Send + Unpin>;

/// Opens the byte stream of a scanned file, locally or from a remote host.
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn open(&self, entry: &ScanEntry) -> io::Result<FileStream>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSource;

#[async_trait]
impl FileSource for LocalFileSource {
    async fn open(&self, entry: &ScanEntry) -> io::Result<FileStream> {
        let file = tokio::fs::File::open(&entry.path).await?;
        Ok(Box::new(file))
    }
}

enum FileOutcome {
    Stored {
        manifest: FileManifest,
        reused: bool,
        new_chunks: u64,
        new_stored_bytes: u64,
    },
    Unreadable {
        path: String,
        previous: Option<FileManifest>,
    },
}

const TASK_SCAN: &str = "scan";
const TASK_HASH: &str = "hash";
const TASK_JOURNAL: &str = "journal";
const TASK_FINALIZE: &str = "finalize";

/// Drives one backup of one host through every stage.
pub struct BackupRun<'a> {
    counter: &'a RefCounter,
    pool: &'a dyn ChunkPool,
    source: &'a dyn FileSource,
    options: BackupOptions,
    progress: &'a dyn ProgressSink,
    tree: TaskNode,
    stage: Stage,
}

impl<'a> BackupRun<'a> {
    pub fn new(
        counter: &'a RefCounter,
        pool: &'a dyn ChunkPool,
        source: &'a dyn FileSource,
        options: BackupOptions,
    ) -> Self {
        Self {
            counter,
            pool,
            source,
            options,
            progress: &NoProgress,
            tree: TaskNode::group(
                "backup",
                vec![
                    TaskNode::task(TASK_SCAN),
                    TaskNode::task(TASK_HASH),
                    TaskNode::task(TASK_JOURNAL),
                    TaskNode::task(TASK_FINALIZE),
                ],
            ),
            stage: Stage::Scanning,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn tree(&self) -> &TaskNode {
        &self.tree
    }

    fn enter(&mut self, stage: Stage) {
        debug!(from = ?self.stage, to = ?stage, "Stage transition");
        self.stage = stage;
    }

    fn update(&mut self, task: &str, state: TaskState, progress: Progress) {
        self.tree.update(task, state, progress);
        report_task(self.progress, &self.tree, task, progress);
    }

    /// Runs a backup of `scanner`'s tree for `host`. On failure the backup
    /// is saved as `Failed` and the error is returned.
    pub async fn run(&mut self, host: &str, scanner: Scanner) -> Result<BackupInfo> {
        let store = self.counter.store();
        let mut info = store.create_backup(host).await?;
        info!(host, number = info.number, root = %scanner.root().display(), "Starting backup");

        match self.execute(&mut info, scanner).await {
            Ok(()) => {
                self.enter(Stage::Complete);
                info!(
                    host,
                    number = info.number,
                    files = info.stats.files,
                    new_chunks = info.stats.new_chunks,
                    degraded = info.degraded,
                    "Backup complete"
                );
                Ok(info)
            }
            Err(e) => {
                let failed_in = self.stage;
                self.enter(Stage::Failed);
                error!(host, number = info.number, stage = ?failed_in, error = %e, "Backup failed");
                info.state = BackupState::Failed;
                info.completed_at = Some(Utc::now());
                if let Err(save) = store.save_backup(&info).await {
                    warn!(host, number = info.number, error = %save, "Could not record failed backup");
                }
                Err(e)
            }
        }
    }

    async fn execute(&mut self, info: &mut BackupInfo, scanner: Scanner) -> Result<()> {
        let store = self.counter.store();
        let previous = match store.latest_live_backup(&info.host).await? {
            Some(prev) => {
                debug!(host = %info.host, previous = prev.number, "Diffing against previous backup");
                ManifestIndex::load(&store.manifest_path(&prev.host, prev.number)).await?
            }
            None => ManifestIndex::new(),
        };

        self.enter(Stage::Scanning);
        self.update(TASK_SCAN, TaskState::Running, Progress::default());
        let entries = tokio::task::spawn_blocking(move || scanner.scan().collect::<Vec<_>>())
            .await
            .map_err(|e| Error::Other(format!("scan task failed: {}", e)))?;
        let total = entries.len() as u64;
        self.update(TASK_SCAN, TaskState::Done, Progress::new(total, total));

        self.enter(Stage::Hashing);
        let chunker = Chunker::new(self.options.chunk_size);
        let (pool, source) = (self.pool, self.source);
        let previous_ref = &previous;
        let mut outcomes = stream::iter(entries)
            .map(|entry| hash_entry(entry, previous_ref, chunker, pool, source))
            .buffer_unordered(self.options.parallelism.max(1));

        let mut current = ManifestIndex::new();
        let mut done = 0;
        while let Some(outcome) = outcomes.next().await {
            match outcome? {
                FileOutcome::Stored {
                    manifest,
                    reused,
                    new_chunks,
                    new_stored_bytes,
                } => {
                    if manifest.stat.is_file() {
                        info.stats.files += 1;
                        info.stats.bytes += manifest.stat.size;
                    }
                    info.stats.reused_files += u64::from(reused);
                    info.stats.new_chunks += new_chunks;
                    info.stats.new_stored_bytes += new_stored_bytes;
                    current.insert(manifest);
                }
                FileOutcome::Unreadable { path, previous } => {
                    info.degraded = true;
                    info.failed_files.push(path);
                    if let Some(manifest) = previous {
                        current.insert(manifest);
                    }
                }
            }
            done += 1;
            self.tree
                .update(TASK_HASH, TaskState::Running, Progress::new(done, total));
            report_task(self.progress, &self.tree, TASK_HASH, Progress::new(done, total));
        }
        drop(outcomes);
        self.update(TASK_HASH, TaskState::Done, Progress::new(done, total));

        self.enter(Stage::DiffingAgainstPrevious);
        let journal = ManifestIndex::diff(&previous, &current);
        info.stats.journal_entries = journal.len() as u64;
        debug!(entries = journal.len(), "Computed journal");

        self.enter(Stage::WritingJournal);
        let entries = journal.len() as u64;
        self.update(TASK_JOURNAL, TaskState::Running, Progress::new(0, entries));
        let journal_path = store.journal_path(&info.host, info.number);
        let mut writer = RecordWriter::create(&journal_path).await?;
        writer.write_all(journal).await?;
        writer.sync().await?;

        // The compacted manifest is rebuilt from the durable journal, not
        // from memory, so it is exactly what a replay would produce.
        let mut compacted = previous;
        compacted.replay(&journal_path).await?;
        compacted
            .write(&store.manifest_path(&info.host, info.number))
            .await?;
        self.update(TASK_JOURNAL, TaskState::Done, Progress::new(entries, entries));

        self.enter(Stage::FinalizingRefcounts);
        self.update(TASK_FINALIZE, TaskState::Running, Progress::new(0, 1));
        self.counter.add_backup(self.pool, info).await?;
        self.update(TASK_FINALIZE, TaskState::Done, Progress::new(1, 1));
        Ok(())
    }
}

async fn hash_entry(
    entry: ScanEntry,
    previous: &ManifestIndex,
    chunker: Chunker,
    pool: &dyn ChunkPool,
    source: &dyn FileSource,
) -> Result<FileOutcome> {
    let mut manifest = FileManifest::new(entry.relative_bytes(), entry.stat.clone());
    manifest.symlink = entry.symlink_target.as_deref().map(path_bytes);
    if !entry.stat.is_file() {
        return Ok(FileOutcome::Stored {
            manifest,
            reused: false,
            new_chunks: 0,
            new_stored_bytes: 0,
        });
    }

    let prior = previous.get(&manifest.path);
    if let Some(prior) = prior.filter(|p| p.stat.is_file() && entry.stat.is_unchanged_from(&p.stat)) {
        debug!(path = %manifest.display_path(), "Unchanged, reusing chunk list");
        manifest.digest = prior.digest;
        manifest.chunks = prior.chunks.clone();
        return Ok(FileOutcome::Stored {
            manifest,
            reused: true,
            new_chunks: 0,
            new_stored_bytes: 0,
        });
    }

    match store_content(&entry, &mut manifest, chunker, pool, source).await {
        Ok((new_chunks, new_stored_bytes)) => Ok(FileOutcome::Stored {
            manifest,
            reused: false,
            new_chunks,
            new_stored_bytes,
        }),
        Err(e @ Error::Read { .. }) => {
            warn!(error = %e, kept_previous = prior.is_some(), "Skipping unreadable file");
            Ok(FileOutcome::Unreadable {
                path: manifest.display_path(),
                previous: prior.cloned(),
            })
        }
        Err(e) => Err(e),
    }
}

/// Chunks and stores one file. Read errors surface as `Error::Read` and
/// leave `manifest` without chunks.
async fn store_content(
    entry: &ScanEntry,
    manifest: &mut FileManifest,
    chunker: Chunker,
    pool: &dyn ChunkPool,
    source: &dyn FileSource,
) -> Result<(u64, u64)> {
    let read_error = |source: io::Error| Error::Read {
        path: entry.path.display().to_string(),
        source,
    };

    let stream = source.open(entry).await.map_err(read_error)?;
    let mut reader = chunker.reader(stream);
    let mut chunks = Vec::new();
    let (mut new_chunks, mut new_stored_bytes) = (0, 0);

    while let Some(chunk) = reader.next_chunk().await.map_err(read_error)? {
        let size = chunk.data.len() as u64;
        let put = pool.put(&chunk.digest, chunk.data).await?;
        if put.written {
            new_chunks += 1;
            new_stored_bytes += put.stored_size;
        }
        chunks.push(ChunkRef {
            digest: chunk.digest,
            size,
            stored_size: put.stored_size,
        });
    }

    manifest.digest = Some(reader.finish());
    manifest.chunks = chunks;
    debug!(
        path = %manifest.display_path(),
        chunks = manifest.chunks.len(),
        new_chunks,
        "Stored file"
    );
    Ok((new_chunks, new_stored_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RecordReader;
    use crate::ledger::Ledger;
    use crate::lock::LocalLockService;
    use crate::progress::ProgressUpdate;
    use crate::refcnt::VerifyOptions;
    use crate::scanner::ScanFilter;
    use crate::store::Store;
    use crate::testutil::MemoryPool;
    use crate::types::{Digest, JournalEntry, Operation};
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Fixture {
        _store_dir: tempfile::TempDir,
        source_dir: tempfile::TempDir,
        counter: RefCounter,
        pool: MemoryPool,
    }

    fn fixture() -> Fixture {
        let store_dir = tempfile::tempdir().unwrap();
        let counter = RefCounter::new(
            Store::new(store_dir.path()),
            Arc::new(LocalLockService::new()),
            Duration::from_secs(5),
        );
        Fixture {
            _store_dir: store_dir,
            source_dir: tempfile::tempdir().unwrap(),
            counter,
            pool: MemoryPool::new(),
        }
    }

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn options() -> BackupOptions {
        BackupOptions {
            chunk_size: 8,
            parallelism: 3,
        }
    }

    async fn run(fx: &Fixture, source: &dyn FileSource) -> Result<BackupInfo> {
        let scanner = Scanner::new(fx.source_dir.path(), ScanFilter::default());
        BackupRun::new(&fx.counter, &fx.pool, source, options())
            .run("alpha", scanner)
            .await
    }

    async fn journal_ops(fx: &Fixture, number: u32) -> Vec<(Operation, String)> {
        let path = fx.counter.store().journal_path("alpha", number);
        RecordReader::<_, JournalEntry>::open(&path)
            .await
            .unwrap()
            .read_all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.operation, e.manifest.display_path()))
            .collect()
    }

    #[tokio::test]
    async fn test_first_backup_stores_and_counts_everything() {
        let fx = fixture();
        write(fx.source_dir.path(), "a.txt", b"0123456789abcdef-tail");
        write(fx.source_dir.path(), "dir/b.txt", b"0123456789abcdef");
        write(fx.source_dir.path(), "empty", b"");

        let info = run(&fx, &LocalFileSource).await.unwrap();
        assert!(info.is_live());
        assert!(!info.degraded);
        assert_eq!(info.stats.files, 3);

        let store = fx.counter.store();
        let manifest = ManifestIndex::load(&store.manifest_path("alpha", info.number))
            .await
            .unwrap();
        let a = manifest.get(b"/a.txt").unwrap();
        let sizes: Vec<u64> = a.chunks.iter().map(|c| c.size).collect();
        assert_eq!(sizes, vec![8, 8, 5]);
        assert_eq!(a.digest, Some(Digest::from_data(b"0123456789abcdef-tail")));
        assert!(manifest.get(b"/empty").unwrap().chunks.is_empty());
        assert!(manifest.get(b"/dir").unwrap().stat.is_dir());

        // The first two chunks of both files are shared.
        let pool_ledger = Ledger::load(&store.pool_ledger_path()).await.unwrap();
        assert_eq!(pool_ledger.count(&Digest::from_data(b"01234567")), 2);
        assert_eq!(fx.pool.len(), 3);
        assert_eq!(info.stats.new_chunks, 3);
    }

    #[tokio::test]
    async fn test_second_backup_journals_only_changes() {
        let fx = fixture();
        let root = fx.source_dir.path();
        write(root, "keep", b"unchanged content");
        write(root, "edit", b"version one");
        write(root, "drop", b"to be deleted");
        let first = run(&fx, &LocalFileSource).await.unwrap();

        write(root, "edit", b"version two, longer");
        std::fs::remove_file(root.join("drop")).unwrap();
        write(root, "new", b"fresh");
        let second = run(&fx, &LocalFileSource).await.unwrap();

        assert_eq!(second.number, first.number + 1);
        assert_eq!(second.stats.reused_files, 1);
        let ops = journal_ops(&fx, second.number).await;
        assert!(ops.contains(&(Operation::Modify, "/edit".to_string())));
        assert!(ops.contains(&(Operation::Add, "/new".to_string())));
        assert!(ops.contains(&(Operation::Remove, "/drop".to_string())));
        assert!(!ops.iter().any(|(_, p)| p == "/keep"));

        let store = fx.counter.store();
        let manifest = ManifestIndex::load(&store.manifest_path("alpha", second.number))
            .await
            .unwrap();
        assert!(manifest.get(b"/drop").is_none());
        assert!(manifest.get(b"/keep").is_some());

        let report = fx
            .counter
            .verify(Some(&fx.pool), VerifyOptions { fix: false, check_pool: true }, &NoProgress)
            .await
            .unwrap();
        assert!(report.scopes.is_empty() && report.faults.is_empty(), "{:?}", report);
    }

    struct FlakySource {
        broken: &'static str,
    }

    #[async_trait]
    impl FileSource for FlakySource {
        async fn open(&self, entry: &ScanEntry) -> io::Result<FileStream> {
            if entry.relative == Path::new(self.broken) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            LocalFileSource.open(entry).await
        }
    }

    #[tokio::test]
    async fn test_read_failure_degrades_without_failing() {
        let fx = fixture();
        write(fx.source_dir.path(), "good", b"readable bytes");
        write(fx.source_dir.path(), "bad", b"never read");

        let info = run(&fx, &FlakySource { broken: "/bad" }).await.unwrap();
        assert!(info.is_live());
        assert!(info.degraded);
        assert_eq!(info.failed_files, vec!["/bad".to_string()]);

        let manifest = ManifestIndex::load(&fx.counter.store().manifest_path("alpha", info.number))
            .await
            .unwrap();
        assert!(manifest.get(b"/good").is_some());
        assert!(manifest.get(b"/bad").is_none());
    }

    #[tokio::test]
    async fn test_unreadable_file_keeps_previous_entry() {
        let fx = fixture();
        write(fx.source_dir.path(), "flaky", b"first version");
        run(&fx, &LocalFileSource).await.unwrap();

        write(fx.source_dir.path(), "flaky", b"second version!");
        let info = run(&fx, &FlakySource { broken: "/flaky" }).await.unwrap();
        let manifest = ManifestIndex::load(&fx.counter.store().manifest_path("alpha", info.number))
            .await
            .unwrap();
        assert_eq!(
            manifest.get(b"/flaky").unwrap().digest,
            Some(Digest::from_data(b"first version"))
        );
    }

    struct FullPool;

    #[async_trait]
    impl ChunkPool for FullPool {
        async fn put(&self, _digest: &Digest, _data: bytes::Bytes) -> Result<crate::pool::PutOutcome> {
            Err(Error::Backend("no space left".into()))
        }
        async fn exists(&self, _digest: &Digest) -> Result<bool> {
            Ok(false)
        }
        async fn get(&self, digest: &Digest) -> Result<bytes::Bytes> {
            Err(Error::ChunkNotFound { digest: *digest })
        }
        async fn delete(&self, _digest: &Digest) -> Result<()> {
            Ok(())
        }
        async fn last_touched(&self, _digest: &Digest) -> Result<Option<chrono::DateTime<Utc>>> {
            Ok(None)
        }
        async fn list(&self) -> Result<Vec<Digest>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_failure_before_finalize_leaves_ledgers_untouched() {
        let fx = fixture();
        write(fx.source_dir.path(), "file", b"some content");

        let mut backup = BackupRun::new(&fx.counter, &FullPool, &LocalFileSource, options());
        let scanner = Scanner::new(fx.source_dir.path(), ScanFilter::default());
        let err = backup.run("alpha", scanner).await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert_eq!(backup.stage(), Stage::Failed);

        let store = fx.counter.store();
        let backups = store.list_backups("alpha").await.unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].state, BackupState::Failed);
        assert!(store.latest_live_backup("alpha").await.unwrap().is_none());
        assert!(Ledger::load(&store.pool_ledger_path()).await.unwrap().is_empty());
        assert!(Ledger::load(&store.host_ledger_path("alpha")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_progress_is_reported_per_stage() {
        let fx = fixture();
        write(fx.source_dir.path(), "one", b"1");
        write(fx.source_dir.path(), "two", b"2");
        let tasks = Mutex::new(Vec::new());
        let sink = |update: ProgressUpdate<'_>| tasks.lock().unwrap().push(update.task.to_string());

        let scanner = Scanner::new(fx.source_dir.path(), ScanFilter::default());
        let mut backup =
            BackupRun::new(&fx.counter, &fx.pool, &LocalFileSource, options()).with_progress(&sink);
        backup.run("alpha", scanner).await.unwrap();

        assert_eq!(backup.stage(), Stage::Complete);
        assert_eq!(backup.tree().percent(), 100.0);
        let tasks = tasks.into_inner().unwrap();
        assert_eq!(tasks.first().map(String::as_str), Some(TASK_SCAN));
        assert_eq!(tasks.last().map(String::as_str), Some(TASK_FINALIZE));
        assert!(tasks.iter().filter(|t| *t == TASK_HASH).count() >= 2);
    }
}
