//! Backup, host and pool reference counts over a [`Store`].
//!
//! Every ledger read-modify-replace happens under the lock of its scope.
//! When an operation needs both, `host:<name>` is taken before `pool`.
//! Crashes between steps may over-count (leaking chunks until `verify`
//! repairs the ledgers) but never under-count.

use crate::codec::RecordReader;
use crate::fsutil::{modified_time, set_modified_time};
use crate::ledger::{
    Divergence, Ledger, RefCount, add_backup_refcnt_to, release_backup_refcnt_from,
    remove_backup_refcnt_to,
};
use crate::lock::{LockService, POOL_RESOURCE, host_resource, with_lock};
use crate::pool::ChunkPool;
use crate::progress::{Progress, ProgressSink, TaskNode, TaskState, report_task};
use crate::store::{BackupInfo, BackupState, Store};
use crate::types::{Digest, JournalEntry, Operation};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Removal {
    /// False when the backup was never counted or a previous removal was
    /// interrupted after it may already have decremented.
    pub decremented: bool,
    pub host_zeroed: usize,
    pub pool_zeroed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SweepOptions {
    /// Chunks touched less than `grace` before the mark are kept.
    pub grace: Duration,
    pub batch_size: usize,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(24 * 60 * 60),
            batch_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub candidates: usize,
    pub deleted: usize,
    pub already_gone: usize,
    pub skipped_live: usize,
    pub skipped_recent: usize,
    pub freed_bytes: u64,
    pub batches: usize,
}

impl SweepReport {
    fn absorb(&mut self, batch: SweepReport) {
        self.deleted += batch.deleted;
        self.already_gone += batch.already_gone;
        self.skipped_live += batch.skipped_live;
        self.skipped_recent += batch.skipped_recent;
        self.freed_bytes += batch.freed_bytes;
        self.batches += 1;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    pub fix: bool,
    /// Also confirm every referenced chunk exists and list orphans.
    pub check_pool: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LedgerScope {
    Backup { host: String, number: u32 },
    Host(String),
    Pool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeDivergence {
    pub scope: LedgerScope,
    pub divergences: Vec<Divergence>,
    /// The persisted ledger could not be decoded at all.
    pub corrupt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityFault {
    pub host: String,
    pub number: u32,
    pub path: String,
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodeFailure {
    pub host: String,
    pub number: u32,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub hosts_checked: usize,
    pub backups_checked: usize,
    pub scopes: Vec<ScopeDivergence>,
    pub faults: Vec<IntegrityFault>,
    pub decode_failures: Vec<DecodeFailure>,
    pub orphans: Vec<Digest>,
    pub fixed: bool,
}

impl VerifyReport {
    pub fn divergence_count(&self) -> usize {
        self.scopes
            .iter()
            .map(|s| s.divergences.len().max(usize::from(s.corrupt)))
            .sum()
    }

    pub fn is_clean(&self) -> bool {
        self.scopes.is_empty()
            && self.faults.is_empty()
            && self.decode_failures.is_empty()
            && self.orphans.is_empty()
    }

    /// Integrity faults always fail; divergence fails unless it was repaired.
    pub fn into_result(self) -> Result<Self> {
        if let Some(fault) = self.faults.first() {
            return Err(Error::PoolIntegrity {
                digest: fault.digest,
                path: format!("{}/{}:{}", fault.host, fault.number, fault.path),
            });
        }
        if let Some(failure) = self.decode_failures.first() {
            return Err(Error::Decode {
                offset: 0,
                reason: format!("{}/{}: {}", failure.host, failure.number, failure.error),
            });
        }
        if !self.fixed && !self.scopes.is_empty() {
            return Err(Error::LedgerDivergence {
                count: self.divergence_count(),
            });
        }
        Ok(self)
    }
}

pub struct RefCounter {
    store: Store,
    locks: Arc<dyn LockService>,
    lock_timeout: Duration,
}

impl RefCounter {
    pub fn new(store: Store, locks: Arc<dyn LockService>, lock_timeout: Duration) -> Self {
        Self {
            store,
            locks,
            lock_timeout,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn locked<F, Fut, T>(&self, resources: &[String], f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_lock(self.locks.as_ref(), resources, self.lock_timeout, f).await
    }

    async fn host_ledgers(&self) -> Result<Vec<(String, Ledger)>> {
        let mut ledgers = Vec::new();
        for host in self.store.list_hosts().await? {
            let ledger = Ledger::load(&self.store.host_ledger_path(&host)).await?;
            ledgers.push((host, ledger));
        }
        Ok(ledgers)
    }

    /// Counts the compacted manifest of a running backup into its host and
    /// pool ledgers, writes the backup ledger and marks the backup complete.
    pub async fn add_backup(&self, pool: &dyn ChunkPool, info: &mut BackupInfo) -> Result<Ledger> {
        let host = info.host.clone();
        let number = info.number;
        let backup = Ledger::from_manifest(&self.store.manifest_path(&host, number)).await?;

        let host_lock = [host_resource(&host)];
        let pool_lock = [POOL_RESOURCE.to_string()];
        let store = &self.store;
        let backup_ref = &backup;
        let host_ref = host.as_str();

        self.locked(&host_lock, move || async move {
            let current = store.load_backup(host_ref, number).await?;
            match current.state {
                BackupState::Running => {}
                BackupState::Complete => {
                    return Err(Error::BackupExists {
                        host: host_ref.to_string(),
                        number,
                    });
                }
                state => {
                    return Err(Error::Other(format!(
                        "cannot finalize {}/{} in state {:?}",
                        host_ref, number, state
                    )));
                }
            }

            self.locked(&pool_lock, || async {
                let mut pool_ledger = Ledger::load(&store.pool_ledger_path()).await?;
                confirm_unprotected_chunks(pool, &pool_ledger, backup_ref, host_ref, number)
                    .await?;
                add_backup_refcnt_to(&store.host_ledger_path(host_ref), backup_ref).await?;
                pool_ledger.add_ledger(backup_ref);
                pool_ledger.save(&store.pool_ledger_path()).await
            })
            .await?;

            backup_ref.save(&store.backup_ledger_path(host_ref, number)).await?;
            info.state = BackupState::Complete;
            info.completed_at = Some(Utc::now());
            store.save_backup(info).await
        })
        .await?;

        info!(
            host = %host,
            number,
            chunks = backup.len(),
            "Backup counted into host and pool ledgers"
        );
        Ok(backup)
    }

    /// Decrements a live backup's counts from its host and pool ledgers and
    /// deletes the backup. Chunks reaching zero leave the host ledger and
    /// stay in the pool ledger as collection candidates.
    pub async fn remove_backup(&self, host: &str, number: u32) -> Result<Removal> {
        let host_lock = [host_resource(host)];
        let pool_lock = [POOL_RESOURCE.to_string()];
        let store = &self.store;

        let removal = self
            .locked(&host_lock, || async {
                let mut info = store.load_backup(host, number).await?;
                let mut removal = Removal::default();
                match info.state {
                    BackupState::Complete => {
                        let backup = self.backup_ledger_for_removal(&info).await?;
                        let backup_ref = &backup;
                        let info_ref = &mut info;
                        // Nothing is written until both locks are held.
                        let (host_zeroed, pool_zeroed) = self
                            .locked(&pool_lock, move || async move {
                                info_ref.state = BackupState::Removing;
                                store.save_backup(info_ref).await?;
                                let host_path = store.host_ledger_path(host);
                                let host_zeroed =
                                    release_backup_refcnt_from(&host_path, backup_ref).await?;
                                let pool_zeroed =
                                    remove_backup_refcnt_to(&store.pool_ledger_path(), backup_ref)
                                        .await?;
                                Ok((host_zeroed.len(), pool_zeroed.len()))
                            })
                            .await?;
                        removal.host_zeroed = host_zeroed;
                        removal.pool_zeroed = pool_zeroed;
                        removal.decremented = true;
                    }
                    BackupState::Removing => {
                        warn!(
                            host,
                            number,
                            "Finishing an interrupted removal without decrementing; run fsck --fix to reconcile ledgers"
                        );
                    }
                    BackupState::Running | BackupState::Failed => {
                        debug!(host, number, state = ?info.state, "Backup was never counted");
                    }
                }
                store.delete_backup_dir(host, number).await?;
                Ok(removal)
            })
            .await?;

        info!(
            host,
            number,
            host_zeroed = removal.host_zeroed,
            pool_zeroed = removal.pool_zeroed,
            "Removed backup"
        );
        Ok(removal)
    }

    async fn backup_ledger_for_removal(&self, info: &BackupInfo) -> Result<Ledger> {
        let path = self.store.backup_ledger_path(&info.host, info.number);
        if tokio::fs::try_exists(&path).await? {
            return Ledger::load(&path).await;
        }
        warn!(
            host = %info.host,
            number = info.number,
            "Backup ledger missing, recounting from manifest"
        );
        Ledger::from_manifest(&self.store.manifest_path(&info.host, info.number)).await
    }

    /// Marks collection candidates: pool entries with a zero count or that
    /// no host ledger references, and pool objects no ledger knows about
    /// (left by failed or partially read backups). The set is persisted and
    /// its file time is the mark time used by [`RefCounter::sweep_unused`].
    ///
    /// Chunks a running backup has stored but not yet counted are marked
    /// too. The grace period and the existence check at finalize keep them.
    pub async fn compute_unused(&self, pool: &dyn ChunkPool) -> Result<Ledger> {
        let pool_lock = [POOL_RESOURCE.to_string()];
        let (unused, orphans) = self
            .locked(&pool_lock, || async {
                let pool_ledger = Ledger::load(&self.store.pool_ledger_path()).await?;
                // Host ledgers are replaced atomically, so reading them
                // without their locks only risks a stale view, which the
                // sweep re-checks.
                let hosts = self.host_ledgers().await?;
                let no_host_refs =
                    |digest: &Digest| !hosts.iter().any(|(_, h)| h.is_referenced(digest));

                let mut unused: Ledger = pool_ledger
                    .iter()
                    .filter(|(digest, refcount)| {
                        let unreferenced = no_host_refs(*digest);
                        if refcount.count > 0 && unreferenced {
                            warn!(digest = %digest, count = refcount.count, "Pool counts a chunk no host references");
                        }
                        refcount.count == 0 || unreferenced
                    })
                    .map(|(digest, refcount)| (*digest, *refcount))
                    .collect();

                // Unswept marks outside the pool ledger carry over, e.g. the
                // orphans fsck --fix marked.
                let previous = Ledger::load(&self.store.unused_path()).await?;
                let mut orphans = 0usize;
                let stored = pool.list().await?;
                let untracked = previous
                    .iter()
                    .map(|(digest, refcount)| (*digest, *refcount))
                    .chain(stored.into_iter().map(|digest| (digest, RefCount::default())));
                for (digest, refcount) in untracked {
                    if pool_ledger.get(&digest).is_some()
                        || unused.get(&digest).is_some()
                        || !no_host_refs(&digest)
                    {
                        continue;
                    }
                    unused.insert(digest, refcount);
                    orphans += 1;
                }

                unused.save(&self.store.unused_path()).await?;
                Ok((unused, orphans))
            })
            .await?;

        info!(candidates = unused.len(), orphans, "Computed unused chunks");
        Ok(unused)
    }

    /// Deletes marked candidates in batches, re-validating each one under
    /// the pool lock. Progress is checkpointed after every batch, so an
    /// abandoned sweep resumes where it stopped.
    pub async fn sweep_unused(
        &self,
        pool: &dyn ChunkPool,
        options: SweepOptions,
        progress: &dyn ProgressSink,
    ) -> Result<SweepReport> {
        let unused_path = self.store.unused_path();
        let Some(mark_time) = modified_time(&unused_path).await? else {
            info!("No unused set; nothing to sweep");
            return Ok(SweepReport::default());
        };
        let grace = chrono::Duration::from_std(options.grace)
            .map_err(|e| Error::Config(format!("invalid grace period: {}", e)))?;
        let cutoff = DateTime::<Utc>::from(mark_time) - grace;

        let pool_lock = [POOL_RESOURCE.to_string()];
        let mut candidates: Vec<Digest> = self
            .locked(&pool_lock, || async {
                Ok(Ledger::load(&unused_path).await?.digests().copied().collect())
            })
            .await?;
        candidates.sort();

        let mut report = SweepReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        let mut tree = TaskNode::group("gc", vec![TaskNode::task("sweep")]);
        let total = candidates.len() as u64;
        let mut done = 0u64;

        for batch in candidates.chunks(options.batch_size.max(1)) {
            let outcome = self
                .locked(&pool_lock, || self.sweep_batch(pool, batch, cutoff))
                .await?;
            debug!(batch = report.batches, deleted = outcome.deleted, "Swept batch");
            report.absorb(outcome);

            done += batch.len() as u64;
            let state = if done == total {
                TaskState::Done
            } else {
                TaskState::Running
            };
            tree.update("sweep", state, Progress::new(done, total));
            report_task(progress, &tree, "sweep", Progress::new(done, total));
        }

        info!(
            deleted = report.deleted,
            skipped_live = report.skipped_live,
            skipped_recent = report.skipped_recent,
            freed_bytes = report.freed_bytes,
            "Sweep finished"
        );
        Ok(report)
    }

    async fn sweep_batch(
        &self,
        pool: &dyn ChunkPool,
        batch: &[Digest],
        cutoff: DateTime<Utc>,
    ) -> Result<SweepReport> {
        let pool_path = self.store.pool_ledger_path();
        let unused_path = self.store.unused_path();
        let mut pool_ledger = Ledger::load(&pool_path).await?;
        let mut unused = Ledger::load(&unused_path).await?;
        let hosts = self.host_ledgers().await?;
        let mut outcome = SweepReport::default();

        for digest in batch {
            let Some(marked) = unused.get(digest).copied() else {
                continue;
            };
            let live = pool_ledger.is_referenced(digest)
                || hosts.iter().any(|(_, h)| h.is_referenced(digest));
            if live {
                outcome.skipped_live += 1;
                unused.remove(digest);
                continue;
            }
            match pool.last_touched(digest).await? {
                None => outcome.already_gone += 1,
                Some(touched) if touched > cutoff => {
                    outcome.skipped_recent += 1;
                    continue;
                }
                Some(_) => {
                    pool.delete(digest).await?;
                    let stored = pool_ledger
                        .get(digest)
                        .map(|r| r.stored_size)
                        .unwrap_or(marked.stored_size);
                    outcome.deleted += 1;
                    outcome.freed_bytes += stored;
                    debug!(digest = %digest, stored, "Deleted chunk");
                }
            }
            pool_ledger.remove(digest);
            unused.remove(digest);
        }

        pool_ledger.save(&pool_path).await?;
        save_keeping_mark(&unused, &unused_path).await?;
        Ok(outcome)
    }

    /// Recomputes every ledger from the live manifests and compares it with
    /// what is persisted. Hosts are checked one at a time under their own
    /// lock; the pool ledger is compared last under the pool lock.
    pub async fn verify(
        &self,
        pool: Option<&dyn ChunkPool>,
        options: VerifyOptions,
        progress: &dyn ProgressSink,
    ) -> Result<VerifyReport> {
        let pool = if options.check_pool { pool } else { None };
        let hosts = self.store.list_hosts().await?;
        let mut report = VerifyReport {
            fixed: options.fix,
            ..Default::default()
        };

        let mut children: Vec<TaskNode> = hosts.iter().map(|h| TaskNode::task(h.as_str())).collect();
        children.push(TaskNode::task(POOL_RESOURCE));
        let mut tree = TaskNode::group("fsck", children);

        for host in &hosts {
            let host_lock = [host_resource(host)];
            let report_ref = &mut report;
            self.locked(&host_lock, move || async move {
                self.verify_host(host, pool, options.fix, report_ref).await
            })
            .await?;
            report.hosts_checked += 1;
            tree.update(host, TaskState::Done, Progress::new(1, 1));
            report_task(progress, &tree, host, Progress::new(1, 1));
        }

        let pool_lock = [POOL_RESOURCE.to_string()];
        let report_ref = &mut report;
        self.locked(&pool_lock, move || async move {
            self.verify_pool(pool, options.fix, report_ref).await
        })
        .await?;
        tree.update(POOL_RESOURCE, TaskState::Done, Progress::new(1, 1));
        report_task(progress, &tree, POOL_RESOURCE, Progress::new(1, 1));

        info!(
            hosts = report.hosts_checked,
            backups = report.backups_checked,
            divergences = report.divergence_count(),
            faults = report.faults.len(),
            orphans = report.orphans.len(),
            fixed = report.fixed,
            "Verify finished"
        );
        Ok(report)
    }

    async fn verify_host(
        &self,
        host: &str,
        pool: Option<&dyn ChunkPool>,
        fix: bool,
        report: &mut VerifyReport,
    ) -> Result<()> {
        let mut expected_host = Ledger::new();
        let mut decoded_all = true;

        for info in self.store.live_backups(host).await? {
            report.backups_checked += 1;
            let (expected, fault) = match self.recount_backup(&info, pool).await {
                Ok(counted) => counted,
                Err(e @ (Error::Decode { .. } | Error::Truncated { .. })) => {
                    error!(host, number = info.number, error = %e, "Manifest cannot be decoded");
                    report.decode_failures.push(DecodeFailure {
                        host: host.to_string(),
                        number: info.number,
                        error: e.to_string(),
                    });
                    decoded_all = false;
                    continue;
                }
                Err(e) => return Err(e),
            };
            report.faults.extend(fault);

            let path = self.store.backup_ledger_path(host, info.number);
            let scope = LedgerScope::Backup {
                host: host.to_string(),
                number: info.number,
            };
            compare_and_fix(&path, &expected, scope, fix, report).await?;
            expected_host.add_ledger(&expected);
        }

        let path = self.store.host_ledger_path(host);
        if decoded_all {
            compare_and_fix(&path, &expected_host, LedgerScope::Host(host.to_string()), fix, report)
                .await?;
        } else {
            warn!(host, "Skipping host ledger check, some manifests failed to decode");
        }
        Ok(())
    }

    /// Streams one backup's manifest into a ledger. With a pool, also
    /// confirms each distinct chunk exists; the first missing one is an
    /// integrity fault and ends the existence checks for this backup.
    async fn recount_backup(
        &self,
        info: &BackupInfo,
        pool: Option<&dyn ChunkPool>,
    ) -> Result<(Ledger, Option<IntegrityFault>)> {
        let path = self.store.manifest_path(&info.host, info.number);
        let mut reader = RecordReader::<_, JournalEntry>::open(&path).await?;
        let mut ledger = Ledger::new();
        let mut fault = None;
        let mut checked = HashSet::new();

        while let Some((offset, entry)) = reader.next().await? {
            if entry.operation == Operation::Remove {
                return Err(Error::Decode {
                    offset,
                    reason: "remove record in a compacted manifest".to_string(),
                });
            }
            for chunk in &entry.manifest.chunks {
                ledger.add_chunk(chunk);
                let Some(pool) = pool else { continue };
                if fault.is_some() || !checked.insert(chunk.digest) {
                    continue;
                }
                if !pool.exists(&chunk.digest).await? {
                    let file = entry.manifest.display_path();
                    error!(
                        host = %info.host,
                        number = info.number,
                        path = %file,
                        digest = %chunk.digest,
                        "Live backup references a chunk missing from the pool"
                    );
                    fault = Some(IntegrityFault {
                        host: info.host.clone(),
                        number: info.number,
                        path: file,
                        digest: chunk.digest,
                    });
                }
            }
        }
        Ok((ledger, fault))
    }

    async fn verify_pool(
        &self,
        pool: Option<&dyn ChunkPool>,
        fix: bool,
        report: &mut VerifyReport,
    ) -> Result<()> {
        let mut expected = Ledger::new();
        for (_, ledger) in self.host_ledgers().await? {
            expected.add_ledger(&ledger);
        }

        let path = self.store.pool_ledger_path();
        let (persisted, corrupt) = load_for_repair(&path).await?;
        let divergences = persisted.diverges_from(&expected);
        let mut current = persisted;

        if !divergences.is_empty() || corrupt {
            if fix {
                // Entries the pool counted but no host does stay at zero so
                // the next mark picks them up.
                let mut repaired = expected.clone();
                for (digest, refcount) in current.iter() {
                    if repaired.get(digest).is_none() {
                        repaired.insert(
                            *digest,
                            RefCount {
                                count: 0,
                                ..*refcount
                            },
                        );
                    }
                }
                repaired.save(&path).await?;
                warn!(divergences = divergences.len(), "Rewrote pool ledger");
                current = repaired;
            }
            report.scopes.push(ScopeDivergence {
                scope: LedgerScope::Pool,
                divergences,
                corrupt,
            });
        }

        let Some(pool) = pool else {
            return Ok(());
        };
        let unused_path = self.store.unused_path();
        let mut unused = Ledger::load(&unused_path).await?;
        let mut orphans: Vec<Digest> = pool
            .list()
            .await?
            .into_iter()
            .filter(|d| current.get(d).is_none() && unused.get(d).is_none())
            .collect();
        orphans.sort();

        if !orphans.is_empty() {
            warn!(orphans = orphans.len(), "Pool holds chunks no ledger knows about");
            if fix {
                for digest in &orphans {
                    unused.insert(*digest, RefCount::default());
                }
                unused.save(&unused_path).await?;
            }
        }
        report.orphans = orphans;
        Ok(())
    }
}

/// Chunks without a pool reference could be deleted by a sweep at any time
/// before the pool lock was taken, so they must be confirmed present.
async fn confirm_unprotected_chunks(
    pool: &dyn ChunkPool,
    pool_ledger: &Ledger,
    backup: &Ledger,
    host: &str,
    number: u32,
) -> Result<()> {
    for digest in backup.digests() {
        if !pool_ledger.is_referenced(digest) && !pool.exists(digest).await? {
            error!(host, number, digest = %digest, "Chunk of a finalizing backup is missing from the pool");
            return Err(Error::PoolIntegrity {
                digest: *digest,
                path: format!("{}/{}", host, number),
            });
        }
    }
    Ok(())
}

async fn load_for_repair(path: &Path) -> Result<(Ledger, bool)> {
    match Ledger::load(path).await {
        Ok(ledger) => Ok((ledger, false)),
        Err(e @ (Error::Decode { .. } | Error::Truncated { .. })) => {
            error!(path = %path.display(), error = %e, "Ledger cannot be decoded");
            Ok((Ledger::new(), true))
        }
        Err(e) => Err(e),
    }
}

async fn compare_and_fix(
    path: &Path,
    expected: &Ledger,
    scope: LedgerScope,
    fix: bool,
    report: &mut VerifyReport,
) -> Result<()> {
    let (persisted, corrupt) = load_for_repair(path).await?;
    let divergences = persisted.diverges_from(expected);
    if divergences.is_empty() && !corrupt {
        // Zero entries match their absence; a fix still drops them.
        if fix && persisted.len() != expected.len() {
            debug!(scope = ?scope, "Pruning zero-count entries");
            expected.save(path).await?;
        }
        return Ok(());
    }
    warn!(scope = ?scope, divergences = divergences.len(), corrupt, "Ledger diverges");
    if fix {
        expected.save(path).await?;
    }
    report.scopes.push(ScopeDivergence {
        scope,
        divergences,
        corrupt,
    });
    Ok(())
}

/// Saves the unused set without moving its mark time.
async fn save_keeping_mark(unused: &Ledger, path: &Path) -> Result<()> {
    let mark: Option<SystemTime> = modified_time(path).await?;
    unused.save(path).await?;
    if let Some(mark) = mark {
        set_modified_time(path, mark).await?;
    }
    Ok(())
}
