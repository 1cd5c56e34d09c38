use crate::codec::{RecordReader, write_records_atomic};
use crate::fsutil::is_not_found;
use crate::types::{ChunkRef, Digest, JournalEntry, Operation};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCount {
    pub count: u64,
    pub size: u64,
    pub stored_size: u64,
}

/// On-disk form of one ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCountRecord {
    pub digest: Digest,
    pub count: u64,
    pub size: u64,
    pub stored_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Divergence {
    pub digest: Digest,
    pub expected: u64,
    pub actual: u64,
}

/// Digest -> reference count for one scope (backup, host, pool, or the
/// unused candidate set). Host ledgers drop entries that reach zero; the
/// pool ledger keeps them until a sweep does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    entries: HashMap<Digest, RefCount>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, digest: &Digest) -> Option<&RefCount> {
        self.entries.get(digest)
    }

    pub fn count(&self, digest: &Digest) -> u64 {
        self.entries.get(digest).map(|r| r.count).unwrap_or(0)
    }

    pub fn is_referenced(&self, digest: &Digest) -> bool {
        self.count(digest) > 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Digest, &RefCount)> {
        self.entries.iter()
    }

    pub fn digests(&self) -> impl Iterator<Item = &Digest> {
        self.entries.keys()
    }

    pub fn add_chunk(&mut self, chunk: &ChunkRef) {
        let entry = self.entries.entry(chunk.digest).or_default();
        entry.count += 1;
        entry.size = chunk.size;
        entry.stored_size = chunk.stored_size;
    }

    pub fn insert(&mut self, digest: Digest, refcount: RefCount) {
        self.entries.insert(digest, refcount);
    }

    pub fn remove(&mut self, digest: &Digest) -> Option<RefCount> {
        self.entries.remove(digest)
    }

    /// Adds every count of `other` into this ledger.
    pub fn add_ledger(&mut self, other: &Ledger) {
        for (digest, refcount) in &other.entries {
            let entry = self.entries.entry(*digest).or_default();
            entry.count += refcount.count;
            entry.size = refcount.size;
            entry.stored_size = refcount.stored_size;
        }
    }

    /// Subtracts `other` and returns the digests whose count reached zero.
    /// Underflows clamp at zero and are logged; they mean the ledger had
    /// already drifted.
    pub fn subtract_ledger(&mut self, other: &Ledger) -> Vec<Digest> {
        let mut zeroed = Vec::new();
        for (digest, refcount) in &other.entries {
            match self.entries.get_mut(digest) {
                Some(entry) => {
                    if entry.count < refcount.count {
                        warn!(
                            digest = %digest,
                            have = entry.count,
                            remove = refcount.count,
                            "Refcount underflow, clamping to zero"
                        );
                    }
                    let was_live = entry.count > 0;
                    entry.count = entry.count.saturating_sub(refcount.count);
                    if was_live && entry.count == 0 {
                        zeroed.push(*digest);
                    }
                }
                None => {
                    warn!(digest = %digest, "Removing refcount for an unknown digest");
                }
            }
        }
        zeroed
    }

    pub fn retain_live(&mut self) {
        self.entries.retain(|_, r| r.count > 0);
    }

    pub fn total_stored_size(&self) -> u64 {
        self.entries.values().map(|r| r.stored_size).sum()
    }

    /// Compares this ledger (the persisted one) with `expected`. Zero counts
    /// and missing entries are treated as equal.
    pub fn diverges_from(&self, expected: &Ledger) -> Vec<Divergence> {
        let mut divergences: Vec<Divergence> = expected
            .entries
            .keys()
            .chain(self.entries.keys())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .filter_map(|digest| {
                let (want, have) = (expected.count(digest), self.count(digest));
                (want != have).then_some(Divergence {
                    digest: *digest,
                    expected: want,
                    actual: have,
                })
            })
            .collect();
        divergences.sort_by(|a, b| a.digest.cmp(&b.digest));
        divergences
    }

    /// Counts every chunk reference of a compacted manifest, streaming it.
    pub async fn from_manifest(path: &Path) -> Result<Self> {
        let mut ledger = Ledger::new();
        let mut reader = RecordReader::<_, JournalEntry>::open(path).await?;
        while let Some((offset, entry)) = reader.next().await? {
            if entry.operation == Operation::Remove {
                return Err(Error::Decode {
                    offset,
                    reason: "remove record in a compacted manifest".to_string(),
                });
            }
            for chunk in &entry.manifest.chunks {
                ledger.add_chunk(chunk);
            }
        }
        Ok(ledger)
    }

    /// Loads a ledger file; a missing file is an empty ledger.
    pub async fn load(path: &Path) -> Result<Self> {
        let mut reader = match RecordReader::<_, RefCountRecord>::open(path).await {
            Ok(reader) => reader,
            Err(Error::Io(e)) if is_not_found(&e) => return Ok(Self::new()),
            Err(e) => return Err(e),
        };
        let mut ledger = Ledger::new();
        while let Some((_, record)) = reader.next().await? {
            ledger.entries.insert(
                record.digest,
                RefCount {
                    count: record.count,
                    size: record.size,
                    stored_size: record.stored_size,
                },
            );
        }
        debug!(path = %path.display(), entries = ledger.len(), "Loaded ledger");
        Ok(ledger)
    }

    /// Writes a new version next to `path` and renames it into place.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let mut records: Vec<RefCountRecord> = self
            .entries
            .iter()
            .map(|(digest, r)| RefCountRecord {
                digest: *digest,
                count: r.count,
                size: r.size,
                stored_size: r.stored_size,
            })
            .collect();
        records.sort_by(|a, b| a.digest.cmp(&b.digest));
        write_records_atomic(path, records).await?;
        debug!(path = %path.display(), entries = self.len(), "Saved ledger");
        Ok(())
    }
}

impl FromIterator<(Digest, RefCount)> for Ledger {
    fn from_iter<I: IntoIterator<Item = (Digest, RefCount)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Loads `target`, adds `backup` to it and atomically replaces it.
pub async fn add_backup_refcnt_to(target: &Path, backup: &Ledger) -> Result<()> {
    let mut ledger = Ledger::load(target).await?;
    ledger.add_ledger(backup);
    ledger.save(target).await
}

/// Loads `target`, subtracts `backup` and atomically replaces it. Returns
/// the digests that dropped to zero; they stay in the ledger as
/// collection candidates.
pub async fn remove_backup_refcnt_to(target: &Path, backup: &Ledger) -> Result<Vec<Digest>> {
    let mut ledger = Ledger::load(target).await?;
    let zeroed = ledger.subtract_ledger(backup);
    ledger.save(target).await?;
    Ok(zeroed)
}

/// Like [`remove_backup_refcnt_to`], but entries reaching zero are dropped.
pub async fn release_backup_refcnt_from(target: &Path, backup: &Ledger) -> Result<Vec<Digest>> {
    let mut ledger = Ledger::load(target).await?;
    let zeroed = ledger.subtract_ledger(backup);
    ledger.retain_live();
    ledger.save(target).await?;
    Ok(zeroed)
}
