use crate::Result;
use crate::codec::{RecordReader, write_records_atomic};
use crate::ledger::Ledger;
use crate::types::{FileManifest, JournalEntry, Operation};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Path-ordered file tree of one backup, built by replaying journal records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestIndex {
    files: BTreeMap<Vec<u8>, FileManifest>,
}

impl ManifestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &[u8]) -> Option<&FileManifest> {
        self.files.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileManifest> {
        self.files.values()
    }

    pub fn insert(&mut self, manifest: FileManifest) {
        self.files.insert(manifest.path.clone(), manifest);
    }

    /// Last write wins per path, so replaying a record twice is harmless.
    pub fn apply(&mut self, entry: JournalEntry) {
        match entry.operation {
            Operation::Add | Operation::Modify => self.insert(entry.manifest),
            Operation::Remove => {
                self.files.remove(&entry.manifest.path);
            }
        }
    }

    pub fn ledger(&self) -> Ledger {
        let mut ledger = Ledger::new();
        for chunk in self.files.values().flat_map(|m| m.chunks.iter()) {
            ledger.add_chunk(chunk);
        }
        ledger
    }

    /// Replays every record of `path` on top of `self`.
    pub async fn replay(&mut self, path: &Path) -> Result<u64> {
        let mut reader = RecordReader::<_, JournalEntry>::open(path).await?;
        let mut applied = 0;
        while let Some((_, entry)) = reader.next().await? {
            self.apply(entry);
            applied += 1;
        }
        debug!(path = %path.display(), applied, "Replayed journal");
        Ok(applied)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let mut index = Self::new();
        index.replay(path).await?;
        Ok(index)
    }

    /// Writes the tree as a compacted manifest: one Add record per path.
    pub async fn write(&self, path: &Path) -> Result<u64> {
        write_records_atomic(
            path,
            self.files.values().map(|m| JournalEntry::add(m.clone())),
        )
        .await
    }

    /// Journal records that turn `previous` into `current`.
    pub fn diff(previous: &ManifestIndex, current: &ManifestIndex) -> Vec<JournalEntry> {
        let mut entries = Vec::new();
        for (path, manifest) in &current.files {
            match previous.files.get(path) {
                None => entries.push(JournalEntry::add(manifest.clone())),
                Some(old) if old != manifest => entries.push(JournalEntry::modify(manifest.clone())),
                Some(_) => {}
            }
        }
        for (path, manifest) in &previous.files {
            if !current.files.contains_key(path) {
                entries.push(JournalEntry::remove(manifest.clone()));
            }
        }
        entries
    }
}

impl FromIterator<FileManifest> for ManifestIndex {
    fn from_iter<I: IntoIterator<Item = FileManifest>>(iter: I) -> Self {
        let mut index = Self::new();
        for manifest in iter {
            index.insert(manifest);
        }
        index
    }
}
