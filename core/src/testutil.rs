use crate::pool::{ChunkPool, PutOutcome};
use crate::{Digest, Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory chunk pool for tests.
#[derive(Default)]
pub struct MemoryPool {
    objects: Mutex<HashMap<Digest, (Bytes, DateTime<Utc>)>>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.objects.lock().unwrap().contains_key(digest)
    }

    /// Moves an object's last-touched time, e.g. to age it past a grace period.
    pub fn set_touched(&self, digest: &Digest, at: DateTime<Utc>) {
        if let Some(entry) = self.objects.lock().unwrap().get_mut(digest) {
            entry.1 = at;
        }
    }

    pub fn age_all(&self, at: DateTime<Utc>) {
        for entry in self.objects.lock().unwrap().values_mut() {
            entry.1 = at;
        }
    }

    pub fn remove_behind_the_back(&self, digest: &Digest) {
        self.objects.lock().unwrap().remove(digest);
    }
}

#[async_trait]
impl ChunkPool for MemoryPool {
    async fn put(&self, digest: &Digest, data: Bytes) -> Result<PutOutcome> {
        let mut objects = self.objects.lock().unwrap();
        let stored_size = data.len() as u64;
        match objects.get_mut(digest) {
            Some(entry) => {
                entry.1 = Utc::now();
                Ok(PutOutcome {
                    stored_size: entry.0.len() as u64,
                    written: false,
                })
            }
            None => {
                objects.insert(*digest, (data, Utc::now()));
                Ok(PutOutcome {
                    stored_size,
                    written: true,
                })
            }
        }
    }

    async fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.contains(digest))
    }

    async fn get(&self, digest: &Digest) -> Result<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(digest)
            .map(|(data, _)| data.clone())
            .ok_or(Error::ChunkNotFound { digest: *digest })
    }

    async fn delete(&self, digest: &Digest) -> Result<()> {
        self.objects.lock().unwrap().remove(digest);
        Ok(())
    }

    async fn last_touched(&self, digest: &Digest) -> Result<Option<DateTime<Utc>>> {
        Ok(self.objects.lock().unwrap().get(digest).map(|(_, at)| *at))
    }

    async fn list(&self) -> Result<Vec<Digest>> {
        Ok(self.objects.lock().unwrap().keys().copied().collect())
    }
}
