//! Pending mutations keyed by uuid, waiting for the next commit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::kvs::CowMap;

/// A buffered vector (empty for delete tombstones) and the time it was accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub vector: Vec<f32>,
    pub timestamp: i64,
}

impl CacheEntry {
    pub fn new(vector: Vec<f32>, timestamp: i64) -> Self {
        Self { vector, timestamp }
    }

    pub fn tombstone(timestamp: i64) -> Self {
        Self {
            vector: Vec::new(),
            timestamp,
        }
    }
}

#[derive(Default)]
pub struct VectorCache {
    entries: CowMap<String, Arc<CacheEntry>>,
    len: AtomicU64,
}

impl VectorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, uuid: &str) -> Option<Arc<CacheEntry>> {
        self.entries.load(uuid)
    }

    /// Insert or replace the entry for `uuid`.
    pub fn store(&self, uuid: String, entry: CacheEntry) -> Option<Arc<CacheEntry>> {
        let prev = self.entries.store(uuid, Arc::new(entry));
        if prev.is_none() {
            self.len.fetch_add(1, Ordering::AcqRel);
        }
        prev
    }

    pub fn delete(&self, uuid: &str) -> Option<Arc<CacheEntry>> {
        self.delete_if(uuid, |_| true)
    }

    /// Remove the entry only if `pred` holds for it. Used to drop exactly the
    /// entry a commit applied, not a newer one stored meanwhile.
    pub fn delete_if<F>(&self, uuid: &str, pred: F) -> Option<Arc<CacheEntry>>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let removed = self.entries.delete_if(uuid, |e| pred(&**e))?;
        let _ = self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        Some(removed)
    }

    /// Visit live entries until `f` returns false. Concurrent changes may or
    /// may not be observed.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&str, Arc<CacheEntry>) -> bool,
    {
        self.entries.range(|uuid, entry| f(uuid.as_str(), entry));
    }

    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
