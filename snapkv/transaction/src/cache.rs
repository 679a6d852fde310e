use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::commit_index::CommitValue;
use crate::timestamp::Timestamp;

/// Bounded cache of decided commit index entries.
///
/// Only decided entries are cached; they never change once written. A
/// capacity of zero disables caching.
pub struct CommitTimestampCache {
    entries: Option<Mutex<LruCache<Timestamp, CommitValue>>>,
}

impl CommitTimestampCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn get(&self, start_ts: Timestamp) -> Option<CommitValue> {
        self.entries
            .as_ref()
            .and_then(|entries| entries.lock().get(&start_ts).copied())
    }

    pub fn put(&self, start_ts: Timestamp, value: CommitValue) {
        if let Some(entries) = &self.entries {
            entries.lock().put(start_ts, value);
        }
    }

    /// Forget an entry whose outcome became uncertain.
    pub fn invalidate(&self, start_ts: Timestamp) {
        if let Some(entries) = &self.entries {
            entries.lock().pop(&start_ts);
        }
    }

    /// Forget every entry, for example after the commit index was restored.
    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .as_ref()
            .map_or(0, |entries| entries.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
