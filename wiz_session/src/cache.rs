//! A cache of reads that belong to the current session

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde_json::Value;
use wiz_clock::{Clock, DurationSecs, System, UnixTime};

/// The cache key under which the current user is kept
pub const USER_KEY: &str = "user";

struct Entry {
    value: Value,
    stored: UnixTime,
}

/// Cached JSON reads, keyed by request path
///
/// Entries older than the staleness period are not returned. Everything in
/// the cache is tied to the session that fetched it and is dropped when that
/// session ends.
pub struct ReadCache {
    entries: Mutex<HashMap<String, Entry>>,
    stale_after: DurationSecs,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl ReadCache {
    /// The default staleness period of five minutes
    pub const DEFAULT_STALE_AFTER: DurationSecs = DurationSecs::from_mins(5);

    /// Constructs an empty cache using the system clock
    pub fn new(stale_after: DurationSecs) -> Self {
        Self::with_clock(stale_after, Arc::new(System))
    }

    /// Constructs an empty cache using a custom clock
    pub fn with_clock(stale_after: DurationSecs, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            stale_after,
            clock,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gets a fresh entry
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        let entries = self.entries();
        let entry = entries.get(key)?;
        if now - entry.stored < self.stale_after {
            Some(entry.value.clone())
        } else {
            tracing::trace!(key, stored = entry.stored.0, "cached read is stale");
            None
        }
    }

    /// Stores an entry, replacing any previous value
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        let stored = self.clock.now();
        self.entries().insert(key.into(), Entry { value, stored });
    }

    /// Removes an entry
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.entries().remove(key).map(|e| e.value)
    }

    /// Drops every entry, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let dropped = entries.len();
        entries.clear();
        dropped
    }

    /// The number of entries, fresh or stale
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReadCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_STALE_AFTER)
    }
}

impl fmt::Debug for ReadCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReadCache")
            .field("keys", &self.entries().keys().cloned().collect::<Vec<_>>())
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiz_clock::TestClock;

    use super::*;

    #[test]
    fn entries_go_stale() {
        let clock = TestClock::new(UnixTime(100));
        let cache = ReadCache::with_clock(DurationSecs(60), Arc::new(clock.clone()));

        cache.insert(USER_KEY, json!({"id": 1}));
        assert_eq!(cache.get(USER_KEY), Some(json!({"id": 1})));

        clock.advance(DurationSecs(60));
        assert_eq!(cache.get(USER_KEY), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_drops_everything() {
        let cache = ReadCache::default();
        cache.insert("user", json!(1));
        cache.insert("transactions", json!([]));

        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.clear(), 0);
    }
}
