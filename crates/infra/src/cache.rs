//! Injected key/value cache with per-entry TTL.
//!
//! Short-lived process state (e.g. the fingerprint of the last pushed
//! schema) lives behind [`KeyValueCache`] instead of a global map, so each
//! service owns its cache and tests can substitute their own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::sync::Cache;

use crate::repo::RepoResult;

pub trait KeyValueCache: Send + Sync {
    /// Live value for `key`, if any. Expired entries read as absent.
    fn get(&self, key: &str) -> RepoResult<Option<String>>;

    /// Store `value` under `key` for `ttl`. A zero TTL stores nothing.
    fn put(&self, key: &str, value: String, ttl: Duration) -> RepoResult<()>;

    fn remove(&self, key: &str) -> RepoResult<()>;

    /// Evict expired entries now instead of on the next write.
    fn purge_expired(&self) -> RepoResult<()>;
}

impl<C: KeyValueCache + ?Sized> KeyValueCache for Arc<C> {
    fn get(&self, key: &str) -> RepoResult<Option<String>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, value: String, ttl: Duration) -> RepoResult<()> {
        (**self).put(key, value, ttl)
    }

    fn remove(&self, key: &str) -> RepoResult<()> {
        (**self).remove(key)
    }

    fn purge_expired(&self) -> RepoResult<()> {
        (**self).purge_expired()
    }
}

/// Value plus the TTL it was written with.
type Entry = (String, Duration);

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _at: Instant) -> Option<Duration> {
        Some(entry.1)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _at: Instant,
        _remaining: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.1)
    }
}

/// Process-local [`KeyValueCache`] on a moka cache. Cloning shares entries.
#[derive(Clone)]
pub struct InMemoryTtlCache {
    entries: Cache<String, Entry>,
}

impl InMemoryTtlCache {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder().expire_after(PerEntryTtl).build(),
        }
    }

    /// Live entries, after pending evictions have run.
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        usize::try_from(self.entries.entry_count()).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryTtlCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryTtlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTtlCache")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl KeyValueCache for InMemoryTtlCache {
    fn get(&self, key: &str) -> RepoResult<Option<String>> {
        Ok(self.entries.get(key).map(|(value, _)| value))
    }

    fn put(&self, key: &str, value: String, ttl: Duration) -> RepoResult<()> {
        if ttl.is_zero() {
            self.entries.invalidate(key);
        } else {
            self.entries.insert(key.to_string(), (value, ttl));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> RepoResult<()> {
        self.entries.invalidate(key);
        Ok(())
    }

    fn purge_expired(&self) -> RepoResult<()> {
        self.entries.run_pending_tasks();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_entry_is_returned() {
        let cache = InMemoryTtlCache::new();
        cache
            .put("schema", "abc".into(), Duration::from_secs(60))
            .unwrap();
        assert_eq!(cache.get("schema").unwrap().as_deref(), Some("abc"));
        assert_eq!(cache.get("other").unwrap(), None);
    }

    #[test]
    fn zero_ttl_stores_nothing_and_clears_previous() {
        let cache = InMemoryTtlCache::new();
        cache.put("k", "v".into(), Duration::from_secs(60)).unwrap();
        cache.put("k", "w".into(), Duration::ZERO).unwrap();
        assert_eq!(cache.get("k").unwrap(), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entries_are_invisible_and_purged() {
        let cache = InMemoryTtlCache::new();
        cache.put("k", "v".into(), Duration::from_millis(1)).unwrap();
        cache.put("long", "v".into(), Duration::from_secs(60)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k").unwrap(), None);
        cache.purge_expired().unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("long").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn rewriting_an_entry_takes_the_new_ttl() {
        let cache = InMemoryTtlCache::new();
        cache.put("k", "v".into(), Duration::from_secs(60)).unwrap();
        cache.put("k", "w".into(), Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k").unwrap(), None);
    }

    #[test]
    fn clones_share_state() {
        let cache = InMemoryTtlCache::new();
        let other = cache.clone();
        cache.put("k", "v".into(), Duration::from_secs(60)).unwrap();
        assert_eq!(other.get("k").unwrap().as_deref(), Some("v"));
        other.remove("k").unwrap();
        assert_eq!(cache.get("k").unwrap(), None);
    }
}
