use std::{
    collections::{BinaryHeap, HashMap},
    time::{Duration, Instant},
};

use futures_util::lock::Mutex;
use runtime::cache::{CacheStore, Entry, Result};

/// In-memory store with an optional uniform TTL. Expired entries are
/// purged lazily on access.
pub struct InMemoryCacheStore<T> {
    inner: Mutex<CacheInner<T>>,
}

impl<T> InMemoryCacheStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        InMemoryCacheStore {
            inner: Mutex::new(CacheInner::new(Some(ttl), Box::new(Instant::now))),
        }
    }

    #[cfg(test)]
    fn new_with_time(ttl: Option<Duration>, now: impl Fn() -> Instant + Send + Sync + 'static) -> Self {
        InMemoryCacheStore {
            inner: Mutex::new(CacheInner::new(ttl, Box::new(now))),
        }
    }
}

impl<T> Default for InMemoryCacheStore<T> {
    fn default() -> Self {
        InMemoryCacheStore {
            inner: Mutex::new(CacheInner::new(None, Box::new(Instant::now))),
        }
    }
}

struct CacheInner<T> {
    // injectable for tests
    now: Box<dyn Fn() -> Instant + Send + Sync>,
    ttl: Option<Duration>,
    entries: HashMap<String, StoredEntry<T>>,
    deletion_tasks: BinaryHeap<DeletionTask>,
}

struct StoredEntry<T> {
    value: T,
    stored_at: Instant,
}

#[derive(Debug, PartialEq, Eq)]
struct DeletionTask {
    key: String,
    to_delete_at: Instant,
}

impl PartialOrd for DeletionTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeletionTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_delete_at.cmp(&other.to_delete_at).reverse()
    }
}

impl<T> CacheInner<T> {
    fn new(ttl: Option<Duration>, now: Box<dyn Fn() -> Instant + Send + Sync>) -> Self {
        CacheInner {
            now,
            ttl,
            entries: HashMap::new(),
            deletion_tasks: BinaryHeap::new(),
        }
    }

    fn purge(&mut self, now: Instant) {
        let Some(ttl) = self.ttl else { return };
        while self
            .deletion_tasks
            .peek()
            .is_some_and(|task| task.to_delete_at <= now)
        {
            let Some(DeletionTask { key, .. }) = self.deletion_tasks.pop() else {
                break;
            };
            // an overwrite since this task was queued pushed the real
            // deadline back, keep the entry and trust the newer task
            if self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.stored_at + ttl <= now)
            {
                self.entries.remove(&key);
            }
        }
    }
}

#[async_trait::async_trait]
impl<T: Clone + Send + Sync + 'static> CacheStore for InMemoryCacheStore<T> {
    type Value = T;

    async fn get(&self, key: &str) -> Result<Entry<Self::Value>> {
        let mut inner = self.inner.lock().await;
        let now = (inner.now)();
        inner.purge(now);
        Ok(inner
            .entries
            .get(key)
            .map(|entry| Entry::Hit(entry.value.clone()))
            .unwrap_or(Entry::Miss))
    }

    async fn put(&self, key: &str, value: Self::Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = (inner.now)();
        inner.purge(now);
        let key = key.to_string();
        inner.entries.insert(
            key.clone(),
            StoredEntry {
                value,
                stored_at: now,
            },
        );
        if let Some(ttl) = inner.ttl {
            inner.deletion_tasks.push(DeletionTask {
                key,
                to_delete_at: now + ttl,
            });
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = (inner.now)();
        inner.purge(now);
        inner.entries.remove(key);
        Ok(())
    }
}
