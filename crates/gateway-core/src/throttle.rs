use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use futures_util::lock::Mutex;

/// Bounds background refresh load: at most one refresh per key within a
/// cooldown window, per process.
///
/// Not a correctness lock. Duplicate refreshes across processes (or in a
/// lost race) are safe, just wasteful, so entries are left to expire
/// lazily instead of being removed when a refresh settles.
pub struct ThrottleRegistry {
    inner: Mutex<ThrottleInner>,
}

struct ThrottleInner {
    // injectable for tests
    now: Box<dyn Fn() -> Instant + Send + Sync>,
    entries: HashMap<String, Instant>,
}

impl Default for ThrottleRegistry {
    fn default() -> Self {
        ThrottleRegistry {
            inner: Mutex::new(ThrottleInner {
                now: Box::new(Instant::now),
                entries: HashMap::new(),
            }),
        }
    }
}

impl ThrottleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn new_with_time(now: impl Fn() -> Instant + Send + Sync + 'static) -> Self {
        ThrottleRegistry {
            inner: Mutex::new(ThrottleInner {
                now: Box::new(now),
                entries: HashMap::new(),
            }),
        }
    }

    /// Returns whether the caller may start a refresh for `key`. A `true`
    /// answer marks the key throttled for `cooldown`.
    pub async fn try_acquire(&self, key: &str, cooldown: Duration) -> bool {
        let mut inner = self.inner.lock().await;
        let now = (inner.now)();
        inner.entries.retain(|_, expires_at| *expires_at > now);
        if inner.entries.contains_key(key) {
            return false;
        }
        inner.entries.insert(key.to_string(), now + cooldown);
        true
    }
}
