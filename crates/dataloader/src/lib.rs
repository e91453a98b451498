//! Collects every `load` issued while a batching window is open and
//! dispatches them as one grouped call, resolving each caller from the
//! per-key result map.
//!
//! The window closes after a configurable delay (or earlier when
//! `max_batch_size` is reached). Duplicate keys inside a window share one
//! slot, and an optional cache memoizes settled values for the loader's
//! lifetime so repeated loads of the same key never re-dispatch.

mod cache;

use std::{
    any::{Any, TypeId},
    collections::{HashMap, HashSet},
    hash::Hash,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_channel::oneshot;
use futures_util::{future::BoxFuture, lock::Mutex, FutureExt};
use indexmap::IndexSet;

pub use cache::{CacheFactory, CacheStorage, HashMapCache, NoCache};

/// Resolves a whole batch of keys in one round trip.
///
/// The returned map must cover every requested key that exists; a key
/// absent from the map resolves to `None` on the caller side, never to a
/// shifted slot. Rejecting the batch rejects every caller in the window
/// with a clone of the same error.
#[async_trait::async_trait]
pub trait Loader<K: Send + Sync + Hash + Eq + Clone + 'static>: Send + Sync + 'static {
    type Value: Send + Sync + Clone + 'static;
    type Error: Send + Sync + Clone + 'static;

    async fn load(&self, keys: &[K]) -> Result<HashMap<K, Self::Value>, Self::Error>;
}

struct Requests<K, T>
where
    K: Send + Sync + Hash + Eq + Clone + 'static,
    T: Loader<K>,
{
    keys: IndexSet<K>,
    #[allow(clippy::type_complexity)]
    pending: Vec<(
        HashSet<K>,
        oneshot::Sender<Result<HashMap<K, T::Value>, T::Error>>,
    )>,
    cache_storage: Box<dyn CacheStorage<Key = K, Value = T::Value>>,
}

impl<K, T> Requests<K, T>
where
    K: Send + Sync + Hash + Eq + Clone + 'static,
    T: Loader<K>,
{
    fn new(factory: &impl CacheFactory) -> Self {
        Requests {
            keys: IndexSet::new(),
            pending: Vec::new(),
            cache_storage: factory.create(),
        }
    }

    #[allow(clippy::type_complexity)]
    fn take_batch(
        &mut self,
    ) -> (
        IndexSet<K>,
        Vec<(
            HashSet<K>,
            oneshot::Sender<Result<HashMap<K, T::Value>, T::Error>>,
        )>,
    ) {
        (std::mem::take(&mut self.keys), std::mem::take(&mut self.pending))
    }
}

struct DataLoaderInner<T> {
    requests: Mutex<HashMap<TypeId, Box<dyn Any + Send>>>,
    loader: T,
}

impl<T: Send + Sync + 'static> DataLoaderInner<T> {
    async fn flush<K>(&self, use_cache: bool)
    where
        K: Send + Sync + Hash + Eq + Clone + 'static,
        T: Loader<K>,
    {
        let batch = {
            let mut requests = self.requests.lock().await;
            match requests.get_mut(&TypeId::of::<Requests<K, T>>()) {
                Some(any) => any
                    .downcast_mut::<Requests<K, T>>()
                    .expect("requests are keyed by their own TypeId")
                    .take_batch(),
                None => return,
            }
        };
        if batch.0.is_empty() {
            // an earlier overflow dispatch already drained this window
            return;
        }
        self.dispatch(use_cache, batch.0, batch.1).await;
    }

    async fn dispatch<K>(
        &self,
        use_cache: bool,
        keys: IndexSet<K>,
        pending: Vec<(
            HashSet<K>,
            oneshot::Sender<Result<HashMap<K, T::Value>, T::Error>>,
        )>,
    ) where
        K: Send + Sync + Hash + Eq + Clone + 'static,
        T: Loader<K>,
    {
        let keys = keys.into_iter().collect::<Vec<_>>();
        #[cfg(feature = "tracing")]
        tracing::debug!("dispatching a batch of {} keys to {} waiters", keys.len(), pending.len());
        match self.loader.load(&keys).await {
            Ok(values) => {
                if use_cache {
                    let mut requests = self.requests.lock().await;
                    if let Some(any) = requests.get_mut(&TypeId::of::<Requests<K, T>>()) {
                        let typed = any
                            .downcast_mut::<Requests<K, T>>()
                            .expect("requests are keyed by their own TypeId");
                        for (key, value) in &values {
                            typed.cache_storage.insert(key.clone(), value.clone());
                        }
                    }
                }
                for (wanted, sender) in pending {
                    let result = wanted
                        .iter()
                        .filter_map(|key| values.get(key).map(|value| (key.clone(), value.clone())))
                        .collect();
                    let _ = sender.send(Ok(result));
                }
            }
            Err(err) => {
                for (_, sender) in pending {
                    let _ = sender.send(Err(err.clone()));
                }
            }
        }
    }
}

pub struct DataLoader<T, C = NoCache> {
    inner: Arc<DataLoaderInner<T>>,
    cache_factory: C,
    spawner: Box<dyn Fn(BoxFuture<'static, ()>) + Send + Sync>,
    delay: Duration,
    max_batch_size: usize,
    disable_cache: AtomicBool,
}

impl<T: Send + Sync + 'static> DataLoader<T, NoCache> {
    pub fn new<S, R>(loader: T, spawner: S) -> Self
    where
        S: Fn(BoxFuture<'static, ()>) -> R + Send + Sync + 'static,
    {
        Self::with_cache(loader, spawner, NoCache)
    }
}

impl<T: Send + Sync + 'static, C: CacheFactory> DataLoader<T, C> {
    pub fn with_cache<S, R>(loader: T, spawner: S, cache_factory: C) -> Self
    where
        S: Fn(BoxFuture<'static, ()>) -> R + Send + Sync + 'static,
    {
        DataLoader {
            inner: Arc::new(DataLoaderInner {
                requests: Mutex::new(HashMap::new()),
                loader,
            }),
            cache_factory,
            spawner: Box::new(move |fut| {
                spawner(fut);
            }),
            delay: Duration::from_millis(1),
            max_batch_size: 1000,
            disable_cache: AtomicBool::new(false),
        }
    }

    /// How long a window stays open once its first key arrives.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Dispatches early once this many distinct keys accumulate. A size of
    /// 1 turns batching off entirely.
    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    /// Toggles memoization across every key type of this loader.
    pub fn enable_all_cache(&self, enable: bool) {
        self.disable_cache.store(!enable, Ordering::SeqCst);
    }

    pub fn loader(&self) -> &T {
        &self.inner.loader
    }

    pub async fn load_one<K>(&self, key: K) -> Result<Option<T::Value>, T::Error>
    where
        K: Send + Sync + Hash + Eq + Clone + 'static,
        T: Loader<K>,
    {
        let mut values = self.load_keys(vec![key.clone()]).await?;
        Ok(values.remove(&key))
    }

    /// Resolves each input key to its slot in the output, same order and
    /// length, with `None` standing in for keys the loader did not cover.
    pub async fn load_many<K>(&self, keys: impl IntoIterator<Item = K>) -> Result<Vec<Option<T::Value>>, T::Error>
    where
        K: Send + Sync + Hash + Eq + Clone + 'static,
        T: Loader<K>,
    {
        let keys = keys.into_iter().collect::<Vec<_>>();
        let values = self.load_keys(keys.clone()).await?;
        Ok(keys.iter().map(|key| values.get(key).cloned()).collect())
    }

    async fn load_keys<K>(&self, keys: Vec<K>) -> Result<HashMap<K, T::Value>, T::Error>
    where
        K: Send + Sync + Hash + Eq + Clone + 'static,
        T: Loader<K>,
    {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let use_cache = !self.disable_cache.load(Ordering::SeqCst);

        let (rx, overflow_batch, schedule_flush, mut results) = {
            let mut requests = self.inner.requests.lock().await;
            let typed = requests
                .entry(TypeId::of::<Requests<K, T>>())
                .or_insert_with(|| Box::new(Requests::<K, T>::new(&self.cache_factory)))
                .downcast_mut::<Requests<K, T>>()
                .expect("requests are keyed by their own TypeId");

            let mut cached = HashMap::new();
            let mut missing = HashSet::new();
            for key in keys {
                if use_cache {
                    if let Some(value) = typed.cache_storage.get(&key) {
                        cached.insert(key, value.clone());
                        continue;
                    }
                }
                // the window stays in first-seen order
                typed.keys.insert(key.clone());
                missing.insert(key);
            }

            if missing.is_empty() {
                return Ok(cached);
            }

            let first_in_window = typed.pending.is_empty();
            let (tx, rx) = oneshot::channel();
            typed.pending.push((missing, tx));

            if typed.keys.len() >= self.max_batch_size {
                (rx, Some(typed.take_batch()), false, cached)
            } else {
                (rx, None, first_in_window, cached)
            }
        };

        if let Some((keys, pending)) = overflow_batch {
            self.inner.dispatch(use_cache, keys, pending).await;
        } else if schedule_flush {
            let inner = Arc::clone(&self.inner);
            let delay = self.delay;
            (self.spawner)(
                async move {
                    tokio::time::sleep(delay).await;
                    inner.flush::<K>(use_cache).await;
                }
                .boxed(),
            );
        }

        let fetched = rx.await.expect("batch dispatch dropped its waiters")?;
        results.extend(fetched);
        Ok(results)
    }
}
