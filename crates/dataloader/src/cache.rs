use std::{collections::HashMap, hash::Hash, marker::PhantomData};

/// Builds one memoization storage per key type used with a `DataLoader`.
pub trait CacheFactory: Send + Sync + 'static {
    fn create<K, V>(&self) -> Box<dyn CacheStorage<Key = K, Value = V>>
    where
        K: Send + Sync + Clone + Eq + Hash + 'static,
        V: Send + Sync + Clone + 'static;
}

pub trait CacheStorage: Send + Sync + 'static {
    type Key: Send + Sync + Clone + Eq + Hash + 'static;
    type Value: Send + Sync + Clone + 'static;

    fn get(&mut self, key: &Self::Key) -> Option<&Self::Value>;
    fn insert(&mut self, key: Self::Key, value: Self::Value);
}

/// No memoization: every load outside the open window dispatches again.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl CacheFactory for NoCache {
    fn create<K, V>(&self) -> Box<dyn CacheStorage<Key = K, Value = V>>
    where
        K: Send + Sync + Clone + Eq + Hash + 'static,
        V: Send + Sync + Clone + 'static,
    {
        Box::new(NoCacheImpl(PhantomData))
    }
}

struct NoCacheImpl<K, V>(PhantomData<(K, V)>);

impl<K, V> CacheStorage for NoCacheImpl<K, V>
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    type Key = K;
    type Value = V;

    fn get(&mut self, _key: &Self::Key) -> Option<&Self::Value> {
        None
    }

    fn insert(&mut self, _key: Self::Key, _value: Self::Value) {}
}

/// Unbounded memoization for the loader's lifetime, one query execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashMapCache;

impl CacheFactory for HashMapCache {
    fn create<K, V>(&self) -> Box<dyn CacheStorage<Key = K, Value = V>>
    where
        K: Send + Sync + Clone + Eq + Hash + 'static,
        V: Send + Sync + Clone + 'static,
    {
        Box::new(HashMapCacheImpl(HashMap::new()))
    }
}

struct HashMapCacheImpl<K, V>(HashMap<K, V>);

impl<K, V> CacheStorage for HashMapCacheImpl<K, V>
where
    K: Send + Sync + Clone + Eq + Hash + 'static,
    V: Send + Sync + Clone + 'static,
{
    type Key = K;
    type Value = V;

    fn get(&mut self, key: &Self::Key) -> Option<&Self::Value> {
        self.0.get(key)
    }

    fn insert(&mut self, key: Self::Key, value: Self::Value) {
        self.0.insert(key, value);
    }
}
