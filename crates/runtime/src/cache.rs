pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    CacheGet(String),
    #[error("{0}")]
    CachePut(String),
    #[error("{0}")]
    CacheDelete(String),
}

/// Outcome of a cache read. A store must never signal a miss through its
/// error channel, errors are reserved for the store itself misbehaving.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry<T> {
    Hit(T),
    Miss,
}

/// Key/value store shared across requests. Entries are immutable snapshots:
/// writers replace them whole, so last-writer-wins is safe.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    type Value: Clone + Send + Sync + 'static;

    async fn get(&self, key: &str) -> Result<Entry<Self::Value>>;
    async fn put(&self, key: &str, value: Self::Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[cfg(feature = "test-utils")]
pub mod test_utils {
    use super::*;

    #[async_trait::async_trait]
    pub trait FakeCache: Send + Sync {
        type Value: Clone + Send + Sync + 'static;

        async fn get(&self, _key: &str) -> Result<Entry<Self::Value>> {
            unimplemented!()
        }

        async fn put(&self, _key: &str, _value: Self::Value) -> Result<()> {
            unimplemented!()
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            unimplemented!()
        }
    }

    #[async_trait::async_trait]
    impl<T: FakeCache> CacheStore for T {
        type Value = <T as FakeCache>::Value;

        async fn get(&self, key: &str) -> Result<Entry<Self::Value>> {
            self.get(key).await
        }

        async fn put(&self, key: &str, value: Self::Value) -> Result<()> {
            self.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.delete(key).await
        }
    }
}
