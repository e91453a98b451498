use futures_util::future::BoxFuture;

/// Per-execution context handed to every loader.
///
/// `wait_until` defers background work (cache writes, refreshes) past the
/// point where the caller's response has already resolved. The native
/// implementation spawns the future; tests collect and drain them
/// deterministically.
#[async_trait::async_trait]
pub trait RequestContext: Send + Sync {
    fn request_id(&self) -> &str;
    async fn wait_until(&self, fut: BoxFuture<'static, ()>);
}

#[cfg(feature = "test-utils")]
pub mod test_utils {
    use super::*;
    use futures_util::lock::Mutex;

    #[derive(Default)]
    pub struct TestRequestContext {
        futures: Mutex<Vec<BoxFuture<'static, ()>>>,
    }

    impl TestRequestContext {
        pub fn new() -> Self {
            Self::default()
        }

        /// Runs every deferred future collected so far to completion.
        pub async fn wait_for_futures(&self) {
            let futures = self
                .futures
                .lock()
                .await
                .drain(..)
                .collect::<Vec<BoxFuture<'static, ()>>>();
            futures_util::future::join_all(futures).await;
        }
    }

    #[async_trait::async_trait]
    impl RequestContext for TestRequestContext {
        fn request_id(&self) -> &str {
            "test-request"
        }

        async fn wait_until(&self, fut: BoxFuture<'static, ()>) {
            self.futures.lock().await.push(fut);
        }
    }
}
