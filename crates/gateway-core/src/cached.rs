use std::{collections::HashMap, sync::Arc, time::Duration};

use dataloader::{DataLoader, HashMapCache, Loader};
use futures_util::FutureExt;
use runtime::cache::{CacheStore, Entry};
use runtime::context::RequestContext;
use runtime::fetch::Fetcher;

use crate::config::{GatewayConfig, LoaderOptions};
use crate::error::LoadError;
use crate::key::{merge_params, LoaderKey, Params, PathSpec, ResourceId};
use crate::loaded::{fetch_loaded, Loaded};
use crate::throttle::ThrottleRegistry;

/// Builds loaders over resources whose responses are safe to share across
/// callers and across requests. Lives for the process; [`Self::loader`]
/// binds one execution's request context.
pub struct CachedLoaderFactory<Store> {
    store: Arc<Store>,
    fetcher: Fetcher,
    throttle: Arc<ThrottleRegistry>,
    cache_enabled: bool,
    default_cooldown: Duration,
    global_params: Params,
}

impl<Store> CachedLoaderFactory<Store>
where
    Store: CacheStore<Value = Loaded> + 'static,
{
    pub fn new(store: Arc<Store>, fetcher: Fetcher, throttle: Arc<ThrottleRegistry>, config: &GatewayConfig) -> Self {
        CachedLoaderFactory {
            store,
            fetcher,
            throttle,
            cache_enabled: config.cache_enabled,
            default_cooldown: config.default_refresh_cooldown(),
            global_params: Params::new(),
        }
    }

    /// Parameters sent on every call this factory's loaders make, unless
    /// a call overrides them.
    pub fn with_global_params(mut self, params: Params) -> Self {
        self.global_params = params;
        self
    }

    pub fn loader<Ctx>(&self, ctx: &Arc<Ctx>, path: impl Into<PathSpec>, options: LoaderOptions) -> CachedLoader<Store, Ctx>
    where
        Ctx: RequestContext + 'static,
    {
        let cooldown = options
            .request_throttle_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_cooldown);
        let resource = CachedResource {
            store: Arc::clone(&self.store),
            fetcher: self.fetcher.clone(),
            throttle: Arc::clone(&self.throttle),
            ctx: Arc::clone(ctx),
            cache_enabled: self.cache_enabled,
            cooldown,
            with_headers: options.headers,
            is_mutation: options.is_mutation,
        };
        let batch = DataLoader::with_cache(resource, tokio::spawn, HashMapCache);
        let batch = if options.batch { batch } else { batch.max_batch_size(1) };
        batch.enable_all_cache(options.cache);
        CachedLoader {
            batch,
            path: path.into(),
            method: options.method,
            global_params: self.global_params.clone(),
        }
    }
}

/// One loader, bound to one query execution.
pub struct CachedLoader<Store, Ctx> {
    batch: DataLoader<CachedResource<Store, Ctx>, HashMapCache>,
    path: PathSpec,
    method: http::Method,
    global_params: Params,
}

impl<Store, Ctx> CachedLoader<Store, Ctx>
where
    Store: CacheStore<Value = Loaded> + 'static,
    Ctx: RequestContext + 'static,
{
    pub async fn load(&self, params: Params) -> Result<Loaded, LoadError> {
        self.load_inner(None, params).await
    }

    pub async fn load_by_id(&self, id: impl Into<ResourceId>, params: Params) -> Result<Loaded, LoadError> {
        self.load_inner(Some(id.into()), params).await
    }

    async fn load_inner(&self, id: Option<ResourceId>, params: Params) -> Result<Loaded, LoadError> {
        let path = self.path.resolve(id.as_ref())?;
        let params = merge_params(&self.global_params, params);
        let key = LoaderKey::new(self.method.clone(), &path, &params);
        match self.batch.load_one(key).await? {
            Some(outcome) => outcome,
            None => Err(LoadError::BatchContract("no result produced for requested key".to_string())),
        }
    }
}

struct CachedResource<Store, Ctx> {
    store: Arc<Store>,
    fetcher: Fetcher,
    throttle: Arc<ThrottleRegistry>,
    ctx: Arc<Ctx>,
    cache_enabled: bool,
    cooldown: Duration,
    with_headers: bool,
    is_mutation: bool,
}

#[async_trait::async_trait]
impl<Store, Ctx> Loader<LoaderKey> for CachedResource<Store, Ctx>
where
    Store: CacheStore<Value = Loaded> + 'static,
    Ctx: RequestContext + 'static,
{
    type Value = Result<Loaded, LoadError>;
    type Error = LoadError;

    async fn load(&self, keys: &[LoaderKey]) -> Result<HashMap<LoaderKey, Self::Value>, Self::Error> {
        // keys in one window are independent fetches; per-key outcomes
        // keep one key's failure from rejecting its window-mates
        let outcomes = futures_util::future::join_all(keys.iter().map(|key| self.load_key(key))).await;
        Ok(keys.iter().cloned().zip(outcomes).collect())
    }
}

impl<Store, Ctx> CachedResource<Store, Ctx>
where
    Store: CacheStore<Value = Loaded> + 'static,
    Ctx: RequestContext + 'static,
{
    async fn load_key(&self, key: &LoaderKey) -> Result<Loaded, LoadError> {
        if !self.cache_enabled {
            return fetch_loaded(&self.fetcher, key, self.with_headers, None).await;
        }

        if self.is_mutation {
            let fresh = fetch_loaded(&self.fetcher, key, self.with_headers, None).await?;
            self.write_back(key, fresh.clone()).await;
            return Ok(fresh);
        }

        let entry = match self.store.get(key.as_str()).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(
                    request_id = self.ctx.request_id(),
                    "error loading {key} from cache: {err}"
                );
                Entry::Miss
            }
        };

        match entry {
            Entry::Hit(value) => {
                tracing::info!(request_id = self.ctx.request_id(), "cache HIT - {key}");
                self.refresh_in_background(key).await;
                Ok(value)
            }
            Entry::Miss => {
                tracing::info!(request_id = self.ctx.request_id(), "cache MISS - {key}");
                let fresh = fetch_loaded(&self.fetcher, key, self.with_headers, None).await?;
                self.write_back(key, fresh.clone()).await;
                Ok(fresh)
            }
        }
    }

    /// Serves the caller from cache first, then revalidates upstream once
    /// per cooldown window. Refresh failures never reach the caller; a
    /// not-found response evicts the entry so deleted upstream records
    /// heal themselves out of the cache.
    async fn refresh_in_background(&self, key: &LoaderKey) {
        if !self.throttle.try_acquire(key.as_str(), self.cooldown).await {
            return;
        }

        let store = Arc::clone(&self.store);
        let fetcher = self.fetcher.clone();
        let with_headers = self.with_headers;
        let request_id = self.ctx.request_id().to_string();
        let key = key.clone();
        self.ctx
            .wait_until(
                async move {
                    match fetch_loaded(&fetcher, &key, with_headers, None).await {
                        Ok(fresh) => {
                            if let Err(err) = store.put(key.as_str(), fresh).await {
                                tracing::error!(request_id, "error refreshing cache entry {key}: {err}");
                            }
                        }
                        Err(err) if err.is_not_found() => {
                            tracing::info!(request_id, "evicting {key} after upstream not-found");
                            if let Err(err) = store.delete(key.as_str()).await {
                                tracing::error!(request_id, "error evicting cache entry {key}: {err}");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(request_id, "background refresh of {key} failed: {err}");
                        }
                    }
                }
                .boxed(),
            )
            .await;
    }

    async fn write_back(&self, key: &LoaderKey, value: Loaded) {
        let store = Arc::clone(&self.store);
        let cache_key = key.as_str().to_string();
        let request_id = self.ctx.request_id().to_string();
        self.ctx
            .wait_until(
                async move {
                    if let Err(err) = store.put(&cache_key, value).await {
                        tracing::error!(request_id, "error cache PUT {cache_key}: {err}");
                    }
                }
                .boxed(),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use runtime::cache::test_utils::FakeCache;
    use runtime::cache::Result as CacheResult;
    use runtime::context::test_utils::TestRequestContext;
    use runtime::fetch::{FetchError, FetchResult, FetcherInner, UpstreamRequest, UpstreamResponse};
    use serde_json::json;

    use super::*;

    fn loaded(value: serde_json::Value) -> Loaded {
        Loaded::Body(value)
    }

    /// Counts calls and answers every path with a fixed body.
    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        fail_with: Option<FetchError>,
    }

    impl CountingFetcher {
        fn failing(error: FetchError) -> Self {
            CountingFetcher {
                calls: AtomicUsize::new(0),
                fail_with: Some(error),
            }
        }
    }

    #[async_trait::async_trait]
    impl FetcherInner for &'static CountingFetcher {
        async fn fetch(&self, request: UpstreamRequest<'_>) -> FetchResult<UpstreamResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(UpstreamResponse {
                    body: json!({ "from": request.path }),
                    headers: http::HeaderMap::from_iter([(
                        http::header::HeaderName::from_static("x-total-count"),
                        http::header::HeaderValue::from_static("7"),
                    )]),
                }),
            }
        }
    }

    fn fetcher(inner: CountingFetcher) -> (&'static CountingFetcher, Fetcher) {
        let inner: &'static CountingFetcher = Box::leak(Box::new(inner));
        (inner, Fetcher::new(inner))
    }

    fn factory<Store>(store: Arc<Store>, fetcher: Fetcher, config: &GatewayConfig) -> CachedLoaderFactory<Store>
    where
        Store: CacheStore<Value = Loaded> + 'static,
    {
        CachedLoaderFactory::new(store, fetcher, Arc::new(ThrottleRegistry::new()), config)
    }

    #[derive(Default)]
    struct RecordingStore {
        entry: Option<Loaded>,
        get_calls: AtomicUsize,
        puts: std::sync::Mutex<Vec<(String, Loaded)>>,
        deletes: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl FakeCache for RecordingStore {
        type Value = Loaded;

        async fn get(&self, _key: &str) -> CacheResult<Entry<Loaded>> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.entry.clone().map(Entry::Hit).unwrap_or(Entry::Miss))
        }

        async fn put(&self, key: &str, value: Loaded) -> CacheResult<()> {
            self.puts.lock().unwrap().push((key.to_string(), value));
            Ok(())
        }

        async fn delete(&self, key: &str) -> CacheResult<()> {
            self.deletes.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn hit_resolves_before_the_refresh_runs() {
        let (upstream, fetcher) = fetcher(CountingFetcher::default());
        let store = Arc::new(RecordingStore {
            entry: Some(loaded(json!({ "cached": true }))),
            ..Default::default()
        });
        let ctx = Arc::new(TestRequestContext::new());
        let loader = factory(Arc::clone(&store), fetcher, &GatewayConfig::default()).loader(
            &ctx,
            "artist/banksy",
            LoaderOptions::default(),
        );

        let value = loader.load(Params::new()).await.unwrap();
        assert_eq!(value, loaded(json!({ "cached": true })));
        // the caller resolved while the refresh is still queued
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);

        ctx.wait_for_futures().await;
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        let puts = store.puts.lock().unwrap().clone();
        assert_eq!(puts, vec![("artist/banksy".to_string(), loaded(json!({ "from": "artist/banksy" })))]);
    }

    #[tokio::test]
    async fn refreshes_once_per_cooldown_window() {
        let (upstream, fetcher) = fetcher(CountingFetcher::default());
        let store = Arc::new(RecordingStore {
            entry: Some(loaded(json!({ "cached": true }))),
            ..Default::default()
        });
        let factory = factory(Arc::clone(&store), fetcher, &GatewayConfig::default());

        // two executions against the same process-wide registry
        for _ in 0..2 {
            let ctx = Arc::new(TestRequestContext::new());
            let loader = factory.loader(&ctx, "artist/banksy", LoaderOptions::default());
            loader.load(Params::new()).await.unwrap();
            ctx.wait_for_futures().await;
        }

        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_throttle_override_shortens_the_window() {
        let (upstream, fetcher) = fetcher(CountingFetcher::default());
        let store = Arc::new(RecordingStore {
            entry: Some(loaded(json!({ "cached": true }))),
            ..Default::default()
        });
        let factory = factory(Arc::clone(&store), fetcher, &GatewayConfig::default());
        let options = LoaderOptions {
            request_throttle_ms: Some(0),
            ..Default::default()
        };

        for _ in 0..2 {
            let ctx = Arc::new(TestRequestContext::new());
            let loader = factory.loader(&ctx, "artist/banksy", options.clone());
            loader.load(Params::new()).await.unwrap();
            ctx.wait_for_futures().await;
        }

        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn miss_fetches_synchronously_and_stores() {
        let (upstream, fetcher) = fetcher(CountingFetcher::default());
        let store = Arc::new(RecordingStore::default());
        let ctx = Arc::new(TestRequestContext::new());
        let loader = factory(Arc::clone(&store), fetcher, &GatewayConfig::default()).loader(
            &ctx,
            "artist/banksy",
            LoaderOptions::default(),
        );

        let value = loader.load(Params::new()).await.unwrap();
        assert_eq!(value, loaded(json!({ "from": "artist/banksy" })));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        ctx.wait_for_futures().await;
        let puts = store.puts.lock().unwrap().clone();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].0, "artist/banksy");
    }

    #[tokio::test]
    async fn miss_fetch_failure_rejects_and_caches_nothing() {
        let (_, fetcher) = fetcher(CountingFetcher::failing(FetchError::any("connection reset")));
        let store = Arc::new(RecordingStore::default());
        let ctx = Arc::new(TestRequestContext::new());
        let loader = factory(Arc::clone(&store), fetcher, &GatewayConfig::default()).loader(
            &ctx,
            "artist/banksy",
            LoaderOptions::default(),
        );

        let err = loader.load(Params::new()).await.unwrap_err();
        assert!(matches!(err, LoadError::Upstream { status: None, .. }));

        ctx.wait_for_futures().await;
        assert!(store.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn not_found_refresh_evicts_the_entry() {
        let (upstream, fetcher) = fetcher(CountingFetcher::failing(FetchError::Status {
            status: 404,
            message: "gone".to_string(),
        }));
        let store = Arc::new(RecordingStore {
            entry: Some(loaded(json!({ "cached": true }))),
            ..Default::default()
        });
        let ctx = Arc::new(TestRequestContext::new());
        let loader = factory(Arc::clone(&store), fetcher, &GatewayConfig::default()).loader(
            &ctx,
            "artist/banksy",
            LoaderOptions::default(),
        );

        // the stale value still serves this caller
        let value = loader.load(Params::new()).await.unwrap();
        assert_eq!(value, loaded(json!({ "cached": true })));

        ctx.wait_for_futures().await;
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.deletes.lock().unwrap().clone(), vec!["artist/banksy".to_string()]);
        assert!(store.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_failures_are_swallowed() {
        let (_, fetcher) = fetcher(CountingFetcher::failing(FetchError::Status {
            status: 500,
            message: "boom".to_string(),
        }));
        let store = Arc::new(RecordingStore {
            entry: Some(loaded(json!({ "cached": true }))),
            ..Default::default()
        });
        let ctx = Arc::new(TestRequestContext::new());
        let loader = factory(Arc::clone(&store), fetcher, &GatewayConfig::default()).loader(
            &ctx,
            "artist/banksy",
            LoaderOptions::default(),
        );

        let value = loader.load(Params::new()).await.unwrap();
        assert_eq!(value, loaded(json!({ "cached": true })));

        ctx.wait_for_futures().await;
        assert!(store.deletes.lock().unwrap().is_empty());
        assert!(store.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_cache_never_touches_the_store() {
        struct UntouchableStore;

        #[async_trait::async_trait]
        impl FakeCache for UntouchableStore {
            type Value = Loaded;
        }

        let (upstream, fetcher) = fetcher(CountingFetcher::default());
        let config = GatewayConfig {
            cache_enabled: false,
            ..Default::default()
        };
        let ctx = Arc::new(TestRequestContext::new());
        let loader = factory(Arc::new(UntouchableStore), fetcher, &config).loader(
            &ctx,
            "artist/banksy",
            LoaderOptions::default(),
        );

        let value = loader.load(Params::new()).await.unwrap();
        assert_eq!(value, loaded(json!({ "from": "artist/banksy" })));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        ctx.wait_for_futures().await;
    }

    #[tokio::test]
    async fn mutations_skip_the_cache_read_but_write_back() {
        let (upstream, fetcher) = fetcher(CountingFetcher::default());
        let store = Arc::new(RecordingStore {
            entry: Some(loaded(json!({ "stale": true }))),
            ..Default::default()
        });
        let ctx = Arc::new(TestRequestContext::new());
        let options = LoaderOptions {
            method: http::Method::PUT,
            is_mutation: true,
            batch: false,
            ..Default::default()
        };
        let loader =
            factory(Arc::clone(&store), fetcher, &GatewayConfig::default()).loader(&ctx, "collector_profile", options);

        let value = loader.load(Params::new()).await.unwrap();
        assert_eq!(value, loaded(json!({ "from": "collector_profile" })));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_calls.load(Ordering::SeqCst), 0);

        ctx.wait_for_futures().await;
        assert_eq!(store.puts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn headers_mode_resolves_body_and_headers() {
        let (_, fetcher) = fetcher(CountingFetcher::default());
        let store = Arc::new(RecordingStore::default());
        let ctx = Arc::new(TestRequestContext::new());
        let options = LoaderOptions {
            headers: true,
            ..Default::default()
        };
        let loader = factory(Arc::clone(&store), fetcher, &GatewayConfig::default()).loader(&ctx, "artworks", options);

        let value = loader.load(Params::new()).await.unwrap();
        assert_eq!(value.headers().and_then(|headers| headers.get("x-total-count").cloned()), Some("7".to_string()));
        assert_eq!(value.body(), &json!({ "from": "artworks" }));

        // the cache stores the shape the loader asked for
        ctx.wait_for_futures().await;
        assert_eq!(store.puts.lock().unwrap()[0].1, value);
    }

    #[tokio::test]
    async fn identical_keys_in_one_execution_dedupe() {
        let (upstream, fetcher) = fetcher(CountingFetcher::default());
        let store = Arc::new(RecordingStore::default());
        let ctx = Arc::new(TestRequestContext::new());
        let loader = factory(Arc::clone(&store), fetcher, &GatewayConfig::default()).loader(
            &ctx,
            "artist/banksy",
            LoaderOptions::default(),
        );

        let (a, b) = tokio::join!(loader.load(Params::new()), loader.load(Params::new()));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        // later in the same execution the memoized value answers directly
        loader.load(Params::new()).await.unwrap();
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        ctx.wait_for_futures().await;
    }

    #[tokio::test]
    async fn malformed_ids_fail_before_any_fetch() {
        let (upstream, fetcher) = fetcher(CountingFetcher::default());
        let store = Arc::new(RecordingStore::default());
        let ctx = Arc::new(TestRequestContext::new());
        let path = PathSpec::dynamic(|id| match id.as_single() {
            Some(id) if !id.is_empty() => Ok(format!("artist/{id}")),
            _ => Err(crate::key::KeyError::MalformedId("empty artist id".to_string())),
        });
        let loader =
            factory(Arc::clone(&store), fetcher, &GatewayConfig::default()).loader(&ctx, path, LoaderOptions::default());

        let err = loader.load_by_id("", Params::new()).await.unwrap_err();
        assert!(matches!(err, LoadError::Key(_)));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }
}
