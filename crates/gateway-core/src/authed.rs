use std::{collections::HashMap, sync::Arc};

use dataloader::{DataLoader, HashMapCache, Loader};
use futures_util::future::{BoxFuture, Shared};
use futures_util::lock::Mutex;
use futures_util::FutureExt;
use runtime::fetch::Fetcher;
use runtime::token::{AccessToken, TokenError, TokenLoader};

use crate::config::LoaderOptions;
use crate::error::LoadError;
use crate::key::{merge_params, LoaderKey, Params, PathSpec, ResourceId};
use crate::loaded::{fetch_loaded, Loaded};

type SharedExchange = Shared<BoxFuture<'static, Result<AccessToken, TokenError>>>;

/// Memoizes one bearer-token exchange per query execution.
///
/// The exchange future is created on first use and shared from then on,
/// so any number of loaders built over the same context trigger at most
/// one call to the identity service. A failed exchange is shared the same
/// way: every dependent call in the execution sees the same error.
pub struct TokenContext {
    loader: Arc<dyn TokenLoader>,
    token: Mutex<Option<SharedExchange>>,
}

impl TokenContext {
    pub fn new(loader: impl TokenLoader + 'static) -> Self {
        TokenContext {
            loader: Arc::new(loader),
            token: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<AccessToken, TokenError> {
        let fut = {
            let mut slot = self.token.lock().await;
            match &*slot {
                Some(fut) => fut.clone(),
                None => {
                    let loader = Arc::clone(&self.loader);
                    let fut = async move { loader.load().await }.boxed().shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };
        fut.await
    }
}

/// Builds loaders over user-specific resources. These never touch the
/// persistent cache store: batching and memoization are scoped to the
/// execution that owns this factory, and are discarded with it.
pub struct AuthedLoaderFactory {
    fetcher: Fetcher,
    tokens: Arc<TokenContext>,
    global_params: Params,
}

impl AuthedLoaderFactory {
    pub fn new(fetcher: Fetcher, tokens: TokenContext) -> Self {
        AuthedLoaderFactory {
            fetcher,
            tokens: Arc::new(tokens),
            global_params: Params::new(),
        }
    }

    pub fn with_global_params(mut self, params: Params) -> Self {
        self.global_params = params;
        self
    }

    pub fn loader(&self, path: impl Into<PathSpec>, options: LoaderOptions) -> AuthedLoader {
        let resource = AuthedResource {
            fetcher: self.fetcher.clone(),
            tokens: Arc::clone(&self.tokens),
            with_headers: options.headers,
        };
        let batch = DataLoader::with_cache(resource, tokio::spawn, HashMapCache);
        let batch = if options.batch { batch } else { batch.max_batch_size(1) };
        batch.enable_all_cache(options.cache);
        AuthedLoader {
            batch,
            path: path.into(),
            method: options.method,
            global_params: self.global_params.clone(),
        }
    }
}

pub struct AuthedLoader {
    batch: DataLoader<AuthedResource, HashMapCache>,
    path: PathSpec,
    method: http::Method,
    global_params: Params,
}

impl AuthedLoader {
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

struct AuthedResource {
    fetcher: Fetcher,
    tokens: Arc<TokenContext>,
    with_headers: bool,
}

#[async_trait::async_trait]
impl Loader<LoaderKey> for AuthedResource {
    type Value = Result<Loaded, LoadError>;
    type Error = LoadError;

    async fn load(&self, keys: &[LoaderKey]) -> Result<HashMap<LoaderKey, Self::Value>, Self::Error> {
        // a token failure rejects the whole window; upstream failures
        // stay per key
        let token = self.tokens.get().await?;
        let outcomes = futures_util::future::join_all(keys.iter().map(|key| {
            let token = token.clone();
            async move { fetch_loaded(&self.fetcher, key, self.with_headers, Some(token.bearer())).await }
        }))
        .await;
        Ok(keys.iter().cloned().zip(outcomes).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use runtime::fetch::{FetchError, FetchResult, FetcherInner, UpstreamRequest, UpstreamResponse};
    use serde_json::json;

    use super::*;

    struct CountingTokenLoader {
        exchanges: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl TokenLoader for CountingTokenLoader {
        async fn load(&self) -> Result<AccessToken, TokenError> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(TokenError::Exchange("identity service unavailable".to_string()))
            } else {
                Ok(AccessToken::new("secret-token"))
            }
        }
    }

    fn token_context(fail: bool) -> (Arc<AtomicUsize>, TokenContext) {
        let exchanges = Arc::new(AtomicUsize::new(0));
        let context = TokenContext::new(CountingTokenLoader {
            exchanges: Arc::clone(&exchanges),
            fail,
        });
        (exchanges, context)
    }

    /// Records each (path, bearer) pair it serves.
    #[derive(Default)]
    struct RecordingFetcher {
        requests: std::sync::Mutex<Vec<(String, Option<String>)>>,
    }

    #[async_trait::async_trait]
    impl FetcherInner for &'static RecordingFetcher {
        async fn fetch(&self, request: UpstreamRequest<'_>) -> FetchResult<UpstreamResponse> {
            self.requests
                .lock()
                .unwrap()
                .push((request.path.to_string(), request.bearer_token.map(str::to_string)));
            if request.path.starts_with("broken") {
                return Err(FetchError::Status {
                    status: 500,
                    message: "boom".to_string(),
                });
            }
            Ok(UpstreamResponse {
                body: json!({ "from": request.path }),
                headers: http::HeaderMap::new(),
            })
        }
    }

    fn recording_fetcher() -> (&'static RecordingFetcher, Fetcher) {
        let inner: &'static RecordingFetcher = Box::leak(Box::new(RecordingFetcher::default()));
        (inner, Fetcher::new(inner))
    }

    #[tokio::test]
    async fn one_token_exchange_per_execution() {
        let (exchanges, context) = token_context(false);
        let (upstream, fetcher) = recording_fetcher();
        let factory = AuthedLoaderFactory::new(fetcher, context);
        let saved = factory.loader("me/saved_artworks", LoaderOptions::default());
        let follows = factory.loader("me/follows", LoaderOptions::default());

        let (a, b) = tokio::join!(saved.load(Params::new()), follows.load(Params::new()));
        a.unwrap();
        b.unwrap();

        assert_eq!(exchanges.load(Ordering::SeqCst), 1);
        let requests = upstream.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|(_, bearer)| bearer.as_deref() == Some("secret-token")));
    }

    #[tokio::test]
    async fn token_failure_rejects_every_dependent_call() {
        let (exchanges, context) = token_context(true);
        let (upstream, fetcher) = recording_fetcher();
        let factory = AuthedLoaderFactory::new(fetcher, context);
        let saved = factory.loader("me/saved_artworks", LoaderOptions::default());
        let follows = factory.loader("me/follows", LoaderOptions::default());

        let (a, b) = tokio::join!(saved.load(Params::new()), follows.load(Params::new()));
        assert!(matches!(a.unwrap_err(), LoadError::Token(_)));
        assert!(matches!(b.unwrap_err(), LoadError::Token(_)));

        // the failed exchange is memoized too; nothing hit upstream
        assert_eq!(exchanges.load(Ordering::SeqCst), 1);
        assert!(upstream.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_identical_calls_share_one_fetch() {
        let (_, context) = token_context(false);
        let (upstream, fetcher) = recording_fetcher();
        let factory = AuthedLoaderFactory::new(fetcher, context);
        let loader = factory.loader("me/saved_artworks", LoaderOptions::default());

        let (a, b) = tokio::join!(loader.load(Params::new()), loader.load(Params::new()));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(upstream.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upstream_failures_stay_per_key() {
        let (_, context) = token_context(false);
        let (_, fetcher) = recording_fetcher();
        let factory = AuthedLoaderFactory::new(fetcher, context);
        let broken = factory.loader("broken/endpoint", LoaderOptions::default());
        let healthy = factory.loader("me/follows", LoaderOptions::default());

        let (a, b) = tokio::join!(broken.load(Params::new()), healthy.load(Params::new()));
        assert!(matches!(a.unwrap_err(), LoadError::Upstream { status: Some(500), .. }));
        b.unwrap();
    }
}
