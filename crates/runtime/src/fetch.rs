use std::sync::Arc;

pub type FetchResult<T> = Result<T, FetchError>;

/// Errors are `Clone` so one failed call can reject every caller sharing it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("upstream responded with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("{0}")]
    Any(String),
}

impl FetchError {
    pub fn any(error: impl ToString) -> Self {
        FetchError::Any(error.to_string())
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::Any(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// One upstream REST call. `path` already carries the canonical query
/// string, the transport only resolves it against its base URL.
pub struct UpstreamRequest<'a> {
    pub path: &'a str,
    pub method: http::Method,
    pub headers: http::HeaderMap,
    pub bearer_token: Option<&'a str>,
    pub json_body: Option<serde_json::Value>,
}

impl<'a> UpstreamRequest<'a> {
    pub fn get(path: &'a str) -> Self {
        Self::new(path, http::Method::GET)
    }

    pub fn new(path: &'a str, method: http::Method) -> Self {
        UpstreamRequest {
            path,
            method,
            headers: http::HeaderMap::new(),
            bearer_token: None,
            json_body: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub body: serde_json::Value,
    pub headers: http::HeaderMap,
}

#[async_trait::async_trait]
pub trait FetcherInner: Send + Sync {
    async fn fetch(&self, request: UpstreamRequest<'_>) -> FetchResult<UpstreamResponse>;
}

#[derive(Clone)]
pub struct Fetcher {
    inner: Arc<dyn FetcherInner>,
}

impl Fetcher {
    pub fn new(fetcher: impl FetcherInner + 'static) -> Fetcher {
        Fetcher {
            inner: Arc::new(fetcher),
        }
    }
}

impl std::ops::Deref for Fetcher {
    type Target = dyn FetcherInner;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_status_errors_carry_a_status() {
        let missing = FetchError::Status {
            status: 404,
            message: "Artwork Not Found".to_string(),
        };
        assert_eq!(missing.status(), Some(404));
        assert!(missing.is_not_found());

        let network = FetchError::any("connection reset by peer");
        assert_eq!(network.status(), None);
        assert!(!network.is_not_found());
    }

    #[tokio::test]
    async fn fetcher_handles_share_one_inner() {
        struct Canned;

        #[async_trait::async_trait]
        impl FetcherInner for Canned {
            async fn fetch(&self, request: UpstreamRequest<'_>) -> FetchResult<UpstreamResponse> {
                Ok(UpstreamResponse {
                    body: serde_json::json!({ "path": request.path }),
                    headers: http::HeaderMap::new(),
                })
            }
        }

        let fetcher = Fetcher::new(Canned);
        let clone = fetcher.clone();
        let response = clone.fetch(UpstreamRequest::get("artists")).await.unwrap();
        assert_eq!(response.body["path"], "artists");
    }
}
