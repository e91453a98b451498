use runtime::fetch::{FetchError, FetchResult, Fetcher, FetcherInner, UpstreamRequest, UpstreamResponse};

pub struct NativeFetcher {
    client: reqwest::Client,
    base_url: url::Url,
}

impl NativeFetcher {
    pub fn runtime_fetcher(base_url: url::Url) -> Fetcher {
        Fetcher::new(NativeFetcher {
            client: reqwest::Client::new(),
            base_url,
        })
    }
}

#[async_trait::async_trait]
impl FetcherInner for NativeFetcher {
    async fn fetch(&self, request: UpstreamRequest<'_>) -> FetchResult<UpstreamResponse> {
        let url = self.base_url.join(request.path).map_err(FetchError::any)?;

        let mut builder = self.client.request(request.method, url).headers(request.headers);
        if let Some(token) = request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(FetchError::any)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let headers = response.headers().clone();
        let body = response.json().await.map_err(FetchError::any)?;
        Ok(UpstreamResponse { body, headers })
    }
}
