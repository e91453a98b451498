use std::collections::BTreeMap;

use runtime::fetch::{Fetcher, UpstreamRequest, UpstreamResponse};

use crate::error::LoadError;
use crate::key::LoaderKey;

/// What a loader resolves with. Loaders configured for headers carry the
/// response headers along so callers can read pagination or count
/// headers; the cache stores whichever shape the loader asked for.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Loaded {
    Body(serde_json::Value),
    WithHeaders {
        body: serde_json::Value,
        headers: BTreeMap<String, String>,
    },
}

impl Loaded {
    pub fn from_response(response: UpstreamResponse, with_headers: bool) -> Self {
        if with_headers {
            let headers = response
                .headers
                .iter()
                .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
                .collect();
            Loaded::WithHeaders {
                body: response.body,
                headers,
            }
        } else {
            Loaded::Body(response.body)
        }
    }

    pub fn body(&self) -> &serde_json::Value {
        match self {
            Loaded::Body(body) => body,
            Loaded::WithHeaders { body, .. } => body,
        }
    }

    pub fn into_body(self) -> serde_json::Value {
        match self {
            Loaded::Body(body) => body,
            Loaded::WithHeaders { body, .. } => body,
        }
    }

    pub fn headers(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Loaded::Body(_) => None,
            Loaded::WithHeaders { headers, .. } => Some(headers),
        }
    }
}

pub(crate) async fn fetch_loaded(
    fetcher: &Fetcher,
    key: &LoaderKey,
    with_headers: bool,
    bearer_token: Option<&str>,
) -> Result<Loaded, LoadError> {
    let mut request = UpstreamRequest::new(key.as_str(), key.method().clone());
    request.bearer_token = bearer_token;
    let response = fetcher.fetch(request).await?;
    Ok(Loaded::from_response(response, with_headers))
}
