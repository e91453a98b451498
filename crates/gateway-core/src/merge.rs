use std::{collections::HashMap, sync::Arc};

use dataloader::{DataLoader, HashMapCache, Loader};
use futures_util::future::BoxFuture;
use indexmap::IndexMap;

use crate::error::LoadError;
use crate::key::Params;

/// Fetches one item by id.
pub type ItemLoaderFn =
    Arc<dyn Fn(String, Params) -> BoxFuture<'static, Result<serde_json::Value, LoadError>> + Send + Sync>;

/// Fetches many items by id list, resolving to a JSON array. Callers
/// whose upstream wraps the list in an envelope unwrap it here.
pub type ListLoaderFn =
    Arc<dyn Fn(Vec<String>, Params) -> BoxFuture<'static, Result<serde_json::Value, LoadError>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Response field matched against the requested id when
    /// demultiplexing a bulk response.
    pub identity_field: String,
    /// Substituted for ids the bulk response did not cover.
    pub absent_value: serde_json::Value,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            identity_field: "id".to_string(),
            absent_value: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct MergeKey {
    id: String,
    params: Params,
}

/// Coalesces single-item resolver calls into bulk upstream calls.
///
/// Calls accumulating in one window are grouped by every parameter except
/// the id. A group of one goes through the single-item loader when one is
/// provided, since bulk endpoints do not always support the same filter
/// semantics; larger groups issue one multi-item call and demultiplex by
/// item identity. This layer is an optimization only: built disabled, it
/// falls through to the underlying loaders with identical behavior.
pub struct MergedLoader {
    batch: DataLoader<MergeResource, HashMapCache>,
    single: Option<ItemLoaderFn>,
    multi: ListLoaderFn,
    config: MergeConfig,
    enabled: bool,
}

impl MergedLoader {
    pub fn new(single: Option<ItemLoaderFn>, multi: ListLoaderFn, config: MergeConfig, enabled: bool) -> Self {
        let resource = MergeResource {
            single: single.clone(),
            multi: Arc::clone(&multi),
            config: config.clone(),
        };
        MergedLoader {
            batch: DataLoader::with_cache(resource, tokio::spawn, HashMapCache),
            single,
            multi,
            config,
            enabled,
        }
    }

    pub async fn load(&self, id: impl Into<String>, params: Params) -> Result<serde_json::Value, LoadError> {
        let id = id.into();
        if !self.enabled {
            return self.load_direct(id, params).await;
        }
        match self.batch.load_one(MergeKey { id, params }).await? {
            Some(outcome) => outcome,
            None => Err(LoadError::BatchContract("no result produced for requested id".to_string())),
        }
    }

    async fn load_direct(&self, id: String, params: Params) -> Result<serde_json::Value, LoadError> {
        match &self.single {
            Some(single) => single(id, params).await,
            None => {
                let items = (self.multi)(vec![id.clone()], params).await?;
                demultiplex(&items, &self.config, &id)
            }
        }
    }
}

struct MergeResource {
    single: Option<ItemLoaderFn>,
    multi: ListLoaderFn,
    config: MergeConfig,
}

#[async_trait::async_trait]
impl Loader<MergeKey> for MergeResource {
    type Value = Result<serde_json::Value, LoadError>;
    type Error = LoadError;

    async fn load(&self, keys: &[MergeKey]) -> Result<HashMap<MergeKey, Self::Value>, Self::Error> {
        let mut groups: IndexMap<Params, Vec<String>> = IndexMap::new();
        for key in keys {
            groups.entry(key.params.clone()).or_default().push(key.id.clone());
        }

        let group_results = futures_util::future::join_all(
            groups
                .into_iter()
                .map(|(params, ids)| self.load_group(params, ids)),
        )
        .await;

        Ok(group_results.into_iter().flatten().collect())
    }
}

impl MergeResource {
    async fn load_group(&self, params: Params, ids: Vec<String>) -> Vec<(MergeKey, Result<serde_json::Value, LoadError>)> {
        if ids.len() == 1 {
            if let Some(single) = &self.single {
                let id = ids.into_iter().next().unwrap_or_default();
                let outcome = single(id.clone(), params.clone()).await;
                return vec![(MergeKey { id, params }, outcome)];
            }
        }

        match (self.multi)(ids.clone(), params.clone()).await {
            Ok(items) => ids
                .into_iter()
                .map(|id| {
                    let outcome = demultiplex(&items, &self.config, &id);
                    (
                        MergeKey {
                            id,
                            params: params.clone(),
                        },
                        outcome,
                    )
                })
                .collect(),
            Err(err) => ids
                .into_iter()
                .map(|id| {
                    (
                        MergeKey {
                            id,
                            params: params.clone(),
                        },
                        Err(err.clone()),
                    )
                })
                .collect(),
        }
    }
}

fn demultiplex(items: &serde_json::Value, config: &MergeConfig, id: &str) -> Result<serde_json::Value, LoadError> {
    let Some(items) = items.as_array() else {
        return Err(LoadError::BatchContract(
            "multi-item loader did not resolve to an array".to_string(),
        ));
    };
    Ok(items
        .iter()
        .find(|item| identity_matches(item, &config.identity_field, id))
        .cloned()
        .unwrap_or_else(|| config.absent_value.clone()))
}

fn identity_matches(item: &serde_json::Value, field: &str, id: &str) -> bool {
    match item.get(field) {
        Some(serde_json::Value::String(value)) => value == id,
        Some(serde_json::Value::Number(value)) => value.to_string() == id,
        _ => false,
    }
}
