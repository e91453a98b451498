use std::{collections::HashMap, sync::Arc};

use dataloader::{DataLoader, HashMapCache, Loader};
use futures_util::future::BoxFuture;
use indexmap::IndexMap;

use crate::error::LoadError;

/// Fetches the given children of one parent, resolving to a JSON array.
pub type ChildrenLoaderFn =
    Arc<dyn Fn(String, Vec<String>) -> BoxFuture<'static, Result<serde_json::Value, LoadError>> + Send + Sync>;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CompoundKey {
    pub child: String,
    pub parent: String,
}

/// Loader for resources addressed by a `(child, parent)` pair where
/// upstream only exposes "fetch children of one parent."
///
/// Requests accumulating in one window are grouped by parent, child ids
/// deduplicated, and each distinct parent fetched once. One parent's
/// failure rejects only its own requests. Settled keys are memoized for
/// the execution, so a repeat request never re-enters dispatch.
pub struct CompoundLoader {
    batch: DataLoader<CompoundResource, HashMapCache>,
}

impl CompoundLoader {
    pub fn new(fetch_children: ChildrenLoaderFn) -> Self {
        Self::with_identity_field(fetch_children, "id")
    }

    pub fn with_identity_field(fetch_children: ChildrenLoaderFn, identity_field: impl Into<String>) -> Self {
        let resource = CompoundResource {
            fetch_children,
            identity_field: identity_field.into(),
        };
        CompoundLoader {
            batch: DataLoader::with_cache(resource, tokio::spawn, HashMapCache),
        }
    }

    /// Resolves to `None` when the parent's result set does not contain
    /// the child.
    pub async fn load(
        &self,
        child: impl Into<String>,
        parent: impl Into<String>,
    ) -> Result<Option<serde_json::Value>, LoadError> {
        let key = CompoundKey {
            child: child.into(),
            parent: parent.into(),
        };
        match self.batch.load_one(key).await? {
            Some(outcome) => outcome,
            None => Err(LoadError::BatchContract("no result produced for requested key".to_string())),
        }
    }
}

struct CompoundResource {
    fetch_children: ChildrenLoaderFn,
    identity_field: String,
}

#[async_trait::async_trait]
impl Loader<CompoundKey> for CompoundResource {
    type Value = Result<Option<serde_json::Value>, LoadError>;
    type Error = LoadError;

    async fn load(&self, keys: &[CompoundKey]) -> Result<HashMap<CompoundKey, Self::Value>, Self::Error> {
        let mut groups: IndexMap<String, Vec<String>> = IndexMap::new();
        for key in keys {
            let children = groups.entry(key.parent.clone()).or_default();
            if !children.contains(&key.child) {
                children.push(key.child.clone());
            }
        }

        let parent_results: HashMap<String, Result<serde_json::Value, LoadError>> =
            futures_util::future::join_all(groups.into_iter().map(|(parent, children)| async move {
                let result = (self.fetch_children)(parent.clone(), children).await;
                (parent, result)
            }))
            .await
            .into_iter()
            .collect();

        Ok(keys
            .iter()
            .map(|key| {
                let outcome = match parent_results.get(&key.parent) {
                    Some(Ok(items)) => pick_child(items, &self.identity_field, &key.child),
                    Some(Err(err)) => Err(err.clone()),
                    None => Err(LoadError::BatchContract("parent group vanished before dispatch".to_string())),
                };
                (key.clone(), outcome)
            })
            .collect())
    }
}

fn pick_child(items: &serde_json::Value, field: &str, child: &str) -> Result<Option<serde_json::Value>, LoadError> {
    let Some(items) = items.as_array() else {
        return Err(LoadError::BatchContract(
            "children loader did not resolve to an array".to_string(),
        ));
    };
    Ok(items
        .iter()
        .find(|item| matches!(item.get(field), Some(serde_json::Value::String(id)) if id == child))
        .cloned())
}
