use std::{collections::BTreeMap, fmt, sync::Arc};

/// Parameters are kept ordered so two logically identical maps
/// canonicalize to the same key regardless of insertion order.
pub type Params = BTreeMap<String, ParamValue>;

/// Query parameter values. No floats, so keys stay `Hash + Eq` and can
/// double as batching keys.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum ParamValue {
    String(String),
    Int(i64),
    Bool(bool),
    List(Vec<ParamValue>),
}

impl ParamValue {
    fn append_to(&self, name: &str, serializer: &mut url::form_urlencoded::Serializer<'_, String>) {
        match self {
            // lists serialize as repeated pairs, in element order
            ParamValue::List(items) => {
                for item in items {
                    item.append_to(name, serializer);
                }
            }
            ParamValue::String(value) => {
                serializer.append_pair(name, value);
            }
            ParamValue::Int(value) => {
                serializer.append_pair(name, &value.to_string());
            }
            ParamValue::Bool(value) => {
                serializer.append_pair(name, if *value { "true" } else { "false" });
            }
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::String(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::String(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl<V: Into<ParamValue>> From<Vec<V>> for ParamValue {
    fn from(values: Vec<V>) -> Self {
        ParamValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// Call-specific parameters override global ones key by key.
pub fn merge_params(global: &Params, call: Params) -> Params {
    let mut merged = global.clone();
    merged.extend(call);
    merged
}

/// The id a dynamic path generator receives.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum ResourceId {
    Single(String),
    Compound { child: String, parent: String },
}

impl ResourceId {
    pub fn as_single(&self) -> Option<&str> {
        match self {
            ResourceId::Single(id) => Some(id),
            ResourceId::Compound { .. } => None,
        }
    }

    pub fn as_compound(&self) -> Option<(&str, &str)> {
        match self {
            ResourceId::Single(_) => None,
            ResourceId::Compound { child, parent } => Some((child, parent)),
        }
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        ResourceId::Single(id.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        ResourceId::Single(id)
    }
}

impl From<(&str, &str)> for ResourceId {
    fn from((child, parent): (&str, &str)) -> Self {
        ResourceId::Compound {
            child: child.to_string(),
            parent: parent.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("dynamic path requires an id")]
    MissingId,
    #[error("malformed id: {0}")]
    MalformedId(String),
}

/// Static paths are fixed at construction; dynamic ones substitute an id
/// per call. A generator failure propagates synchronously to the caller,
/// it never reaches a batch.
#[derive(Clone)]
pub enum PathSpec {
    Static(String),
    Dynamic(Arc<dyn Fn(&ResourceId) -> Result<String, KeyError> + Send + Sync>),
}

impl PathSpec {
    pub fn fixed(path: impl Into<String>) -> Self {
        PathSpec::Static(path.into())
    }

    pub fn dynamic(generate: impl Fn(&ResourceId) -> Result<String, KeyError> + Send + Sync + 'static) -> Self {
        PathSpec::Dynamic(Arc::new(generate))
    }

    pub fn resolve(&self, id: Option<&ResourceId>) -> Result<String, KeyError> {
        match self {
            PathSpec::Static(path) => Ok(path.clone()),
            PathSpec::Dynamic(generate) => generate(id.ok_or(KeyError::MissingId)?),
        }
    }
}

impl From<&str> for PathSpec {
    fn from(path: &str) -> Self {
        PathSpec::fixed(path)
    }
}

/// Canonical `path?sorted-query` string plus the HTTP verb. Serves as
/// both the batching key and the persistent cache key.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct LoaderKey {
    method: http::Method,
    canonical: String,
}

impl LoaderKey {
    pub fn new(method: http::Method, path: &str, params: &Params) -> Self {
        LoaderKey {
            method,
            canonical: canonical_key(path, params),
        }
    }

    pub fn method(&self) -> &http::Method {
        &self.method
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl fmt::Display for LoaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.canonical)
    }
}

pub fn canonical_key(path: &str, params: &Params) -> String {
    if params.is_empty() {
        return path.to_string();
    }
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in params {
        value.append_to(name, &mut serializer);
    }
    format!("{path}?{}", serializer.finish())
}
