use std::time::Duration;

/// Process-wide knobs, deserializable from the gateway's TOML config.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// When false, loaders always fetch upstream and never touch the
    /// persistent cache store. Meant for test and ephemeral environments.
    pub cache_enabled: bool,
    /// Toggles resolver-level batch merging. Disabling it falls back to
    /// the underlying loaders with identical observable behavior.
    pub batch_merging: bool,
    pub default_refresh_cooldown_ms: u64,
    pub upstream_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            cache_enabled: true,
            batch_merging: true,
            default_refresh_cooldown_ms: 5_000,
            upstream_timeout_ms: 5_000,
        }
    }
}

impl GatewayConfig {
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn default_refresh_cooldown(&self) -> Duration {
        Duration::from_millis(self.default_refresh_cooldown_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }
}

/// Per-loader behavior, fixed at loader construction.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub method: http::Method,
    /// Resolve with body and headers instead of the bare body, for
    /// callers that read pagination or count headers.
    pub headers: bool,
    /// Overrides the registry's default refresh cooldown for this loader.
    pub request_throttle_ms: Option<u64>,
    /// Skips stale-cache serving so a read after a write is fresh.
    pub is_mutation: bool,
    pub batch: bool,
    pub cache: bool,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        LoaderOptions {
            method: http::Method::GET,
            headers: false,
            request_throttle_ms: None,
            is_mutation: false,
            batch: true,
            cache: true,
        }
    }
}
