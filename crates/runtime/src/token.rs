/// Short-lived bearer credential obtained from the identity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    bearer: String,
}

impl AccessToken {
    pub fn new(bearer: impl Into<String>) -> Self {
        AccessToken { bearer: bearer.into() }
    }

    pub fn bearer(&self) -> &str {
        &self.bearer
    }
}

/// `Clone` so a single failed exchange can reject every waiter that
/// depends on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token exchange failed: {0}")]
    Exchange(String),
}

#[async_trait::async_trait]
pub trait TokenLoader: Send + Sync {
    async fn load(&self) -> Result<AccessToken, TokenError>;
}
