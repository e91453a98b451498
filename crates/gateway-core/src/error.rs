use std::time::Duration;

use runtime::fetch::FetchError;
use runtime::token::TokenError;

use crate::key::KeyError;

/// What a loader caller can observe: exactly one value or one of these
/// per call, never partial batch data. `Clone` because a single failure
/// often fans out to every waiter of a batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("{message}")]
    Upstream { status: Option<u16>, message: String },
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("deadline of {timeout:?} exceeded")]
    DeadlineExceeded { timeout: Duration },
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("batch dispatch violated its contract: {0}")]
    BatchContract(String),
}

impl LoadError {
    pub fn status(&self) -> Option<u16> {
        match self {
            LoadError::Upstream { status, .. } => *status,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

impl From<FetchError> for LoadError {
    fn from(err: FetchError) -> Self {
        LoadError::Upstream {
            status: err.status(),
            message: err.to_string(),
        }
    }
}
