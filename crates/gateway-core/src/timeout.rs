use std::{future::Future, time::Duration};

use crate::error::LoadError;

/// Caps a loader future with a deadline. Whichever settles first wins;
/// the loser is dropped, which cancels observation only, not any
/// underlying upstream call.
pub async fn with_deadline<T>(
    timeout: Duration,
    execution: impl Future<Output = Result<T, LoadError>>,
) -> Result<T, LoadError> {
    let deadline = async {
        tokio::time::sleep(timeout).await;
        Err(LoadError::DeadlineExceeded { timeout })
    };

    tokio::select! {
        result = deadline => result,
        result = execution => result,
    }
}
