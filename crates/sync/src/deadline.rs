use std::future::Future;
use std::time::Duration;

use warden_policy::{PolicyEngineError, PolicyResult};

/// Run one policy-engine call under `deadline`; elapsing becomes
/// [`PolicyEngineError::Timeout`].
pub(crate) async fn with_deadline<T>(
    deadline: Duration,
    call: impl Future<Output = PolicyResult<T>>,
) -> PolicyResult<T> {
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(PolicyEngineError::Timeout(deadline)),
    }
}
