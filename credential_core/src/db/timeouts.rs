//! Store call timeout helpers
//!
//! Every manager wraps its store calls in [`with_timeout`] so that a stalled
//! connection surfaces as a retryable `TransientStore` error instead of an
//! indefinite hang.

use crate::error::{CredentialError, CredentialResult};
use std::time::Duration;
use tokio::time::timeout;

/// Default timeout for a single store call (5 seconds)
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a store call, failing with `CredentialError::TransientStore` once `duration` elapses
///
/// The inner future is dropped on timeout. Single statements and open
/// transactions are rolled back by the driver when dropped, so no partial
/// mutation is left behind.
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> CredentialResult<T>
where
    F: std::future::Future<Output = CredentialResult<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(CredentialError::TransientStore(format!(
            "store operation timed out after {duration:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slow_call_becomes_transient() {
        let result: CredentialResult<()> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let result: CredentialResult<()> =
            with_timeout(DEFAULT_QUERY_TIMEOUT, async { Err(CredentialError::Expired) }).await;
        assert!(matches!(result, Err(CredentialError::Expired)));
    }
}
