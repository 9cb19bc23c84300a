//! Timeout defaults and async timeout helpers.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, Result};

/// Default timeout for a single network operation
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between keepalive / heartbeat checks
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Silence after which a client is considered gone
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Time allowed for graceful shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `fut` with a deadline, mapping expiry to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Sleep for `duration` unless `token` is cancelled first.
///
/// Returns `true` if the full delay elapsed.
pub async fn cancellable_sleep(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
