//! Async timeout wrappers and the default durations used across the crate.

use crate::error::{ConduitError, Result};
use std::future::Future;
use std::time::Duration;

/// Default deadline for the TCP connect attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for completing the password handshake
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between HEARTBEAT_PING frames
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default tolerated silence before a connection is failed
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(90);

/// Default deadline for RPC calls
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-frame write deadline
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Default grace period for draining connections at shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a future under a deadline, mapping expiry to `ConduitError::Timeout`.
pub async fn with_timeout<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConduitError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_before_deadline() {
        let result = with_timeout(async { Ok(42) }, Duration::from_secs(1)).await;
        assert!(matches!(result, Ok(42)));
    }

    #[tokio::test]
    async fn expiry_maps_to_timeout() {
        let result = with_timeout::<_, ()>(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(ConduitError::Timeout)));
    }
}
