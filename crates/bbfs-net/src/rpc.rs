//! Per-attempt timeout and bounded retry for client RPCs.

use std::future::Future;
use std::time::Duration;

use crate::error::NetError;

/// Retry policy applied to every client RPC.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts before the call is given up (at least 1).
    pub tries: u32,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tries: 3,
            timeout: Duration::from_secs(3),
        }
    }
}

/// Run `op` up to `policy.tries` times, bounding each attempt by
/// `policy.timeout`.  Returns the first success, otherwise the last error
/// observed.  A server-side cancellation is returned immediately; retrying
/// cannot change it.
pub async fn call_with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, NetError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NetError>>,
{
    let tries = policy.tries.max(1);
    let mut last = NetError::Timeout;
    for attempt in 1..=tries {
        match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(NetError::Canceled)) => return Err(NetError::Canceled),
            Ok(Err(e)) => {
                tracing::warn!(attempt, tries, error = %e, "rpc attempt failed");
                last = e;
            }
            Err(_) => {
                tracing::warn!(attempt, tries, "rpc attempt timed out");
                last = NetError::Timeout;
            }
        }
    }
    Err(last)
}
