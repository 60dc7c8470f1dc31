//! Re-subscription wrapper for watch-based waits.
//!
//! Long-lived watch connections to the control plane are closed by proxies and
//! load balancers independently of the resource being watched. A wait whose
//! subscription broke reports `OrkaError::WatchSubscription`; this module
//! re-runs such a wait until it reaches a terminal outcome, the overall
//! timeout elapses, or the build is cancelled. Every other error is returned
//! on first occurrence.
//!
//! # Example
//!
//! ```ignore
//! let policy = RetryPolicy::new(Duration::from_secs(3600));
//! retry_on_watch_error(&policy, &cancel, "wait_for_image", || async {
//!     client.watch_image_once(name).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{OrkaError, OrkaResult};

/// Delay between re-subscriptions unless configured otherwise.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Upper bound on the whole wait, re-subscriptions included.
    pub total_timeout: Duration,
    /// Pause before re-subscribing after a broken watch.
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(total_timeout: Duration) -> Self {
        Self {
            total_timeout,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

/// Run `operation` until it returns something other than a watch subscription error.
///
/// Returns `OrkaError::Timeout` once `policy.total_timeout` has elapsed, whether
/// the operation was blocked or the wrapper was sleeping between attempts, and
/// `OrkaError::Cancelled` when `cancel` fires. In both cases the in-flight
/// attempt is dropped, which closes its watch.
pub async fn retry_on_watch_error<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> OrkaResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OrkaResult<T>>,
{
    let attempts = async {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_watch_subscription() => {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        delay_ms = policy.retry_delay.as_millis(),
                        "Watch subscription broke, re-subscribing"
                    );
                    tokio::time::sleep(policy.retry_delay).await;
                }
                Err(e) => {
                    debug!(operation = %operation_name, attempt = attempt, error = %e, "Operation failed");
                    return Err(e);
                }
            }
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OrkaError::Cancelled),
        result = tokio::time::timeout(policy.total_timeout, attempts) => match result {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(operation = %operation_name, timeout = ?policy.total_timeout, "Wait timed out");
                Err(OrkaError::Timeout(policy.total_timeout))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(total_secs: u64) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(total_secs)).with_retry_delay(Duration::from_secs(1))
    }

    fn broken() -> OrkaError {
        OrkaError::WatchSubscription("watcher closed unexpectedly".into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_immediately() {
        let result = retry_on_watch_error(&policy(10), &CancellationToken::new(), "op", || async {
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_until_terminal_success() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = retry_on_watch_error(&policy(60), &CancellationToken::new(), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 5 {
                    Err(broken())
                } else {
                    Ok("ready")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ready");
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_until_terminal_failure() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: OrkaResult<()> =
            retry_on_watch_error(&policy(60), &CancellationToken::new(), "op", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(broken())
                    } else {
                        Err(OrkaError::ResourceFailed("disk allocation error".into()))
                    }
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, OrkaError::ResourceFailed(ref m) if m == "disk allocation error"));
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_subscription_keeps_breaking() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: OrkaResult<()> =
            retry_on_watch_error(&policy(5), &CancellationToken::new(), "op", || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(broken()) }
            })
            .await;

        assert!(matches!(result, Err(OrkaError::Timeout(d)) if d == Duration::from_secs(5)));
        assert!(count.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_while_operation_blocks() {
        let result: OrkaResult<()> =
            retry_on_watch_error(&policy(3), &CancellationToken::new(), "op", || async {
                std::future::pending::<OrkaResult<()>>().await
            })
            .await;

        assert!(matches!(result, Err(OrkaError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_does_not_retry_other_errors() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: OrkaResult<()> =
            retry_on_watch_error(&policy(60), &CancellationToken::new(), "op", || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(OrkaError::Internal("request failed".into())) }
            })
            .await;

        assert!(matches!(result, Err(OrkaError::Internal(_))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_unblocks_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let result: OrkaResult<()> = retry_on_watch_error(&policy(60), &cancel, "op", || async {
            std::future::pending::<OrkaResult<()>>().await
        })
        .await;

        assert!(matches!(result, Err(OrkaError::Cancelled)));
    }
}
