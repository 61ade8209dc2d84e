//! One-shot retry policy for outbound calls
//!
//! 429 degrades the limiter, waits 15s and retries once. 5xx and timeouts
//! wait 2s and retry once. Anything else propagates. The retry's own error
//! is returned as-is.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::core::degradation::RateLimiterService;
use crate::core::errors::{Result, RetryClass, TranslationError};

/// Delays used before the single retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub rate_limited_delay: Duration,
    pub transient_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            rate_limited_delay: Duration::from_secs(15),
            transient_delay: Duration::from_secs(2),
        }
    }
}

/// Wraps calls with a timeout and the one-shot retry policy
#[derive(Debug, Clone)]
pub struct Backoff {
    rate: Arc<RateLimiterService>,
    policy: BackoffPolicy,
}

/// Await `call`, failing with `TimeoutError` once `timeout` elapses
pub async fn with_timeout<T, Fut>(call: Fut, timeout: Option<Duration>) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| TranslationError::TimeoutError)?,
        None => call.await,
    }
}

impl Backoff {
    pub fn new(rate: Arc<RateLimiterService>) -> Self {
        Self::with_policy(rate, BackoffPolicy::default())
    }

    pub fn with_policy(rate: Arc<RateLimiterService>, policy: BackoffPolicy) -> Self {
        Self { rate, policy }
    }

    /// Run `call`, retrying at most once according to the error class.
    /// A zero timeout means no timeout.
    pub async fn run<T, F, Fut>(&self, mut call: F, timeout: Option<Duration>) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = timeout.filter(|t| !t.is_zero());

        let err = match with_timeout(call(), timeout).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match err.retry_class() {
            RetryClass::RateLimited => {
                self.rate.degrade();
                warn!(
                    delay_secs = self.policy.rate_limited_delay.as_secs(),
                    "Rate limited ({}), retrying once",
                    err
                );
                sleep(self.policy.rate_limited_delay).await;
            }
            RetryClass::Transient => {
                debug!(
                    delay_ms = self.policy.transient_delay.as_millis() as u64,
                    "Transient failure ({}), retrying once",
                    err
                );
                sleep(self.policy.transient_delay).await;
            }
            RetryClass::Fatal => return Err(err),
        }

        with_timeout(call(), timeout).await
    }
}
