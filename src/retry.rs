//! Retry with exponential backoff and uniform jitter.
//!
//! The policy is an explicit value object passed to [`with_retry`] at each
//! call site; there is no implicit wrapping. Only network-class errors are
//! retried (see [`FetchError::is_retryable`]); everything else propagates on
//! the first occurrence.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{FetchError, FetchResult};
use crate::metrics::MetricsRecorder;

/// Deterministic backoff component: `min(base * 2^attempt, max_delay)`.
pub fn deterministic_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let multiplier = 1u64 << attempt.min(32);
    let delay_ms = policy.base_delay_ms.saturating_mul(multiplier);
    Duration::from_millis(delay_ms.min(policy.max_delay_ms))
}

/// Full backoff delay: deterministic component plus uniform jitter, capped
/// at `max_delay`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let jitter = Duration::from_secs_f64(
        rand::thread_rng().gen_range(0.0..=policy.jitter_factor.max(f64::EPSILON)),
    );
    (deterministic_delay(policy, attempt) + jitter).min(policy.max_delay())
}

/// Run `operation` with retries per `policy`.
///
/// The closure receives the zero-based attempt number. Retry attempts are
/// recorded to metrics; an exhausted policy records one
/// `retries_exhausted` error and returns the last failure.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    domain: &str,
    metrics: &MetricsRecorder,
    mut operation: F,
) -> FetchResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = FetchResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = backoff_delay(policy, attempt);
                metrics.record_retry(domain).await;
                debug!(
                    "Retrying {} after {:?} (attempt {}/{}): {}",
                    domain,
                    delay,
                    attempt + 1,
                    policy.max_retries,
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    metrics.record_error(domain, "retries_exhausted").await;
                    warn!(
                        "Retries exhausted for {} after {} attempts: {}",
                        domain,
                        attempt + 1,
                        err
                    );
                }
                return Err(err);
            }
        }
    }
}
