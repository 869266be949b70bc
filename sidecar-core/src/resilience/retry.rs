//! Retry with exponential backoff
//!
//! Runs an async operation up to `max_attempts` times. Each failure is
//! classified first: permanent errors are returned at once, transient and
//! rate-limited ones sleep `compute_delay` and try again.

use super::backoff::BackoffPolicy;
use crate::core::errors::SidecarError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// How a failure should be treated by the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network blip, timeout, dropped session - retry with normal backoff
    Transient,
    /// Provider asked us to slow down - retry with rate-limit backoff
    RateLimited,
    /// Validation, not-found, protocol errors - never retry
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Permanent => "permanent",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

/// Pluggable error classifier
pub trait ErrorClassifier<E> {
    fn classify(&self, error: &E) -> ErrorClass;
}

impl<E, F> ErrorClassifier<E> for F
where
    F: Fn(&E) -> ErrorClass,
{
    fn classify(&self, error: &E) -> ErrorClass {
        self(error)
    }
}

/// Default classification of sidecar errors
///
/// Breaker-open and not-connected are permanent here: the caller decides
/// whether to queue and retry at a higher level.
pub fn classify_sidecar_error(error: &SidecarError) -> ErrorClass {
    match error {
        SidecarError::Connection(_) | SidecarError::Timeout { .. } | SidecarError::Closed(_) => {
            ErrorClass::Transient
        }
        SidecarError::RateLimited(_) => ErrorClass::RateLimited,
        // Server-side JSON-RPC errors in the implementation-defined range
        SidecarError::Rpc { code, .. } if (-32099..=-32000).contains(code) && *code != -32005 => {
            ErrorClass::Transient
        }
        SidecarError::Rpc { code, .. } if *code == -32005 || *code == 429 => {
            ErrorClass::RateLimited
        }
        SidecarError::Storage(_) => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Passed to the `on_retry` observer before each sleep
#[derive(Debug)]
pub struct RetryAttempt<'a, E> {
    /// Attempt that just failed (1-based)
    pub attempt: u32,
    /// Delay before the next attempt
    pub delay: Duration,
    /// Classification of the failure
    pub class: ErrorClass,
    /// The failure itself
    pub error: &'a E,
}

/// Execute `op`, retrying retryable failures with backoff
///
/// `policy.max_attempts` counts every attempt including the first. The
/// last error is returned once attempts run out.
pub async fn retry_with_backoff<T, E, F, Fut, C, O>(
    policy: &BackoffPolicy,
    classifier: &C,
    mut on_retry: O,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: ErrorClassifier<E>,
    O: FnMut(&RetryAttempt<'_, E>),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, "operation recovered after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                let class = classifier.classify(&error);
                if !class.is_retryable() || attempt >= max_attempts {
                    debug!(attempt, class = class.as_str(), "giving up");
                    return Err(error);
                }

                let delay = policy.compute_delay(attempt, class == ErrorClass::RateLimited);
                on_retry(&RetryAttempt {
                    attempt,
                    delay,
                    class,
                    error: &error,
                });
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    class = class.as_str(),
                    "retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(1),
            rate_limit_base_delay: Duration::from_millis(2),
            jitter_factor: 0.0,
            max_attempts,
            ..BackoffPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, SidecarError> = retry_with_backoff(
            &fast_policy(3),
            &classify_sidecar_error,
            |_| {},
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                }
            },
        )
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut retries = 0;
        let result: Result<(), SidecarError> = retry_with_backoff(
            &fast_policy(5),
            &classify_sidecar_error,
            |_| retries += 1,
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(SidecarError::Protocol("bad params".into()))
                }
            },
        )
        .await;

        assert!(matches!(result, Err(SidecarError::Protocol(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retries, 0);
    }

    #[tokio::test]
    async fn test_exhausts_attempts_and_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut observed = Vec::new();
        let result: Result<(), SidecarError> = retry_with_backoff(
            &fast_policy(3),
            &classify_sidecar_error,
            |a: &RetryAttempt<'_, SidecarError>| observed.push(a.attempt),
            || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(SidecarError::Connection(format!("fail {}", n)))
                }
            },
        )
        .await;

        assert_eq!(result, Err(SidecarError::Connection("fail 3".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(observed, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_rate_limited_classified() {
        let mut classes = Vec::new();
        let _: Result<(), SidecarError> = retry_with_backoff(
            &fast_policy(2),
            &classify_sidecar_error,
            |a: &RetryAttempt<'_, SidecarError>| classes.push(a.class),
            || async { Err(SidecarError::RateLimited("429".into())) },
        )
        .await;

        assert_eq!(classes, vec![ErrorClass::RateLimited]);
    }

    #[test]
    fn test_classifier_table() {
        assert_eq!(
            classify_sidecar_error(&SidecarError::Rpc {
                code: -32005,
                message: "too many".into()
            }),
            ErrorClass::RateLimited
        );
        assert_eq!(
            classify_sidecar_error(&SidecarError::Rpc {
                code: -32602,
                message: "invalid params".into()
            }),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify_sidecar_error(&SidecarError::Rpc {
                code: -32004,
                message: "block not available".into()
            }),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_sidecar_error(&SidecarError::CircuitOpen { name: "x".into() }),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify_sidecar_error(&SidecarError::NotConnected { state: "FAILED".into() }),
            ErrorClass::Permanent
        );
    }
}
