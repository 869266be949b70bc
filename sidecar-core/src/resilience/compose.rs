//! Explicit composition of the resilience wrappers
//!
//! ```text
//! with_dead_letter(store, payload, || {
//!     with_circuit_breaker(&breaker, || with_retry(&policy, base_call))
//! })
//! ```
//!
//! Retries run inside the breaker, so one exhausted retry sequence counts
//! as a single breaker failure.

use super::backoff::BackoffPolicy;
use super::circuit_breaker::CircuitBreaker;
use super::dead_letter::DeadLetterStore;
use super::retry::{classify_sidecar_error, retry_with_backoff, RetryAttempt};
use crate::core::errors::{SidecarError, SidecarResult};
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, error};

/// Retry `op` with the default sidecar error classifier
pub async fn with_retry<T, F, Fut>(policy: &BackoffPolicy, op: F) -> SidecarResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SidecarResult<T>>,
{
    retry_with_backoff(
        policy,
        &classify_sidecar_error,
        |a: &RetryAttempt<'_, SidecarError>| {
            debug!(
                attempt = a.attempt,
                delay_ms = a.delay.as_millis() as u64,
                error = %a.error,
                "retrying call"
            );
        },
        op,
    )
    .await
}

/// Run `op` through `breaker`
pub async fn with_circuit_breaker<T, F, Fut>(breaker: &CircuitBreaker, op: F) -> SidecarResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = SidecarResult<T>>,
{
    breaker.execute(op).await
}

/// Run `op`; on failure, park `payload` in the dead-letter store and
/// return the original error
///
/// A failure to store the dead letter is logged, never returned.
pub async fn with_dead_letter<T, F, Fut>(
    store: &DeadLetterStore,
    payload: serde_json::Value,
    metadata: BTreeMap<String, String>,
    op: F,
) -> SidecarResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = SidecarResult<T>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(e) => {
            if let Err(store_err) = store.add(payload, &e, metadata).await {
                error!(error = %e, store_error = %store_err, "failed to dead-letter operation");
            }
            Err(e)
        }
    }
}
