//! Circuit breaker for remote calls
//!
//! Three-state gate per named resource:
//! Closed (normal) → Open (fail fast) → HalfOpen (probing recovery)
//!
//! All state transitions happen inside [`CircuitBreaker::execute`]. The
//! wrapped call's own error is always handed back to the caller; only a
//! rejected call produces [`CircuitOpen`].

use crate::core::errors::SidecarError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Circuit tripped, requests fail fast
    Open,
    /// Testing if the resource recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Gauge value (0=Closed, 1=Open, 2=HalfOpen)
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Successes in HalfOpen needed to close again
    pub success_threshold: u32,
    /// How long to stay Open after the last failure
    pub timeout: Duration,
    /// Maximum probes in flight while HalfOpen
    pub half_open_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_attempts: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Aggressive configuration (for testing)
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            timeout: Duration::from_secs(5),
            half_open_attempts: 1,
        }
    }

    /// Conservative configuration for flaky shared providers
    pub fn conservative() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 5,
            timeout: Duration::from_secs(60),
            half_open_attempts: 5,
        }
    }

    /// Successes needed in HalfOpen to close
    ///
    /// Capped by `half_open_attempts`, otherwise a breaker with fewer
    /// probe slots than required successes could never close.
    pub fn required_successes(&self) -> u32 {
        self.success_threshold.min(self.half_open_attempts).max(1)
    }
}

/// Rejection produced when the circuit does not admit a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpen {
    /// Name of the protected resource
    pub name: String,
}

impl std::fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circuit '{}' is open", self.name)
    }
}

impl std::error::Error for CircuitOpen {}

impl From<CircuitOpen> for SidecarError {
    fn from(e: CircuitOpen) -> Self {
        SidecarError::CircuitOpen { name: e.name }
    }
}

/// Point-in-time copy of a breaker, used by health reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Milliseconds since the last failure, if any
    pub since_last_failure_ms: Option<u64>,
    pub rejected: u64,
    pub opened: u64,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    half_open_in_flight: u32,
}

struct Shared {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    rejected: AtomicU64,
    opened: AtomicU64,
}

/// Circuit breaker for one named resource
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Shared>,
}

/// Admission ticket; releases a HalfOpen probe slot on drop, so a probe
/// whose future is cancelled does not leak its slot.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe {
            let mut st = self.breaker.inner.state.lock();
            st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(breaker = %name, ?config, "creating circuit breaker");
        Self {
            inner: Arc::new(Shared {
                name,
                config,
                state: Mutex::new(BreakerState {
                    state: CircuitState::Closed,
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                    last_failure: None,
                    half_open_in_flight: 0,
                }),
                rejected: AtomicU64::new(0),
                opened: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Run `op` through the breaker
    ///
    /// Rejected calls never run `op` and return `E::from(CircuitOpen)`.
    /// Otherwise the outcome of `op` is recorded and returned unchanged.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpen>,
    {
        self.execute_with(op, |_| true).await
    }

    /// Like [`execute`](Self::execute), but errors for which `is_failure`
    /// returns false are neither failures nor successes
    ///
    /// Lets callers keep client-side errors (bad params, not connected)
    /// from tripping a breaker that guards the remote side.
    pub async fn execute_with<T, E, F, Fut, P>(&self, op: F, is_failure: P) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpen>,
        P: Fn(&E) -> bool,
    {
        let permit = match self.try_acquire() {
            Some(p) => p,
            None => {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(E::from(CircuitOpen {
                    name: self.inner.name.clone(),
                }));
            }
        };

        let result = op().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if is_failure(e) => self.record_failure(),
            Err(_) => {}
        }
        drop(permit);
        result
    }

    fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut st = self.inner.state.lock();

        if st.state == CircuitState::Open {
            let expired = st
                .last_failure
                .map(|t| t.elapsed() > self.inner.config.timeout)
                .unwrap_or(true);
            if !expired {
                return None;
            }
            st.state = CircuitState::HalfOpen;
            st.consecutive_successes = 0;
            st.half_open_in_flight = 0;
            info!(breaker = %self.inner.name, "circuit breaker transitioning to HALF_OPEN");
        }

        match st.state {
            CircuitState::Closed => Some(Permit {
                breaker: self,
                probe: false,
            }),
            CircuitState::HalfOpen
                if st.half_open_in_flight < self.inner.config.half_open_attempts =>
            {
                st.half_open_in_flight += 1;
                Some(Permit {
                    breaker: self,
                    probe: true,
                })
            }
            _ => None,
        }
    }

    fn record_success(&self) {
        let mut st = self.inner.state.lock();
        match st.state {
            CircuitState::Closed => {
                st.consecutive_failures = st.consecutive_failures.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                st.consecutive_successes += 1;
                if st.consecutive_successes >= self.inner.config.required_successes() {
                    st.state = CircuitState::Closed;
                    st.consecutive_failures = 0;
                    st.consecutive_successes = 0;
                    info!(
                        breaker = %self.inner.name,
                        "circuit breaker CLOSED - resource recovered"
                    );
                }
            }
            // Late success of a call admitted before the trip
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut st = self.inner.state.lock();
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        st.consecutive_successes = 0;
        st.last_failure = Some(Instant::now());

        match st.state {
            CircuitState::Closed
                if st.consecutive_failures >= self.inner.config.failure_threshold =>
            {
                st.state = CircuitState::Open;
                self.inner.opened.fetch_add(1, Ordering::Relaxed);
                warn!(
                    breaker = %self.inner.name,
                    failures = st.consecutive_failures,
                    "circuit breaker TRIPPED - transitioning to OPEN"
                );
            }
            CircuitState::HalfOpen => {
                st.state = CircuitState::Open;
                self.inner.opened.fetch_add(1, Ordering::Relaxed);
                warn!(breaker = %self.inner.name, "probe failed - circuit breaker re-OPENED");
            }
            _ => {}
        }
    }

    /// Get current state
    ///
    /// An Open breaker whose timeout has elapsed still reports Open until
    /// the next `execute` moves it to HalfOpen.
    pub fn state(&self) -> CircuitState {
        self.inner.state.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.state.lock().consecutive_failures
    }

    pub fn rejected_count(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let st = self.inner.state.lock();
        CircuitSnapshot {
            state: st.state,
            consecutive_failures: st.consecutive_failures,
            consecutive_successes: st.consecutive_successes,
            since_last_failure_ms: st.last_failure.map(|t| t.elapsed().as_millis() as u64),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            opened: self.inner.opened.load(Ordering::Relaxed),
        }
    }

    /// Reset circuit breaker to Closed state
    pub fn reset(&self) {
        info!(breaker = %self.inner.name, "circuit breaker manually reset to CLOSED");
        let mut st = self.inner.state.lock();
        st.state = CircuitState::Closed;
        st.consecutive_failures = 0;
        st.consecutive_successes = 0;
        st.last_failure = None;
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

/// One breaker per named resource
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            default_config,
        }
    }

    /// Breaker for `name`, created with the default config on first use
    pub fn get(&self, name: &str) -> CircuitBreaker {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, self.default_config.clone()))
            .clone()
    }

    /// Breaker for `name` with an explicit config (ignored if it exists)
    pub fn get_with(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, config))
            .clone()
    }

    /// State of every breaker, sorted by name
    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().state()))
            .collect()
    }

    pub fn snapshots(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
