//! Resilience toolkit for remote calls
//!
//! - Exponential backoff with jitter, rate-limit aware
//! - Retry with pluggable error classification
//! - Circuit breaker per named resource
//! - Dead-letter store with bounded re-drive
//! - Windowed deduplication
//! - Panic containment for foreign callbacks

pub mod backoff;
pub mod circuit_breaker;
pub mod compose;
pub mod dead_letter;
pub mod dedup;
pub mod panic;
pub mod retry;

pub use backoff::{compute_delay, BackoffPolicy, ExponentialBackoff};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitOpen, CircuitSnapshot,
    CircuitState,
};
pub use compose::{with_circuit_breaker, with_dead_letter, with_retry};
pub use dead_letter::{
    DeadLetterConfig, DeadLetterStats, DeadLetterStore, MaintenanceSchedule, RedriveOutcome,
    RedriveReport,
};
pub use dedup::{Deduplicator, Seen};
pub use panic::{contain, install_panic_hook, panic_message};
pub use retry::{
    classify_sidecar_error, retry_with_backoff, ErrorClass, ErrorClassifier, RetryAttempt,
};
