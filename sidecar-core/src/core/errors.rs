//! Error taxonomy for the sidecar
//!
//! Every failure that crosses a component boundary is a [`SidecarError`].
//! Each variant has a stable [`SidecarError::kind`] string so the broker can
//! ship errors over the local transport and the worker client can rebuild
//! the typed error on the other side.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the connection, broker and resilience layers
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SidecarError {
    /// Upstream unreachable, or reconnect attempts exhausted
    #[error("connection error: {0}")]
    Connection(String),

    /// Call attempted while not CONNECTED and queuing disabled or exhausted
    #[error("not connected (state: {state})")]
    NotConnected {
        /// Connection state observed when the call was rejected
        state: String,
    },

    /// Fast-fail from a circuit breaker
    #[error("circuit '{name}' is open")]
    CircuitOpen {
        /// Name of the protected resource
        name: String,
    },

    /// Dead-letter re-drive refused because the entry ran out of retries
    #[error("dead letter {id} exhausted {retry_count} retries")]
    MaxRetriesExceeded {
        /// Dead-letter entry id
        id: String,
        /// Retries already spent
        retry_count: u32,
    },

    /// Invalid channel or upstream rejected the subscription
    #[error("subscription error on '{channel}': {reason}")]
    Subscription {
        /// Channel key the request was for
        channel: String,
        /// Why it failed
        reason: String,
    },

    /// Call did not complete within its timeout
    #[error("'{method}' timed out after {elapsed:?}")]
    Timeout {
        /// Method name
        method: String,
        /// Timeout that elapsed
        elapsed: Duration,
    },

    /// Upstream returned a JSON-RPC error object
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// Error message
        message: String,
    },

    /// Upstream signalled rate limiting
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Malformed frame on a local or upstream transport
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Dead-letter entry does not exist
    #[error("dead letter {0} not found")]
    DeadLetterNotFound(String),

    /// Backing store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Component was closed
    #[error("closed: {0}")]
    Closed(String),

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(String),
}

/// Result alias used across the crate
pub type SidecarResult<T> = Result<T, SidecarError>;

impl SidecarError {
    /// Stable machine-readable name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            SidecarError::Connection(_) => "connection",
            SidecarError::NotConnected { .. } => "not_connected",
            SidecarError::CircuitOpen { .. } => "circuit_open",
            SidecarError::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            SidecarError::Subscription { .. } => "subscription",
            SidecarError::Timeout { .. } => "timeout",
            SidecarError::Rpc { .. } => "rpc",
            SidecarError::RateLimited(_) => "rate_limited",
            SidecarError::Protocol(_) => "protocol",
            SidecarError::DeadLetterNotFound(_) => "dead_letter_not_found",
            SidecarError::Storage(_) => "storage",
            SidecarError::Closed(_) => "closed",
            SidecarError::Config(_) => "config",
        }
    }

    /// Rebuild an error from a `kind` string and message received over the wire
    ///
    /// Structured fields that do not survive the trip are filled from the
    /// message text.
    pub fn from_wire(kind: &str, message: &str) -> Self {
        let message = message.to_string();
        match kind {
            "connection" => SidecarError::Connection(message),
            "not_connected" => SidecarError::NotConnected { state: message },
            "circuit_open" => SidecarError::CircuitOpen { name: message },
            "subscription" => SidecarError::Subscription {
                channel: String::new(),
                reason: message,
            },
            "timeout" => SidecarError::Timeout {
                method: message,
                elapsed: Duration::ZERO,
            },
            "rpc" => SidecarError::Rpc {
                code: 0,
                message,
            },
            "rate_limited" => SidecarError::RateLimited(message),
            "max_retries_exceeded" => SidecarError::MaxRetriesExceeded {
                id: message,
                retry_count: 0,
            },
            "dead_letter_not_found" => SidecarError::DeadLetterNotFound(message),
            "storage" => SidecarError::Storage(message),
            "closed" => SidecarError::Closed(message),
            "config" => SidecarError::Config(message),
            _ => SidecarError::Protocol(message),
        }
    }

    /// Subscription error helper
    pub fn subscription(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        SidecarError::Subscription {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for SidecarError {
    fn from(e: serde_json::Error) -> Self {
        SidecarError::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for SidecarError {
    fn from(e: std::io::Error) -> Self {
        SidecarError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_wire() {
        let errors = [
            SidecarError::Connection("refused".into()),
            SidecarError::NotConnected {
                state: "RECONNECTING".into(),
            },
            SidecarError::CircuitOpen {
                name: "upstream".into(),
            },
            SidecarError::RateLimited("slow down".into()),
        ];

        for err in errors {
            let rebuilt = SidecarError::from_wire(err.kind(), &err.to_string());
            assert_eq!(rebuilt.kind(), err.kind());
        }
    }

    #[test]
    fn test_unknown_kind_is_protocol() {
        let err = SidecarError::from_wire("gibberish", "boom");
        assert_eq!(err.kind(), "protocol");
    }

    #[test]
    fn test_display_mentions_channel() {
        let err = SidecarError::subscription("logs:abc", "rejected");
        let msg = format!("{}", err);
        assert!(msg.contains("logs:abc"));
        assert!(msg.contains("rejected"));
    }
}
