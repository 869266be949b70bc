//! Upstream provider seam
//!
//! The connection manager never touches a socket itself. It asks an
//! [`UpstreamConnector`] for a fresh [`UpstreamLink`] on every (re)connect:
//! a session handle for request/response and pub/sub control, plus a
//! receiver of notifications and close events from that one session.

pub mod jsonrpc;

pub use jsonrpc::{JsonRpcConfig, JsonRpcConnector};

use crate::core::errors::{SidecarError, SidecarResult};
use crate::core::types::{ChannelKey, UpstreamId};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Something that happened on an upstream session
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Pub/sub notification for an upstream subscription
    Notification { subscription: UpstreamId, data: Value },
    /// Transport closed or failed; the session is dead
    Closed { reason: String },
}

/// A live session and its event stream
pub struct UpstreamLink {
    pub session: Arc<dyn UpstreamSession>,
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,
}

/// Opens upstream sessions
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Whether a streaming endpoint is configured
    fn has_streaming(&self) -> bool;

    /// Establish both endpoints
    async fn connect(&self) -> SidecarResult<UpstreamLink>;
}

/// One established upstream session
#[async_trait]
pub trait UpstreamSession: Send + Sync {
    /// Request/response call, bounded by `timeout`
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> SidecarResult<Value>;

    /// Open the upstream subscription for `channel`
    async fn subscribe(&self, channel: &ChannelKey) -> SidecarResult<UpstreamId>;

    /// Cancel an upstream subscription
    async fn unsubscribe(&self, channel: &ChannelKey, id: &UpstreamId) -> SidecarResult<()>;

    /// Close both endpoints; idempotent
    async fn close(&self);
}

/// Map a JSON-RPC error object to a typed error
///
/// 429 and -32005 are how providers signal throttling.
pub fn rpc_error(code: i64, message: impl Into<String>) -> SidecarError {
    let message = message.into();
    match code {
        429 | -32005 => SidecarError::RateLimited(message),
        _ => SidecarError::Rpc { code, message },
    }
}
