//! JSON-RPC 2.0 upstream: HTTP for calls, WebSocket for pub/sub
//!
//! Channel keys map to the provider's subscription methods:
//!
//! | key              | subscribe          | unsubscribe          |
//! |------------------|--------------------|----------------------|
//! | `logs:<addr>`    | `logsSubscribe`    | `logsUnsubscribe`    |
//! | `account:<addr>` | `accountSubscribe` | `accountUnsubscribe` |
//! | `program:<addr>` | `programSubscribe` | `programUnsubscribe` |
//! | `slot`           | `slotSubscribe`    | `slotUnsubscribe`    |
//!
//! The WebSocket side runs two tasks per session: a writer that also sends
//! pings, and a reader that resolves pending requests by id and forwards
//! notifications by subscription id. When the socket ends, every pending
//! request fails with `Closed` and the manager gets `UpstreamEvent::Closed`.

use super::{rpc_error, UpstreamConnector, UpstreamEvent, UpstreamLink, UpstreamSession};
use crate::core::errors::{SidecarError, SidecarResult};
use crate::core::types::{ChannelKey, ChannelKind, UpstreamId};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Endpoints and timing for [`JsonRpcConnector`]
#[derive(Debug, Clone)]
pub struct JsonRpcConfig {
    pub rpc_url: Url,
    pub ws_url: Option<Url>,
    /// Commitment level sent with subscriptions
    pub commitment: String,
    /// Method probed on connect to prove the HTTP endpoint works
    pub health_method: String,
    /// Timeout for connect and for pub/sub control requests
    pub request_timeout: Duration,
    pub ping_interval: Duration,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Any frame the provider may send: a response (has `id`) or a
/// notification (has `method` and `params`)
#[derive(Debug, Deserialize)]
struct RpcFrame {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<NotificationParams>,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    subscription: Value,
    #[serde(default)]
    result: Value,
}

impl RpcFrame {
    fn into_result(self) -> SidecarResult<Value> {
        match (self.error, self.result) {
            (Some(e), _) => Err(rpc_error(e.code, e.message)),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Subscribe method and params for a channel key
fn subscribe_request(channel: &ChannelKey, commitment: &str) -> (&'static str, Value) {
    let target = channel.target().unwrap_or_default();
    match channel.kind() {
        ChannelKind::Logs => (
            "logsSubscribe",
            json!([{ "mentions": [target] }, { "commitment": commitment }]),
        ),
        ChannelKind::Account => (
            "accountSubscribe",
            json!([target, { "encoding": "base64", "commitment": commitment }]),
        ),
        ChannelKind::Program => (
            "programSubscribe",
            json!([target, { "encoding": "base64", "commitment": commitment }]),
        ),
        ChannelKind::Slot => ("slotSubscribe", json!([])),
    }
}

fn unsubscribe_method(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Logs => "logsUnsubscribe",
        ChannelKind::Account => "accountUnsubscribe",
        ChannelKind::Program => "programUnsubscribe",
        ChannelKind::Slot => "slotUnsubscribe",
    }
}

/// Upstream ids are numbers on the wire; send them back the same way
fn upstream_id_param(id: &UpstreamId) -> Value {
    id.0
        .parse::<u64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(id.0.clone()))
}

fn map_reqwest_error(method: &str, timeout: Duration, e: reqwest::Error) -> SidecarError {
    if e.is_timeout() {
        SidecarError::Timeout {
            method: method.to_string(),
            elapsed: timeout,
        }
    } else if e.is_decode() {
        SidecarError::Protocol(e.to_string())
    } else {
        SidecarError::Connection(e.to_string())
    }
}

/// Connector for JSON-RPC providers
pub struct JsonRpcConnector {
    config: JsonRpcConfig,
    http: reqwest::Client,
}

impl JsonRpcConnector {
    pub fn new(config: JsonRpcConfig) -> SidecarResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| SidecarError::Config(format!("http client: {}", e)))?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl UpstreamConnector for JsonRpcConnector {
    fn has_streaming(&self) -> bool {
        self.config.ws_url.is_some()
    }

    async fn connect(&self) -> SidecarResult<UpstreamLink> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let http = HttpEndpoint {
            client: self.http.clone(),
            url: self.config.rpc_url.clone(),
            next_id: AtomicU64::new(1),
        };
        http.call(
            &self.config.health_method,
            Value::Null,
            self.config.request_timeout,
        )
        .await?;
        debug!(url = %self.config.rpc_url, "http endpoint healthy");

        let ws = match &self.config.ws_url {
            Some(url) => {
                Some(WsEndpoint::connect(url, self.config.ping_interval, events_tx).await?)
            }
            None => None,
        };

        info!(
            rpc = %self.config.rpc_url,
            streaming = ws.is_some(),
            "upstream session established"
        );

        Ok(UpstreamLink {
            session: Arc::new(JsonRpcSession {
                http,
                ws,
                commitment: self.config.commitment.clone(),
                request_timeout: self.config.request_timeout,
            }),
            events: events_rx,
        })
    }
}

struct HttpEndpoint {
    client: reqwest::Client,
    url: Url,
    next_id: AtomicU64,
}

impl HttpEndpoint {
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> SidecarResult<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .client
            .post(self.url.clone())
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_reqwest_error(method, timeout, e))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SidecarError::RateLimited(format!("http 429 on {}", method)));
        }
        if !status.is_success() {
            return Err(SidecarError::Connection(format!("http {} on {}", status, method)));
        }

        let frame: RpcFrame = response
            .json()
            .await
            .map_err(|e| map_reqwest_error(method, timeout, e))?;
        frame.into_result()
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<SidecarResult<Value>>>>>;

struct WsEndpoint {
    out_tx: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsEndpoint {
    async fn connect(
        url: &Url,
        ping_interval: Duration,
        events_tx: mpsc::UnboundedSender<UpstreamEvent>,
    ) -> SidecarResult<Self> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SidecarError::Connection(format!("websocket connect: {}", e)))?;
        let (mut write, mut read) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(ping_interval);
            ping.tick().await;
            loop {
                tokio::select! {
                    msg = out_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let is_close = matches!(msg, Message::Close(_));
                        if let Err(e) = write.send(msg).await {
                            warn!(error = %e, "websocket send failed");
                            break;
                        }
                        if is_close {
                            break;
                        }
                    }
                    _ = ping.tick() => {
                        if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                            warn!(error = %e, "websocket ping failed");
                            break;
                        }
                    }
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_frame(text.as_str(), &reader_pending, &events_tx);
                    }
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => dispatch_frame(text, &reader_pending, &events_tx),
                        Err(_) => warn!("ignoring non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break format!("closed by peer: {:?}", frame);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("websocket error: {}", e),
                    None => break "websocket stream ended".to_string(),
                }
            };

            reader_closed.store(true, Ordering::Release);
            fail_pending(&reader_pending, &reason);
            let _ = events_tx.send(UpstreamEvent::Closed { reason });
        });

        Ok(Self {
            out_tx,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> SidecarResult<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SidecarError::Closed("websocket".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.out_tx.send(Message::Text(text.into())).is_err() {
            self.pending.lock().remove(&id);
            return Err(SidecarError::Closed("websocket writer".into()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SidecarError::Closed("websocket".into())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(SidecarError::Timeout {
                    method: method.to_string(),
                    elapsed: timeout,
                })
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.out_tx.send(Message::Close(None));
        fail_pending(&self.pending, "session closed");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn fail_pending(pending: &Pending, reason: &str) {
    let waiters: Vec<_> = pending.lock().drain().collect();
    for (_, tx) in waiters {
        let _ = tx.send(Err(SidecarError::Closed(reason.to_string())));
    }
}

fn dispatch_frame(
    text: &str,
    pending: &Pending,
    events_tx: &mpsc::UnboundedSender<UpstreamEvent>,
) {
    let frame: RpcFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "unparseable upstream frame");
            return;
        }
    };

    if let Some(id) = frame.id.as_ref().and_then(Value::as_u64) {
        let waiter = pending.lock().remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(frame.into_result());
            }
            // Timed out and already removed
            None => trace!(id, "response for unknown request"),
        }
        return;
    }

    if frame
        .method
        .as_deref()
        .map(|m| m.ends_with("Notification"))
        .unwrap_or(false)
    {
        if let Some(params) = frame.params {
            match UpstreamId::from_json(&params.subscription) {
                Some(subscription) => {
                    let _ = events_tx.send(UpstreamEvent::Notification {
                        subscription,
                        data: params.result,
                    });
                }
                None => warn!("notification without subscription id"),
            }
        }
    }
}

struct JsonRpcSession {
    http: HttpEndpoint,
    ws: Option<WsEndpoint>,
    commitment: String,
    request_timeout: Duration,
}

impl JsonRpcSession {
    fn ws(&self, channel: &ChannelKey) -> SidecarResult<&WsEndpoint> {
        self.ws
            .as_ref()
            .ok_or_else(|| {
                SidecarError::subscription(channel.to_string(), "streaming endpoint not configured")
            })
    }
}

#[async_trait]
impl UpstreamSession for JsonRpcSession {
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> SidecarResult<Value> {
        self.http.call(method, params, timeout).await
    }

    async fn subscribe(&self, channel: &ChannelKey) -> SidecarResult<UpstreamId> {
        let ws = self.ws(channel)?;
        let (method, params) = subscribe_request(channel, &self.commitment);
        let result = ws
            .request(method, params, self.request_timeout)
            .await
            .map_err(|e| match e {
                SidecarError::Rpc { message, .. } => {
                    SidecarError::subscription(channel.to_string(), message)
                }
                other => other,
            })?;

        UpstreamId::from_json(&result).ok_or_else(|| {
            SidecarError::Protocol(format!("{} returned non-id result: {}", method, result))
        })
    }

    async fn unsubscribe(&self, channel: &ChannelKey, id: &UpstreamId) -> SidecarResult<()> {
        let ws = self.ws(channel)?;
        ws.request(
            unsubscribe_method(channel.kind()),
            json!([upstream_id_param(id)]),
            self.request_timeout,
        )
        .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(ws) = &self.ws {
            ws.close();
        }
    }
}

impl Drop for JsonRpcSession {
    fn drop(&mut self) {
        if let Some(ws) = &self.ws {
            ws.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

    #[test]
    fn test_subscribe_request_mapping() {
        let (method, params) = subscribe_request(&ChannelKey::logs(ADDR).unwrap(), "confirmed");
        assert_eq!(method, "logsSubscribe");
        assert_eq!(params[0]["mentions"][0], ADDR);
        assert_eq!(params[1]["commitment"], "confirmed");

        let (method, params) = subscribe_request(&ChannelKey::parse("slot").unwrap(), "confirmed");
        assert_eq!(method, "slotSubscribe");
        assert_eq!(params, json!([]));

        assert_eq!(unsubscribe_method(ChannelKind::Account), "accountUnsubscribe");
    }

    #[test]
    fn test_upstream_id_param_prefers_number() {
        assert_eq!(upstream_id_param(&UpstreamId("42".into())), json!(42));
        assert_eq!(upstream_id_param(&UpstreamId("abc".into())), json!("abc"));
    }

    #[test]
    fn test_request_omits_null_params() {
        let text = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "getHealth",
            params: Value::Null,
        })
        .unwrap();
        assert!(!text.contains("params"));
    }

    #[tokio::test]
    async fn test_dispatch_resolves_pending_and_notifications() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().insert(7, tx);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        dispatch_frame(r#"{"jsonrpc":"2.0","id":7,"result":99}"#, &pending, &events_tx);
        assert_eq!(rx.await.unwrap(), Ok(json!(99)));
        assert!(pending.lock().is_empty());

        dispatch_frame(
            r#"{"jsonrpc":"2.0","method":"logsNotification","params":{"subscription":99,"result":{"value":{"signature":"s"}}}}"#,
            &pending,
            &events_tx,
        );
        assert_eq!(
            events_rx.recv().await.unwrap(),
            UpstreamEvent::Notification {
                subscription: UpstreamId("99".into()),
                data: json!({"value": {"signature": "s"}}),
            }
        );
    }

    #[tokio::test]
    async fn test_dispatch_maps_rate_limit_error() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().insert(1, tx);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        dispatch_frame(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32005,"message":"too many requests"}}"#,
            &pending,
            &events_tx,
        );
        assert_eq!(
            rx.await.unwrap(),
            Err(SidecarError::RateLimited("too many requests".into()))
        );
    }
}
