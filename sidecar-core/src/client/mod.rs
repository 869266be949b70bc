//! Worker-side client for the broker
//!
//! Holds one call connection and one event connection to the sidecar.
//! Calls are correlated by a generated id and time out on their own.
//! Subscribe and unsubscribe wait for the broker's ack, which arrives in
//! request order. When either connection drops, pending calls fail with
//! `Closed`, the client reconnects with backoff and resubscribes every
//! channel it held.

use crate::broker::protocol::{
    encode_line, CallRequest, CallResponse, EventFrame, EventPush, EventReply, EventRequest,
};
use crate::core::errors::{SidecarError, SidecarResult};
use crate::resilience::{BackoffPolicy, ExponentialBackoff};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Worker client settings
#[derive(Debug, Clone)]
pub struct WorkerClientConfig {
    pub call_addr: SocketAddr,
    pub event_addr: SocketAddr,
    /// Bound on each call and each subscribe/unsubscribe ack
    pub request_timeout: Duration,
    pub reconnect: BackoffPolicy,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for WorkerClientConfig {
    fn default() -> Self {
        Self {
            call_addr: SocketAddr::from(([127, 0, 0, 1], 7401)),
            event_addr: SocketAddr::from(([127, 0, 0, 1], 7402)),
            request_timeout: Duration::from_secs(30),
            reconnect: BackoffPolicy::default(),
            max_reconnect_attempts: None,
        }
    }
}

/// Events for one channel, as delivered to this worker
pub struct EventSubscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<EventPush>,
}

impl EventSubscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next event; `None` once the client is closed or the channel was
    /// unsubscribed
    pub async fn recv(&mut self) -> Option<EventPush> {
        self.rx.recv().await
    }
}

struct Link {
    call_tx: mpsc::UnboundedSender<String>,
    event_tx: mpsc::UnboundedSender<String>,
}

struct LinkTasks {
    call_reader: JoinHandle<()>,
    event_reader: JoinHandle<()>,
}

impl LinkTasks {
    fn abort(&self) {
        self.call_reader.abort();
        self.event_reader.abort();
    }
}

struct ClientInner {
    config: WorkerClientConfig,
    link: Mutex<Option<Link>>,
    pending: DashMap<String, oneshot::Sender<CallResponse>>,
    acks: Mutex<VecDeque<oneshot::Sender<EventReply>>>,
    listeners: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<EventPush>>>>,
    channels: Mutex<BTreeSet<String>>,
    connected: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

/// Client handle; clones share the connections
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<ClientInner>,
}

impl WorkerClient {
    /// Connect to the broker and start the reconnect supervisor
    pub async fn connect(config: WorkerClientConfig) -> SidecarResult<Self> {
        let (connected, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            config,
            link: Mutex::new(None),
            pending: DashMap::new(),
            acks: Mutex::new(VecDeque::new()),
            listeners: Mutex::new(HashMap::new()),
            channels: Mutex::new(BTreeSet::new()),
            connected,
            shutdown,
        });

        let tasks = ClientInner::open_link(&inner).await?;
        info!(
            call = %inner.config.call_addr,
            event = %inner.config.event_addr,
            "connected to broker"
        );
        tokio::spawn(ClientInner::supervise(inner.clone(), tasks));
        Ok(Self { inner })
    }

    /// Call an upstream method through the broker
    pub async fn call(&self, method: &str, params: Value) -> SidecarResult<Value> {
        self.call_with_timeout(method, params, self.inner.config.request_timeout)
            .await
    }

    /// Call with an explicit timeout, also forwarded to the broker
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> SidecarResult<Value> {
        let inner = &self.inner;
        let id = Uuid::new_v4().to_string();
        let line = encode_line(&CallRequest {
            id: Value::String(id.clone()),
            method: method.to_string(),
            params,
            timeout_ms: Some(timeout.as_millis() as u64),
        })?;

        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id.clone(), tx);

        let sent = inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.call_tx.send(line).is_ok())
            .unwrap_or(false);
        if !sent {
            inner.pending.remove(&id);
            return Err(broker_unreachable());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(_)) => Err(SidecarError::Closed("broker connection lost".into())),
            Err(_) => {
                inner.pending.remove(&id);
                Err(SidecarError::Timeout {
                    method: method.to_string(),
                    elapsed: timeout,
                })
            }
        }
    }

    /// Subscribe to `channel`; resolves once the broker acked
    pub async fn subscribe(&self, channel: &str) -> SidecarResult<EventSubscription> {
        let inner = &self.inner;
        let (tx, rx) = mpsc::unbounded_channel();

        // Listen first so a push right behind the ack is not lost
        inner
            .listeners
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx.clone());

        let already = inner.channels.lock().contains(channel);
        if !already {
            let request = EventRequest::Subscribe {
                channel: channel.to_string(),
                params: Value::Null,
            };
            if let Err(e) = inner.request(request).await {
                if let Some(senders) = inner.listeners.lock().get_mut(channel) {
                    senders.retain(|other| !other.same_channel(&tx));
                }
                return Err(e);
            }
            inner.channels.lock().insert(channel.to_string());
        }

        debug!(channel, "subscribed");
        Ok(EventSubscription {
            channel: channel.to_string(),
            rx,
        })
    }

    /// Drop every local listener of `channel` and leave it on the broker
    pub async fn unsubscribe(&self, channel: &str) -> SidecarResult<()> {
        let inner = &self.inner;
        inner.listeners.lock().remove(channel);
        if !inner.channels.lock().remove(channel) {
            return Ok(());
        }
        inner
            .request(EventRequest::Unsubscribe {
                channel: channel.to_string(),
                params: Value::Null,
            })
            .await
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Channels this client holds (resubscribed after a reconnect)
    pub fn channels(&self) -> Vec<String> {
        self.inner.channels.lock().iter().cloned().collect()
    }

    /// Stop the supervisor and drop both connections
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
    }
}

fn broker_unreachable() -> SidecarError {
    SidecarError::NotConnected {
        state: "broker unreachable".into(),
    }
}

impl ClientInner {
    async fn open_link(self: &Arc<Self>) -> SidecarResult<LinkTasks> {
        let call_addr = self.config.call_addr;
        let event_addr = self.config.event_addr;
        let call = TcpStream::connect(call_addr).await.map_err(|e| {
            SidecarError::Connection(format!("call channel {}: {}", call_addr, e))
        })?;
        let event = TcpStream::connect(event_addr).await.map_err(|e| {
            SidecarError::Connection(format!("event channel {}: {}", event_addr, e))
        })?;

        let (call_read, call_write) = call.into_split();
        let (event_read, event_write) = event.into_split();
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(call_write, call_rx));
        tokio::spawn(write_lines(event_write, event_rx));

        *self.link.lock() = Some(Link { call_tx, event_tx });
        self.connected.send_replace(true);

        Ok(LinkTasks {
            call_reader: tokio::spawn(Self::read_calls(self.clone(), call_read)),
            event_reader: tokio::spawn(Self::read_events(self.clone(), event_read)),
        })
    }

    async fn read_calls(self: Arc<Self>, read: OwnedReadHalf) {
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let response: CallResponse = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "unreadable call response");
                    continue;
                }
            };
            let key = match &response.id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match self.pending.remove(&key) {
                Some((_, tx)) => {
                    let _ = tx.send(response);
                }
                None => debug!(id = %key, "response for unknown or timed-out call"),
            }
        }
    }

    async fn read_events(self: Arc<Self>, read: OwnedReadHalf) {
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<EventFrame>(&line) {
                Ok(EventFrame::Reply(reply)) => {
                    let waiter = self.acks.lock().pop_front();
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(reply);
                        }
                        None => warn!(?reply, "unsolicited event reply"),
                    }
                }
                Ok(EventFrame::Push(push)) => {
                    let mut listeners = self.listeners.lock();
                    if let Some(senders) = listeners.get_mut(&push.channel) {
                        senders.retain(|tx| tx.send(push.clone()).is_ok());
                    }
                }
                Err(e) => warn!(error = %e, "unreadable event frame"),
            }
        }
    }

    /// Send an event request and wait for its ack
    async fn request(&self, request: EventRequest) -> SidecarResult<()> {
        let line = encode_line(&request)?;
        let (tx, rx) = oneshot::channel();
        {
            // Queue order must match send order
            let mut acks = self.acks.lock();
            let sent = self
                .link
                .lock()
                .as_ref()
                .map(|link| link.event_tx.send(line).is_ok())
                .unwrap_or(false);
            if !sent {
                return Err(broker_unreachable());
            }
            acks.push_back(tx);
        }

        let reply = match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(SidecarError::Closed("broker connection lost".into())),
            Err(_) => {
                return Err(SidecarError::Timeout {
                    method: "event request".into(),
                    elapsed: self.config.request_timeout,
                })
            }
        };

        match reply {
            EventReply::Subscribed { .. } | EventReply::Unsubscribed { .. } => Ok(()),
            EventReply::Error {
                error, error_kind, ..
            } => Err(SidecarError::from_wire(&error_kind, &error)),
        }
    }

    /// Forget the dead link and fail everything waiting on it
    fn on_disconnect(&self) {
        self.link.lock().take();
        self.connected.send_replace(false);
        let pending: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in pending {
            // Dropping the sender wakes the caller with `Closed`
            self.pending.remove(&id);
        }
        self.acks.lock().clear();
    }

    async fn resubscribe(&self) {
        let channels: Vec<String> = self.channels.lock().iter().cloned().collect();
        for channel in channels {
            let request = EventRequest::Subscribe {
                channel: channel.clone(),
                params: Value::Null,
            };
            match self.request(request).await {
                Ok(()) => debug!(channel = %channel, "resubscribed"),
                Err(e) => error!(channel = %channel, error = %e, "resubscribe failed"),
            }
        }
    }

    async fn supervise(inner: Arc<Self>, mut tasks: LinkTasks) {
        let mut shutdown = inner.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = &mut tasks.call_reader => {}
                _ = &mut tasks.event_reader => {}
                _ = shutdown.wait_for(|stop| *stop) => {
                    tasks.abort();
                    inner.on_disconnect();
                    inner.listeners.lock().clear();
                    info!("worker client closed");
                    return;
                }
            }
            tasks.abort();
            inner.on_disconnect();
            warn!("lost connection to broker, reconnecting");

            let mut backoff = ExponentialBackoff::new(
                inner.config.reconnect.clone(),
                inner.config.max_reconnect_attempts,
            );
            tasks = loop {
                let Some(delay) = backoff.next_delay() else {
                    error!(attempts = backoff.attempt_number(), "giving up on broker");
                    inner.listeners.lock().clear();
                    return;
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.wait_for(|stop| *stop) => {
                        inner.listeners.lock().clear();
                        return;
                    }
                }
                match Self::open_link(&inner).await {
                    Ok(tasks) => break tasks,
                    Err(e) => debug!(
                        attempt = backoff.attempt_number(),
                        error = %e,
                        "broker reconnect failed"
                    ),
                }
            };

            info!(attempts = backoff.attempt_number(), "reconnected to broker");
            inner.resubscribe().await;
        }
    }
}

async fn write_lines(mut write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if write.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = write.shutdown().await;
}
