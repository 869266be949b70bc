//! The connection manager
//!
//! Locking:
//! - `state`, `session`, `table` are parking_lot locks, never held across `.await`
//! - `op_lock` serializes operations that mutate the table around an
//!   upstream round-trip (subscribe, unsubscribe, replay, close)
//! - `reconnect_lock` keeps at most one reconnect loop running
//!
//! Every installed session gets a new epoch. The reader task of a session
//! ignores everything once the epoch moved on, so a stale session can
//! never flip the state of its successor.

use super::subscriptions::{Removal, SubscriptionTable};
use super::{CallPolicy, ConnectionConfig, ConnectionNotification, ConnectionStats};
use crate::core::connection_fsm::ConnectionState;
use crate::core::errors::{SidecarError, SidecarResult};
use crate::core::types::{ChannelKey, ConnectionStatus, SubscriberHandle, UpstreamId};
use crate::monitoring::MetricsRegistry;
use crate::resilience::{
    classify_sidecar_error, contain, retry_with_backoff, CircuitBreaker, ErrorClass, RetryAttempt,
};
use crate::upstream::{UpstreamConnector, UpstreamEvent, UpstreamLink, UpstreamSession};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback invoked with the payload of every notification on a channel
pub type NotificationHandler = Arc<dyn Fn(&Value) + Send + Sync>;

const NOTIFICATION_CAPACITY: usize = 64;

/// Upstream cancel that failed after the local subscriber was removed
///
/// Carries enough to retry the cancel later through
/// [`ConnectionManager::redrive_cancel`].
#[derive(Debug, Clone, PartialEq)]
pub struct CancelFailure {
    pub channel: ChannelKey,
    pub upstream_id: UpstreamId,
    /// Session epoch the upstream id belongs to
    pub epoch: u64,
    pub error: SidecarError,
}

impl CancelFailure {
    /// Dead-letter payload for this cancel
    pub fn to_payload(&self) -> Value {
        json!({
            "op": "unsubscribe",
            "channel": self.channel.to_string(),
            "upstreamId": self.upstream_id.0,
            "epoch": self.epoch,
        })
    }
}

impl std::fmt::Display for CancelFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to cancel upstream subscription {} for {}: {}",
            self.upstream_id, self.channel, self.error
        )
    }
}

impl std::error::Error for CancelFailure {}

/// Keeps a queued call counted while it waits
struct QueueSlot<'a>(&'a AtomicUsize);

impl<'a> QueueSlot<'a> {
    fn acquire(counter: &'a AtomicUsize, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(counter))
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Inner {
    connector: Arc<dyn UpstreamConnector>,
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    status_tx: watch::Sender<ConnectionStatus>,
    session: Mutex<Option<Arc<dyn UpstreamSession>>>,
    epoch: AtomicU64,
    table: Mutex<SubscriptionTable>,
    op_lock: tokio::sync::Mutex<()>,
    reconnect_lock: tokio::sync::Mutex<()>,
    notify_tx: broadcast::Sender<ConnectionNotification>,
    breaker: CircuitBreaker,
    queued: AtomicUsize,
    next_handle: AtomicU64,
    metrics: Option<MetricsRegistry>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

/// Owner of the single upstream session
///
/// Cloning is cheap; clones share the session, state and subscription
/// table.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn UpstreamConnector>, config: ConnectionConfig) -> Self {
        let breaker = CircuitBreaker::new(config.name.clone(), config.breaker.clone());
        Self::with_parts(connector, config, breaker, None)
    }

    /// Build with a shared breaker (usually from a registry) and metrics
    pub fn with_parts(
        connector: Arc<dyn UpstreamConnector>,
        config: ConnectionConfig,
        breaker: CircuitBreaker,
        metrics: Option<MetricsRegistry>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let state = ConnectionState::new(config.name.clone(), config.max_reconnect_attempts);

        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                state: Mutex::new(state),
                status_tx,
                session: Mutex::new(None),
                epoch: AtomicU64::new(0),
                table: Mutex::new(SubscriptionTable::default()),
                op_lock: tokio::sync::Mutex::new(()),
                reconnect_lock: tokio::sync::Mutex::new(()),
                notify_tx,
                breaker,
                queued: AtomicUsize::new(0),
                next_handle: AtomicU64::new(1),
                metrics,
                reader_task: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                started_at: Instant::now(),
            }),
        }
    }

    /// Open the upstream session
    ///
    /// A failed first attempt still returns the error; when reconnection is
    /// enabled recovery continues in the background.
    pub async fn connect(&self) -> SidecarResult<()> {
        let inner = &self.inner;

        if inner.config.require_streaming && !inner.connector.has_streaming() {
            let error =
                SidecarError::Connection("streaming endpoint required but not configured".into());
            inner.emit(ConnectionNotification::Error {
                error: error.clone(),
            });
            return Err(error);
        }

        let start = inner.transition(|state| match state {
            ConnectionState::Disconnected(d) => (d.begin().into(), Start::Begin),
            other => {
                let status = other.status();
                (other, Start::Existing(status))
            }
        });

        match start {
            Start::Existing(ConnectionStatus::Connected) => return Ok(()),
            Start::Existing(ConnectionStatus::Failed) => {
                return Err(SidecarError::Connection(
                    "connection failed; call reconnect()".into(),
                ))
            }
            Start::Existing(_) => return inner.wait_settled().await,
            Start::Begin => {}
        }

        info!(connection = %inner.config.name, "connecting to upstream");
        match inner.connector.connect().await {
            Ok(link) => {
                let _op = inner.op_lock.lock().await;
                if inner.establish(link).await {
                    inner.replay().await;
                    Ok(())
                } else {
                    Err(inner.not_connected())
                }
            }
            Err(error) => {
                let status = inner.transition(|state| match state {
                    ConnectionState::Connecting(c) => {
                        let next: ConnectionState = c.failed().into();
                        let status = next.status();
                        (next, status)
                    }
                    other => {
                        let status = other.status();
                        (other, status)
                    }
                });
                warn!(
                    connection = %inner.config.name,
                    error = %error,
                    next = %status,
                    "initial connect failed"
                );
                inner.emit(ConnectionNotification::Error {
                    error: error.clone(),
                });
                if status == ConnectionStatus::Reconnecting {
                    Inner::spawn_reconnect(inner);
                }
                Err(error)
            }
        }
    }

    /// Request/response call to the upstream
    ///
    /// Runs under the upstream breaker and the call retry policy. `timeout`
    /// bounds each attempt (default: `call_timeout`).
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> SidecarResult<Value> {
        let inner = &self.inner;
        let timeout = timeout.unwrap_or(inner.config.call_timeout);
        let started = Instant::now();

        let classify = |e: &SidecarError| {
            if inner.status() == ConnectionStatus::Failed {
                ErrorClass::Permanent
            } else {
                classify_sidecar_error(e)
            }
        };
        let on_retry = |attempt: &RetryAttempt<'_, SidecarError>| {
            debug!(
                method,
                attempt = attempt.attempt,
                delay_ms = attempt.delay.as_millis() as u64,
                error = %attempt.error,
                "retrying upstream call"
            );
        };

        let result = inner
            .breaker
            .execute_with(
                || {
                    retry_with_backoff(&inner.config.call_retry, &classify, on_retry, || {
                        inner.call_once(method, params.clone(), timeout)
                    })
                },
                counts_against_upstream,
            )
            .await;

        if let Some(metrics) = &inner.metrics {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) => e.kind(),
            };
            let m = metrics.connection();
            m.calls_total.with_label_values(&[method, outcome]).inc();
            m.call_duration_seconds
                .with_label_values(&[method])
                .observe(started.elapsed().as_secs_f64());
        }
        result
    }

    /// Subscribe `handler` to `channel`
    ///
    /// The first subscriber of a key opens the upstream subscription; later
    /// ones only join the local set.
    pub async fn subscribe<H>(
        &self,
        channel: ChannelKey,
        handler: H,
    ) -> SidecarResult<SubscriberHandle>
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        let inner = &self.inner;
        let handler: NotificationHandler = Arc::new(handler);
        let _op = inner.op_lock.lock().await;

        let status = inner.status();
        if matches!(status, ConnectionStatus::Disconnected | ConnectionStatus::Failed) {
            return Err(SidecarError::NotConnected {
                state: status.as_str().to_string(),
            });
        }

        let handle = SubscriberHandle(inner.next_handle.fetch_add(1, Ordering::SeqCst));
        if inner.table.lock().add_subscriber(&channel, handle, handler.clone()) {
            debug!(channel = %channel, handle = %handle, "joined existing subscription");
            return Ok(handle);
        }

        let session = match status {
            ConnectionStatus::Connected => inner.current_session(),
            _ => None,
        };
        let upstream = match session {
            Some(session) => {
                let result = inner
                    .breaker
                    .execute_with(|| session.subscribe(&channel), counts_against_upstream)
                    .await;
                match result {
                    Ok(id) => Some(id),
                    // Session died under us; the replay will establish it
                    Err(SidecarError::Closed(_) | SidecarError::Connection(_))
                        if inner.status().is_transient() =>
                    {
                        None
                    }
                    Err(error) => {
                        warn!(channel = %channel, error = %error, "upstream subscribe failed");
                        return Err(error);
                    }
                }
            }
            None => None,
        };

        info!(
            channel = %channel,
            handle = %handle,
            upstream_id = ?upstream.as_ref().map(|id| id.0.as_str()),
            "subscription created"
        );
        inner.table.lock().insert(channel, upstream, handle, handler);
        inner.update_subscription_gauge();
        Ok(handle)
    }

    /// Remove a local subscriber; unknown handles are ignored
    ///
    /// The local entry is always gone when this returns. An `Err` means the
    /// upstream cancel failed and can be retried with
    /// [`redrive_cancel`](Self::redrive_cancel).
    pub async fn unsubscribe(&self, handle: SubscriberHandle) -> Result<(), CancelFailure> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;

        let removal = inner.table.lock().remove_subscriber(handle);
        let (channel, upstream_id) = match removal {
            Removal::UnknownHandle | Removal::Kept => return Ok(()),
            Removal::Emptied(channel, upstream) => {
                inner.update_subscription_gauge();
                info!(channel = %channel, "last subscriber gone, cancelling upstream");
                match upstream {
                    Some(id) => (channel, id),
                    None => return Ok(()),
                }
            }
        };

        let epoch = inner.epoch.load(Ordering::SeqCst);
        let Some(session) = inner.current_session() else {
            return Ok(());
        };
        match session.unsubscribe(&channel, &upstream_id).await {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!(
                    channel = %channel,
                    upstream_id = %upstream_id,
                    error = %error,
                    "upstream cancel failed"
                );
                Err(CancelFailure {
                    channel,
                    upstream_id,
                    epoch,
                    error,
                })
            }
        }
    }

    /// Retry a cancel recorded by [`CancelFailure::to_payload`]
    ///
    /// Succeeds without a round-trip when the session that issued the id
    /// is gone or the key is subscribed again under the same id.
    pub async fn redrive_cancel(&self, payload: Value) -> SidecarResult<()> {
        let inner = &self.inner;
        if payload.get("op").and_then(Value::as_str) != Some("unsubscribe") {
            return Err(SidecarError::Protocol(format!(
                "unsupported dead-letter payload: {}",
                payload
            )));
        }
        let channel = payload
            .get("channel")
            .and_then(Value::as_str)
            .ok_or_else(|| SidecarError::Protocol("payload missing channel".into()))
            .and_then(ChannelKey::parse)?;
        let upstream_id = payload
            .get("upstreamId")
            .and_then(UpstreamId::from_json)
            .ok_or_else(|| SidecarError::Protocol("payload missing upstreamId".into()))?;
        let epoch = payload
            .get("epoch")
            .and_then(Value::as_u64)
            .ok_or_else(|| SidecarError::Protocol("payload missing epoch".into()))?;

        let _op = inner.op_lock.lock().await;
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            debug!(channel = %channel, "cancel belongs to a previous session");
            return Ok(());
        }
        if inner.table.lock().upstream_id(&channel).as_ref() == Some(&upstream_id) {
            return Ok(());
        }
        let session = inner.current_session().ok_or_else(|| inner.not_connected())?;
        session.unsubscribe(&channel, &upstream_id).await
    }

    /// Force RECONNECTING and run the reconnect loop to completion
    pub async fn reconnect(&self) -> SidecarResult<()> {
        let inner = &self.inner;

        inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(reader) = inner.reader_task.lock().take() {
            reader.abort();
        }
        let old = inner.session.lock().take();
        let previous = inner.transition(|state| {
            let previous = state.status();
            (state.force_reconnect(), previous)
        });
        if let Some(old) = old {
            old.close().await;
        }
        info!(connection = %inner.config.name, from = %previous, "manual reconnect");
        if previous == ConnectionStatus::Connected {
            inner.emit(ConnectionNotification::Disconnected {
                reason: "manual reconnect".into(),
            });
        }

        match Inner::run_reconnect(inner).await {
            ConnectionStatus::Connected => Ok(()),
            ConnectionStatus::Failed => Err(SidecarError::Connection(
                "reconnect attempts exhausted".into(),
            )),
            other => Err(SidecarError::NotConnected {
                state: other.as_str().to_string(),
            }),
        }
    }

    /// Cancel every subscription, close the session and go DISCONNECTED
    pub async fn close(&self) {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;

        if let Some(task) = inner.reconnect_task.lock().take() {
            task.abort();
        }
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(reader) = inner.reader_task.lock().take() {
            reader.abort();
        }

        let established = inner.table.lock().drain();
        let session = inner.session.lock().take();
        if let Some(session) = session {
            for (channel, id) in established {
                if let Err(error) = session.unsubscribe(&channel, &id).await {
                    debug!(channel = %channel, error = %error, "cancel during close failed");
                }
            }
            session.close().await;
        }

        let previous = inner.transition(|state| {
            let previous = state.status();
            (state.close(), previous)
        });
        inner.update_subscription_gauge();
        if previous != ConnectionStatus::Disconnected {
            info!(connection = %inner.config.name, "connection closed");
            inner.emit(ConnectionNotification::Disconnected {
                reason: "closed".into(),
            });
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Status updates; the receiver starts at the current status
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// `Connected`, `Disconnected` and `Error` notifications
    pub fn notifications(&self) -> broadcast::Receiver<ConnectionNotification> {
        self.inner.notify_tx.subscribe()
    }

    /// Breaker guarding upstream calls
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Channel keys on file
    pub fn active_subscriptions(&self) -> Vec<ChannelKey> {
        self.inner.table.lock().keys()
    }

    pub fn subscriber_count(&self, channel: &ChannelKey) -> usize {
        self.inner.table.lock().subscriber_count(channel)
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    pub fn stats(&self) -> ConnectionStats {
        let (status, data) = {
            let state = self.inner.state.lock();
            (state.status(), state.data().clone())
        };
        let (keys, handles) = {
            let table = self.inner.table.lock();
            (table.key_count(), table.handle_count())
        };
        ConnectionStats {
            status,
            disconnect_count: data.disconnect_count,
            reconnect_attempts: data.reconnect_attempts,
            successful_reconnects: data.successful_reconnects,
            current_attempt: data.attempt,
            uptime_ms: data.uptime().as_millis() as u64,
            active_subscriptions: keys,
            local_subscribers: handles,
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.inner.config.name)
            .field("status", &self.status())
            .finish()
    }
}

enum Start {
    Begin,
    Existing(ConnectionStatus),
}

enum Step {
    Attempt(u32),
    GaveUp,
    Done(ConnectionStatus),
}

/// Client-side and gate errors say nothing about upstream health
fn counts_against_upstream(error: &SidecarError) -> bool {
    classify_sidecar_error(error).is_retryable()
}

impl Inner {
    fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    fn not_connected(&self) -> SidecarError {
        SidecarError::NotConnected {
            state: self.status().as_str().to_string(),
        }
    }

    fn current_session(&self) -> Option<Arc<dyn UpstreamSession>> {
        self.session.lock().clone()
    }

    fn emit(&self, notification: ConnectionNotification) {
        // No receivers is fine
        let _ = self.notify_tx.send(notification);
    }

    /// Apply a state transition and publish the resulting status
    fn transition<R>(&self, f: impl FnOnce(ConnectionState) -> (ConnectionState, R)) -> R {
        let mut state = self.state.lock();
        let current = std::mem::replace(&mut *state, ConnectionState::new(String::new(), 0));
        let from = current.status();
        let (next, out) = f(current);
        *state = next;
        let to = state.status();
        self.status_tx.send_replace(to);
        drop(state);

        if from != to {
            debug!(connection = %self.config.name, %from, %to, "state transition");
        }
        if let Some(metrics) = &self.metrics {
            metrics.connection().state.set(to.as_gauge());
        }
        out
    }

    fn update_subscription_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            let keys = self.table.lock().key_count();
            metrics.connection().active_subscriptions.set(keys as i64);
        }
    }

    /// Wait until CONNECTING/RECONNECTING resolves
    async fn wait_settled(&self) -> SidecarResult<()> {
        let mut rx = self.status_tx.subscribe();
        let settled = rx
            .wait_for(|s| !s.is_transient())
            .await
            .map(|s| *s)
            .map_err(|_| SidecarError::Closed("connection manager".into()))?;
        match settled {
            ConnectionStatus::Connected => Ok(()),
            ConnectionStatus::Failed => Err(SidecarError::Connection(
                "reconnect attempts exhausted".into(),
            )),
            other => Err(SidecarError::NotConnected {
                state: other.as_str().to_string(),
            }),
        }
    }

    /// Install a fresh session; false if the state moved away meanwhile
    ///
    /// Caller holds `op_lock`.
    async fn establish(self: &Arc<Self>, link: UpstreamLink) -> bool {
        let UpstreamLink { session, events } = link;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.session.lock() = Some(session.clone());

        let established = self.transition(|state| match state {
            ConnectionState::Connecting(c) => (c.established().into(), true),
            ConnectionState::Reconnecting(r) => (r.established().into(), true),
            other => (other, false),
        });

        if !established {
            self.session.lock().take();
            session.close().await;
            debug!(
                connection = %self.config.name,
                "discarding session, connection no longer wanted"
            );
            return false;
        }

        let reader = Self::spawn_reader(self, epoch, events);
        if let Some(old) = self.reader_task.lock().replace(reader) {
            old.abort();
        }
        info!(connection = %self.config.name, epoch, "upstream connected");
        self.emit(ConnectionNotification::Connected);
        true
    }

    /// Re-open every subscription on file against the current session
    ///
    /// Caller holds `op_lock`. Local subscriber sets are left as they are.
    async fn replay(&self) {
        let Some(session) = self.current_session() else {
            return;
        };
        let keys = self.table.lock().invalidate_upstream();
        if keys.is_empty() {
            return;
        }

        info!(count = keys.len(), "replaying subscriptions");
        let mut restored = 0usize;
        for channel in keys {
            match session.subscribe(&channel).await {
                Ok(id) => {
                    if self.table.lock().set_upstream(&channel, id) {
                        restored += 1;
                    }
                }
                Err(error) => {
                    warn!(channel = %channel, error = %error, "failed to restore subscription");
                    let closed = matches!(error, SidecarError::Closed(_));
                    self.emit(ConnectionNotification::Error { error });
                    if closed {
                        break;
                    }
                }
            }
        }
        info!(restored, "subscription replay finished");
    }

    fn spawn_reader(
        self: &Arc<Self>,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<UpstreamEvent>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = loop {
                let Some(event) = events.recv().await else {
                    break "event stream ended".to_string();
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                match event {
                    UpstreamEvent::Notification { subscription, data } => {
                        inner.dispatch(&subscription, &data)
                    }
                    UpstreamEvent::Closed { reason } => break reason,
                }
            };
            if let Some(inner) = weak.upgrade() {
                inner.on_transport_lost(epoch, reason).await;
            }
        })
    }

    fn dispatch(&self, id: &UpstreamId, data: &Value) {
        if let Some(metrics) = &self.metrics {
            metrics.connection().notifications_total.inc();
        }
        let Some((channel, handlers)) = self.table.lock().handlers_for(id) else {
            debug!(upstream_id = %id, "notification for unknown subscription");
            return;
        };
        let label = channel.to_string();
        for handler in handlers {
            contain(&label, || handler(data));
        }
    }

    async fn on_transport_lost(self: &Arc<Self>, epoch: u64, reason: String) {
        let lost = self.transition(|state| match state {
            ConnectionState::Connected(c) if self.epoch.load(Ordering::SeqCst) == epoch => {
                (c.lost().into(), true)
            }
            other => (other, false),
        });
        if !lost {
            return;
        }

        warn!(connection = %self.config.name, reason = %reason, "upstream transport lost");
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.close().await;
        }
        self.emit(ConnectionNotification::Disconnected { reason });
        Self::spawn_reconnect(self);
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let inner = self.clone();
        let task = tokio::spawn(async move {
            Inner::run_reconnect(&inner).await;
        });
        // A loop already running finishes on its own; the new one waits
        // for its lock and exits once the state settled
        self.reconnect_task.lock().replace(task);
    }

    /// Reconnect loop; returns the status it settled in
    async fn run_reconnect(self: &Arc<Self>) -> ConnectionStatus {
        let _running = self.reconnect_lock.lock().await;

        loop {
            let step = self.transition(|state| match state {
                ConnectionState::Reconnecting(r) if r.max_attempts() == 0 => {
                    (r.give_up().into(), Step::GaveUp)
                }
                ConnectionState::Reconnecting(r) => {
                    let attempt = r.attempt();
                    (r.into(), Step::Attempt(attempt))
                }
                other => {
                    let status = other.status();
                    (other, Step::Done(status))
                }
            });

            let attempt = match step {
                Step::Attempt(failed_so_far) => failed_so_far + 1,
                Step::Done(status) => return status,
                Step::GaveUp => {
                    warn!(
                        connection = %self.config.name,
                        "reconnection disabled, connection FAILED"
                    );
                    self.emit(ConnectionNotification::Error {
                        error: SidecarError::Connection("reconnection disabled".into()),
                    });
                    return ConnectionStatus::Failed;
                }
            };

            let delay = self.config.reconnect_backoff.compute_delay(attempt, false);
            info!(
                connection = %self.config.name,
                attempt,
                max_attempts = self.config.max_reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::time::sleep(delay).await;

            if self.status() != ConnectionStatus::Reconnecting {
                return self.status();
            }

            match self.connector.connect().await {
                Ok(link) => {
                    let _op = self.op_lock.lock().await;
                    if self.establish(link).await {
                        if let Some(metrics) = &self.metrics {
                            metrics
                                .connection()
                                .reconnects_total
                                .with_label_values(&["success"])
                                .inc();
                        }
                        self.replay().await;
                    }
                    return self.status();
                }
                Err(error) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.connection().reconnects_total.with_label_values(&["failure"]).inc();
                    }
                    let status = self.transition(|state| match state {
                        ConnectionState::Reconnecting(r) => {
                            let next: ConnectionState = r.attempt_failed().into();
                            let status = next.status();
                            (next, status)
                        }
                        other => {
                            let status = other.status();
                            (other, status)
                        }
                    });
                    warn!(
                        connection = %self.config.name,
                        attempt,
                        error = %error,
                        "reconnect attempt failed"
                    );

                    match status {
                        ConnectionStatus::Reconnecting => continue,
                        ConnectionStatus::Failed => {
                            error!(
                                connection = %self.config.name,
                                attempts = attempt,
                                "reconnect attempts exhausted, connection FAILED"
                            );
                            self.emit(ConnectionNotification::Error {
                                error: SidecarError::Connection(format!(
                                    "reconnect attempts exhausted after {} tries: {}",
                                    attempt, error
                                )),
                            });
                            return status;
                        }
                        other => return other,
                    }
                }
            }
        }
    }

    async fn call_once(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> SidecarResult<Value> {
        let session = self.ready_session(timeout).await?;
        match tokio::time::timeout(timeout, session.call(method, params, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(SidecarError::Timeout {
                method: method.to_string(),
                elapsed: timeout,
            }),
        }
    }

    /// Session to call on, applying the call policy while recovering
    async fn ready_session(&self, timeout: Duration) -> SidecarResult<Arc<dyn UpstreamSession>> {
        let status = match self.status() {
            ConnectionStatus::Connected => ConnectionStatus::Connected,
            status if status.is_transient() => match self.config.call_policy {
                CallPolicy::FailFast => return Err(self.not_connected()),
                CallPolicy::Queue => self.wait_in_queue(timeout).await?,
            },
            status => status,
        };

        match status {
            ConnectionStatus::Connected => {
                self.current_session().ok_or_else(|| self.not_connected())
            }
            ConnectionStatus::Failed => Err(SidecarError::Connection(
                "connection failed; reconnect attempts exhausted".into(),
            )),
            other => Err(SidecarError::NotConnected {
                state: other.as_str().to_string(),
            }),
        }
    }

    /// Wait for the state to settle, bounded by the queue size and the
    /// shorter of `max_queue_wait` and the call timeout
    async fn wait_in_queue(&self, timeout: Duration) -> SidecarResult<ConnectionStatus> {
        let Some(_slot) = QueueSlot::acquire(&self.queued, self.config.max_queued_calls) else {
            debug!("call queue full");
            return Err(self.not_connected());
        };

        let mut rx = self.status_tx.subscribe();
        let wait = self.config.max_queue_wait.min(timeout);
        let settled = tokio::time::timeout(wait, async {
            rx.wait_for(|s| !s.is_transient()).await.map(|s| *s)
        })
        .await;

        match settled {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(SidecarError::Closed("connection manager".into())),
            Err(_) => {
                debug!(waited_ms = wait.as_millis() as u64, "queued call gave up waiting");
                Err(self.not_connected())
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(reader) = self.reader_task.get_mut().take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BackoffPolicy;
    use crate::testing::{account_key, logs_key, MockConnector};

    fn quick_backoff(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(10),
            multiplier: 1.0,
            max_delay: Duration::from_millis(10),
            jitter_factor: 0.0,
            max_attempts,
            ..BackoffPolicy::default()
        }
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            name: "test".into(),
            max_reconnect_attempts: 3,
            reconnect_backoff: quick_backoff(1),
            call_retry: quick_backoff(1),
            max_queue_wait: Duration::from_secs(2),
            call_timeout: Duration::from_secs(1),
            ..ConnectionConfig::default()
        }
    }

    fn manager(mock: &MockConnector, config: ConnectionConfig) -> ConnectionManager {
        ConnectionManager::new(Arc::new(mock.clone()), config)
    }

    fn collector() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&Value) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |v: &Value| sink.lock().push(v.clone()))
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_connect_and_call() {
        let mock = MockConnector::new();
        let mgr = manager(&mock, test_config());

        mgr.connect().await.unwrap();
        assert_eq!(mgr.status(), ConnectionStatus::Connected);

        let result = mgr.call("getSlot", json!([]), None).await.unwrap();
        assert_eq!(result["method"], "getSlot");
        assert_eq!(mock.call_count(), 1);

        // Second connect is a no-op
        mgr.connect().await.unwrap();
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_requires_streaming() {
        let mock = MockConnector::without_streaming();
        let mgr = manager(&mock, test_config());

        let err = mgr.connect().await.unwrap_err();
        assert_eq!(err.kind(), "connection");
        assert_eq!(mock.connect_count(), 0);
        assert_eq!(mgr.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_without_reconnect_fails() {
        let mock = MockConnector::new();
        mock.fail_next_connects(1);
        let mgr = manager(
            &mock,
            ConnectionConfig {
                max_reconnect_attempts: 0,
                ..test_config()
            },
        );

        assert!(mgr.connect().await.is_err());
        assert_eq!(mgr.status(), ConnectionStatus::Failed);
        let err = mgr.call("getSlot", json!([]), None).await.unwrap_err();
        assert_eq!(err.kind(), "connection");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_recovers_in_background() {
        let mock = MockConnector::new();
        mock.fail_next_connects(1);
        let mgr = manager(&mock, test_config());

        assert!(mgr.connect().await.is_err());
        assert_eq!(mgr.status(), ConnectionStatus::Reconnecting);

        let mut status = mgr.watch_status();
        status.wait_for(|s| *s == ConnectionStatus::Connected).await.unwrap();
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_one_upstream_subscription_per_key() {
        let mock = MockConnector::new();
        let mgr = manager(&mock, test_config());
        mgr.connect().await.unwrap();

        let (a, handler_a) = collector();
        let (b, handler_b) = collector();
        let (c, handler_c) = collector();
        let h1 = mgr.subscribe(logs_key(), handler_a).await.unwrap();
        let h2 = mgr.subscribe(logs_key(), handler_b).await.unwrap();
        let h3 = mgr.subscribe(logs_key(), handler_c).await.unwrap();

        assert_eq!(mock.subscribe_count(), 1);
        assert_eq!(mgr.subscriber_count(&logs_key()), 3);

        assert_eq!(mock.push_notification(&logs_key(), json!({"slot": 1})), 1);
        eventually(|| a.lock().len() == 1 && b.lock().len() == 1 && c.lock().len() == 1).await;

        mgr.unsubscribe(h1).await.unwrap();
        mgr.unsubscribe(h2).await.unwrap();
        assert_eq!(mock.unsubscribe_count(), 0);
        mgr.unsubscribe(h3).await.unwrap();
        assert_eq!(mock.unsubscribe_count(), 1);
        assert!(mgr.active_subscriptions().is_empty());

        // Unknown handle is a no-op
        mgr.unsubscribe(h3).await.unwrap();
        assert_eq!(mock.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_while_disconnected() {
        let mock = MockConnector::new();
        let mgr = manager(&mock, test_config());

        let err = mgr.subscribe(logs_key(), |_| {}).await.unwrap_err();
        assert_eq!(err.kind(), "not_connected");
    }

    #[tokio::test]
    async fn test_rejected_subscription_leaves_no_entry() {
        let mock = MockConnector::new();
        mock.reject_subscriptions_for(&account_key());
        let mgr = manager(&mock, test_config());
        mgr.connect().await.unwrap();

        let err = mgr.subscribe(account_key(), |_| {}).await.unwrap_err();
        assert_eq!(err.kind(), "subscription");
        assert!(mgr.active_subscriptions().is_empty());
        // Client-side rejection does not count against the upstream
        assert_eq!(mgr.breaker().consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_after_transport_drop() {
        let mock = MockConnector::new();
        let mgr = manager(&mock, test_config());
        mgr.connect().await.unwrap();

        let (logs, logs_handler) = collector();
        mgr.subscribe(logs_key(), logs_handler).await.unwrap();
        mgr.subscribe(logs_key(), |_| {}).await.unwrap();
        mgr.subscribe(account_key(), |_| {}).await.unwrap();
        assert_eq!(mock.subscribe_count(), 2);

        let mut notes = mgr.notifications();
        mock.drop_transport();

        eventually(|| {
            mock.session_number() == 2
                && mgr.status() == ConnectionStatus::Connected
                && mock.live_subscriptions().len() == 2
        })
        .await;

        assert_eq!(mock.session_number(), 2);
        assert_eq!(mock.subscribe_count(), 4);
        assert_eq!(mgr.subscriber_count(&logs_key()), 2);
        assert_eq!(
            notes.recv().await.unwrap(),
            ConnectionNotification::Disconnected {
                reason: "transport dropped".into()
            }
        );

        mock.push_notification(&logs_key(), json!("after"));
        eventually(|| logs.lock().len() == 1).await;

        let stats = mgr.stats();
        assert_eq!(stats.disconnect_count, 1);
        assert_eq!(stats.successful_reconnects, 1);
        assert_eq!(stats.active_subscriptions, 2);
        assert_eq!(stats.local_subscribers, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_after_max_attempts_then_manual_reconnect() {
        let mock = MockConnector::new();
        let mgr = manager(&mock, test_config());
        mgr.connect().await.unwrap();
        mgr.subscribe(logs_key(), |_| {}).await.unwrap();

        let mut notes = mgr.notifications();
        mock.fail_next_connects(100);
        mock.drop_transport();

        let mut status = mgr.watch_status();
        status.wait_for(|s| *s == ConnectionStatus::Failed).await.unwrap();
        // Initial connect plus three attempts
        assert_eq!(mock.connect_count(), 4);
        assert_eq!(mgr.stats().reconnect_attempts, 3);

        let mut saw_error = false;
        while let Ok(note) = notes.try_recv() {
            if let ConnectionNotification::Error { error } = note {
                assert_eq!(error.kind(), "connection");
                saw_error = true;
            }
        }
        assert!(saw_error);

        let err = mgr.call("getSlot", json!([]), None).await.unwrap_err();
        assert_eq!(err.kind(), "connection");

        mock.fail_next_connects(0);
        mgr.reconnect().await.unwrap();
        assert_eq!(mgr.status(), ConnectionStatus::Connected);
        assert_eq!(mock.live_subscriptions(), vec![logs_key()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_policy_while_reconnecting() {
        let mock = MockConnector::new();
        let mgr = manager(
            &mock,
            ConnectionConfig {
                call_policy: CallPolicy::FailFast,
                max_reconnect_attempts: 50,
                reconnect_backoff: BackoffPolicy {
                    base_delay: Duration::from_secs(10),
                    max_delay: Duration::from_secs(10),
                    ..quick_backoff(1)
                },
                ..test_config()
            },
        );
        mgr.connect().await.unwrap();
        mock.drop_transport();
        mgr.watch_status()
            .wait_for(|s| *s == ConnectionStatus::Reconnecting)
            .await
            .unwrap();

        let err = mgr.call("getSlot", json!([]), None).await.unwrap_err();
        assert_eq!(err.kind(), "not_connected");
        assert_eq!(mock.call_count(), 0);
        // Not-connected does not trip the upstream breaker
        assert_eq!(mgr.breaker().consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_call_runs_after_reconnect() {
        let mock = MockConnector::new();
        let mgr = manager(&mock, test_config());
        mgr.connect().await.unwrap();

        mock.fail_next_connects(1);
        mock.drop_transport();
        mgr.watch_status()
            .wait_for(|s| *s == ConnectionStatus::Reconnecting)
            .await
            .unwrap();

        let result = mgr.call("getSlot", json!([]), None).await.unwrap();
        assert_eq!(result["method"], "getSlot");
        assert_eq!(mgr.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_while_reconnecting_is_established_by_replay() {
        let mock = MockConnector::new();
        let mgr = manager(
            &mock,
            ConnectionConfig {
                reconnect_backoff: BackoffPolicy {
                    base_delay: Duration::from_secs(5),
                    max_delay: Duration::from_secs(5),
                    ..quick_backoff(1)
                },
                ..test_config()
            },
        );
        mgr.connect().await.unwrap();

        mock.fail_next_connects(1);
        mock.drop_transport();
        mgr.watch_status()
            .wait_for(|s| *s == ConnectionStatus::Reconnecting)
            .await
            .unwrap();

        let (seen, handler) = collector();
        mgr.subscribe(logs_key(), handler).await.unwrap();
        assert_eq!(mgr.status(), ConnectionStatus::Reconnecting);
        assert_eq!(mgr.active_subscriptions(), vec![logs_key()]);
        assert_eq!(mock.subscribe_count(), 0);

        mgr.watch_status()
            .wait_for(|s| *s == ConnectionStatus::Connected)
            .await
            .unwrap();
        eventually(|| mock.live_subscriptions() == vec![logs_key()]).await;
        assert_eq!(mock.subscribe_count(), 1);

        mock.push_notification(&logs_key(), json!("replayed"));
        eventually(|| seen.lock().len() == 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_wait_is_bounded() {
        let mock = MockConnector::new();
        let mgr = manager(
            &mock,
            ConnectionConfig {
                max_reconnect_attempts: 50,
                max_queue_wait: Duration::from_millis(100),
                reconnect_backoff: BackoffPolicy {
                    base_delay: Duration::from_secs(10),
                    max_delay: Duration::from_secs(10),
                    ..quick_backoff(1)
                },
                ..test_config()
            },
        );
        mgr.connect().await.unwrap();
        mock.drop_transport();
        mgr.watch_status()
            .wait_for(|s| *s == ConnectionStatus::Reconnecting)
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let err = mgr.call("getSlot", json!([]), None).await.unwrap_err();
        assert_eq!(err.kind(), "not_connected");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout() {
        let mock = MockConnector::new();
        mock.set_call_delay(Duration::from_secs(5));
        let mgr = manager(&mock, test_config());
        mgr.connect().await.unwrap();

        let err = mgr
            .call("getSlot", json!([]), Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(mgr.breaker().consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mock = MockConnector::new();
        let mgr = manager(&mock, test_config());
        mgr.connect().await.unwrap();
        mgr.subscribe(logs_key(), |_| {}).await.unwrap();

        let mut notes = mgr.notifications();
        mgr.close().await;
        mgr.close().await;

        assert_eq!(mgr.status(), ConnectionStatus::Disconnected);
        assert_eq!(mock.unsubscribe_count(), 1);
        assert!(mgr.active_subscriptions().is_empty());
        assert!(matches!(
            notes.try_recv(),
            Ok(ConnectionNotification::Disconnected { .. })
        ));
        assert!(notes.try_recv().is_err());

        // Can connect again afterwards
        mgr.connect().await.unwrap();
        assert_eq!(mgr.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_dispatch() {
        let mock = MockConnector::new();
        let mgr = manager(&mock, test_config());
        mgr.connect().await.unwrap();

        mgr.subscribe(logs_key(), |_| panic!("bad handler")).await.unwrap();
        let (seen, handler) = collector();
        mgr.subscribe(logs_key(), handler).await.unwrap();

        mock.push_notification(&logs_key(), json!(1));
        mock.push_notification(&logs_key(), json!(2));
        eventually(|| seen.lock().len() == 2).await;
        assert_eq!(mgr.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_redrive_cancel_for_old_session_is_noop() {
        let mock = MockConnector::new();
        let mgr = manager(&mock, test_config());
        mgr.connect().await.unwrap();

        let failure = CancelFailure {
            channel: logs_key(),
            upstream_id: UpstreamId("100".into()),
            epoch: 0,
            error: SidecarError::Closed("gone".into()),
        };
        let payload = failure.to_payload();
        assert_eq!(payload["op"], "unsubscribe");

        mgr.redrive_cancel(payload).await.unwrap();
        assert_eq!(mock.unsubscribe_count(), 0);

        let err = mgr.redrive_cancel(json!({"op": "other"})).await.unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }
}
