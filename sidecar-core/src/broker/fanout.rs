//! Channel fan-out
//!
//! Maps each channel key to the set of local connections subscribed to it.
//! The first member of a key opens one subscription on the connection
//! manager; its handler looks the member set up at broadcast time, so a
//! member removed before a notification never receives it. The last
//! member leaving releases the upstream subscription.

use super::protocol::{encode_line, CallRequest, CallResponse, EventPush};
use crate::connection::ConnectionManager;
use crate::core::errors::SidecarResult;
use crate::core::types::{ChannelKey, SubscriberHandle};
use crate::monitoring::MetricsRegistry;
use crate::resilience::DeadLetterStore;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Outbound lines for one local event connection
pub type FrameSink = mpsc::UnboundedSender<Arc<str>>;

/// Id of a local client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalConnId(pub u64);

impl fmt::Display for LocalConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local#{}", self.0)
    }
}

struct ChannelEntry {
    members: BTreeSet<LocalConnId>,
    handle: SubscriberHandle,
}

struct BrokerInner {
    connection: ConnectionManager,
    channels: Mutex<HashMap<ChannelKey, ChannelEntry>>,
    sinks: DashMap<LocalConnId, FrameSink>,
    ops: tokio::sync::Mutex<()>,
    next_conn: AtomicU64,
    dead_letters: Option<DeadLetterStore>,
    metrics: Option<MetricsRegistry>,
}

/// Multiplexes local clients onto the one upstream connection
#[derive(Clone)]
pub struct SubscriptionBroker {
    inner: Arc<BrokerInner>,
}

impl SubscriptionBroker {
    /// `dead_letters` receives upstream cancels that failed
    pub fn new(
        connection: ConnectionManager,
        dead_letters: Option<DeadLetterStore>,
        metrics: Option<MetricsRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                connection,
                channels: Mutex::new(HashMap::new()),
                sinks: DashMap::new(),
                ops: tokio::sync::Mutex::new(()),
                next_conn: AtomicU64::new(1),
                dead_letters,
                metrics,
            }),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Register a local event connection
    pub fn register(&self, sink: FrameSink) -> LocalConnId {
        let id = LocalConnId(self.inner.next_conn.fetch_add(1, Ordering::SeqCst));
        self.inner.sinks.insert(id, sink);
        debug!(conn = %id, "local connection registered");
        id
    }

    /// Add `conn` to `channel`, opening the upstream subscription for the
    /// first member
    pub async fn subscribe(&self, conn: LocalConnId, channel: ChannelKey) -> SidecarResult<()> {
        let inner = &self.inner;
        let _ops = inner.ops.lock().await;

        if let Some(entry) = inner.channels.lock().get_mut(&channel) {
            entry.members.insert(conn);
            debug!(
                conn = %conn,
                channel = %channel,
                members = entry.members.len(),
                "joined channel"
            );
            return Ok(());
        }

        let handler = broadcast_fn(Arc::downgrade(inner), channel.clone());
        let handle = inner.connection.subscribe(channel.clone(), handler).await?;

        let mut members = BTreeSet::new();
        members.insert(conn);
        inner
            .channels
            .lock()
            .insert(channel.clone(), ChannelEntry { members, handle });
        info!(conn = %conn, channel = %channel, "channel opened");
        Ok(())
    }

    /// Remove `conn` from `channel`; a no-op if it was not a member
    pub async fn unsubscribe(&self, conn: LocalConnId, channel: &ChannelKey) {
        let inner = &self.inner;
        let _ops = inner.ops.lock().await;

        let released = {
            let mut channels = inner.channels.lock();
            let emptied = match channels.get_mut(channel) {
                Some(entry) => entry.members.remove(&conn) && entry.members.is_empty(),
                None => false,
            };
            if emptied {
                channels.remove(channel).map(|e| e.handle)
            } else {
                None
            }
        };

        if let Some(handle) = released {
            info!(channel = %channel, "channel closed");
            self.release(channel, handle).await;
        }
    }

    /// Drop a local connection and every membership it held
    pub async fn disconnect(&self, conn: LocalConnId) {
        let inner = &self.inner;
        inner.sinks.remove(&conn);
        let _ops = inner.ops.lock().await;

        let released: Vec<(ChannelKey, SubscriberHandle)> = {
            let mut channels = inner.channels.lock();
            let emptied: Vec<ChannelKey> = channels
                .iter_mut()
                .filter_map(|(key, entry)| {
                    (entry.members.remove(&conn) && entry.members.is_empty()).then(|| key.clone())
                })
                .collect();
            emptied
                .into_iter()
                .filter_map(|key| channels.remove(&key).map(|e| (key, e.handle)))
                .collect()
        };

        debug!(conn = %conn, released = released.len(), "local connection gone");
        for (channel, handle) in released {
            self.release(&channel, handle).await;
        }
    }

    /// Forward a call-channel request to the upstream
    pub async fn call(&self, request: CallRequest) -> CallResponse {
        let timeout = request.timeout_ms.map(Duration::from_millis);
        let result = self
            .inner
            .connection
            .call(&request.method, request.params, timeout)
            .await;

        if let Some(metrics) = &self.inner.metrics {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) => e.kind(),
            };
            metrics.broker().requests_total.with_label_values(&[outcome]).inc();
        }
        CallResponse::from_result(request.id, result)
    }

    /// Re-drive a dead-lettered upstream cancel
    pub async fn redrive(&self, payload: Value) -> SidecarResult<()> {
        self.inner.connection.redrive_cancel(payload).await
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    pub fn member_count(&self, channel: &ChannelKey) -> usize {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map(|e| e.members.len())
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.sinks.len()
    }

    async fn release(&self, channel: &ChannelKey, handle: SubscriberHandle) {
        let Err(failure) = self.inner.connection.unsubscribe(handle).await else {
            return;
        };
        let Some(store) = &self.inner.dead_letters else {
            warn!(
                channel = %channel,
                error = %failure.error,
                "upstream cancel failed, no dead-letter store"
            );
            return;
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), "broker".to_string());
        metadata.insert("channel".to_string(), channel.to_string());
        if let Err(e) = store.add(failure.to_payload(), &failure.error, metadata).await {
            error!(channel = %channel, error = %e, "failed to dead-letter upstream cancel");
        }
    }
}

/// Handler registered with the connection manager for one channel
///
/// Holds the broker weakly; the manager outlives no broker it serves.
fn broadcast_fn(
    broker: Weak<BrokerInner>,
    channel: ChannelKey,
) -> impl Fn(&Value) + Send + Sync + 'static {
    let name = channel.to_string();
    move |data: &Value| {
        let Some(inner) = broker.upgrade() else {
            return;
        };
        let sinks: Vec<FrameSink> = {
            let channels = inner.channels.lock();
            let Some(entry) = channels.get(&channel) else {
                return;
            };
            entry
                .members
                .iter()
                .filter_map(|id| inner.sinks.get(id).map(|s| s.value().clone()))
                .collect()
        };
        if sinks.is_empty() {
            return;
        }

        let line: Arc<str> = match encode_line(&EventPush {
            channel: name.clone(),
            data: data.clone(),
        }) {
            Ok(line) => line.into(),
            Err(e) => {
                error!(channel = %name, error = %e, "failed to encode event");
                return;
            }
        };

        let delivered = sinks.iter().filter(|sink| sink.send(line.clone()).is_ok()).count();
        if let Some(metrics) = &inner.metrics {
            metrics.broker().events_broadcast_total.inc_by(delivered as u64);
        }
    }
}
