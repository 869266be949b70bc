//! Programmable in-process upstream
//!
//! Counts upstream subscribes, lets tests push notifications for a channel
//! and drop the transport to force a reconnect.

use crate::core::errors::{SidecarError, SidecarResult};
use crate::core::types::{ChannelKey, UpstreamId};
use crate::upstream::{UpstreamConnector, UpstreamEvent, UpstreamLink, UpstreamSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct LiveSession {
    number: u64,
    events_tx: mpsc::UnboundedSender<UpstreamEvent>,
    alive: Arc<AtomicBool>,
    subscriptions: HashMap<UpstreamId, ChannelKey>,
}

#[derive(Default)]
struct MockState {
    connects: AtomicU32,
    fail_connects: AtomicU32,
    subscribes: AtomicU32,
    unsubscribes: AtomicU32,
    calls: AtomicU32,
    next_id: AtomicU64,
    sessions: AtomicU64,
    live: Mutex<Option<LiveSession>>,
    responses: Mutex<HashMap<String, VecDeque<SidecarResult<Value>>>>,
    rejected_channels: Mutex<HashSet<String>>,
    call_delay: Mutex<Duration>,
}

/// Mock connector; clones share state
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<MockState>,
    streaming: bool,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                next_id: AtomicU64::new(100),
                ..Default::default()
            }),
            streaming: true,
        }
    }

    /// Connector that reports no streaming endpoint
    pub fn without_streaming() -> Self {
        Self {
            streaming: false,
            ..Self::new()
        }
    }

    /// Make the next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: u32) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Successful upstream subscribes across all sessions
    pub fn subscribe_count(&self) -> u32 {
        self.state.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_count(&self) -> u32 {
        self.state.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> u32 {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Upstream subscriptions open on the current session
    pub fn live_subscriptions(&self) -> Vec<ChannelKey> {
        let live = self.state.live.lock();
        let mut keys: Vec<_> = live
            .as_ref()
            .map(|s| s.subscriptions.values().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Number of the current session (1 for the first connect)
    pub fn session_number(&self) -> u64 {
        self.state.live.lock().as_ref().map(|s| s.number).unwrap_or(0)
    }

    /// Queue a response for the next call of `method`
    pub fn script_response(&self, method: &str, response: SidecarResult<Value>) {
        self.state
            .responses
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(response);
    }

    /// Delay every call by `delay`
    pub fn set_call_delay(&self, delay: Duration) {
        *self.state.call_delay.lock() = delay;
    }

    /// Make upstream subscribes for `channel` fail
    pub fn reject_subscriptions_for(&self, channel: &ChannelKey) {
        self.state.rejected_channels.lock().insert(channel.to_string());
    }

    /// Push a notification on every upstream subscription for `channel`;
    /// returns how many were sent
    pub fn push_notification(&self, channel: &ChannelKey, data: Value) -> usize {
        let live = self.state.live.lock();
        let Some(session) = live.as_ref() else {
            return 0;
        };
        session
            .subscriptions
            .iter()
            .filter(|(_, key)| *key == channel)
            .filter(|(id, _)| {
                session
                    .events_tx
                    .send(UpstreamEvent::Notification {
                        subscription: (*id).clone(),
                        data: data.clone(),
                    })
                    .is_ok()
            })
            .count()
    }

    /// Kill the current session as if the socket dropped
    pub fn drop_transport(&self) {
        if let Some(session) = self.state.live.lock().take() {
            session.alive.store(false, Ordering::SeqCst);
            let _ = session.events_tx.send(UpstreamEvent::Closed {
                reason: "transport dropped".into(),
            });
        }
    }
}

#[async_trait]
impl UpstreamConnector for MockConnector {
    fn has_streaming(&self) -> bool {
        self.streaming
    }

    async fn connect(&self) -> SidecarResult<UpstreamLink> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let remaining = self.state.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(SidecarError::Connection("mock connect refused".into()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let number = self.state.sessions.fetch_add(1, Ordering::SeqCst) + 1;

        // A new session replaces the old one
        if let Some(old) = self.state.live.lock().replace(LiveSession {
            number,
            events_tx,
            alive: alive.clone(),
            subscriptions: HashMap::new(),
        }) {
            old.alive.store(false, Ordering::SeqCst);
        }

        Ok(UpstreamLink {
            session: Arc::new(MockSession {
                state: self.state.clone(),
                number,
                alive,
            }),
            events: events_rx,
        })
    }
}

struct MockSession {
    state: Arc<MockState>,
    number: u64,
    alive: Arc<AtomicBool>,
}

impl MockSession {
    fn check_alive(&self) -> SidecarResult<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SidecarError::Closed("mock session".into()))
        }
    }
}

#[async_trait]
impl UpstreamSession for MockSession {
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> SidecarResult<Value> {
        self.check_alive()?;
        self.state.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.call_delay.lock();
        if !delay.is_zero() {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(SidecarError::Timeout {
                    method: method.to_string(),
                    elapsed: timeout,
                });
            }
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .state
            .responses
            .lock()
            .get_mut(method)
            .and_then(|q| q.pop_front());
        match scripted {
            Some(response) => response,
            None => Ok(json!({ "method": method, "params": params })),
        }
    }

    async fn subscribe(&self, channel: &ChannelKey) -> SidecarResult<UpstreamId> {
        self.check_alive()?;
        if self.state.rejected_channels.lock().contains(&channel.to_string()) {
            return Err(SidecarError::subscription(channel.to_string(), "rejected by mock"));
        }

        let id = UpstreamId(self.state.next_id.fetch_add(1, Ordering::SeqCst).to_string());
        let mut live = self.state.live.lock();
        match live.as_mut() {
            Some(session) if session.number == self.number => {
                session.subscriptions.insert(id.clone(), channel.clone());
            }
            _ => return Err(SidecarError::Closed("mock session".into())),
        }
        self.state.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn unsubscribe(&self, _channel: &ChannelKey, id: &UpstreamId) -> SidecarResult<()> {
        self.check_alive()?;
        if let Some(session) = self.state.live.lock().as_mut() {
            if session.number == self.number {
                session.subscriptions.remove(id);
            }
        }
        self.state.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut live = self.state.live.lock();
        if live.as_ref().map(|s| s.number) == Some(self.number) {
            live.take();
        }
    }
}
