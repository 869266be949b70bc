//! Upstream Connection State Machine - Typestate Pattern
//!
//! Compile-time checked lifecycle of the single upstream session.
//!
//! # State Diagram
//!
//! ```text
//!   DISCONNECTED ──begin()──→ CONNECTING ──established()──→ CONNECTED
//!        ▲                        │                             │
//!        │            failed(reconnect on)                 lost()
//!        │                        │                             │
//!        │                        ▼                             ▼
//!        │                  RECONNECTING ◄──────────────── RECONNECTING
//!        │                   │        │
//!      close()      attempt_failed   established()
//!    (any state)          │           │
//!                         ▼           ▼
//!              FAILED (max reached)  CONNECTED
//!                 │
//!            force_reconnect()
//!                 │
//!                 ▼
//!           RECONNECTING
//! ```
//!
//! CONNECTING moves straight to FAILED when reconnection is disabled
//! (`max_reconnect_attempts == 0`).
//!
//! # Usage
//!
//! ```
//! use sidecar_core::core::connection_fsm::*;
//!
//! let conn = UpstreamDisconnected::new("rpc".to_string(), 3);
//! let conn = conn.begin();
//! let conn = conn.established();
//! let conn = conn.lost();
//!
//! match conn.attempt_failed() {
//!     AttemptResult::Reconnecting(r) => assert_eq!(r.attempt(), 1),
//!     AttemptResult::Failed(_) => unreachable!(),
//! }
//! ```

use crate::core::types::ConnectionStatus;
use std::time::{Duration, Instant, SystemTime};

// ============================================================================
// Connection Data (shared by all states)
// ============================================================================

/// Bookkeeping carried through every transition
#[derive(Debug, Clone)]
pub struct ConnectionData {
    /// Connection name, used in logs
    pub name: String,
    /// When the state machine was created
    pub created_at: SystemTime,
    /// When the current session was established
    pub connected_since: Option<Instant>,
    /// When the last session was lost
    pub last_disconnected_at: Option<SystemTime>,
    /// Sessions lost to transport errors
    pub disconnect_count: u64,
    /// Reconnect attempts over the lifetime of the manager
    pub reconnect_attempts: u64,
    /// Reconnects that ended in CONNECTED
    pub successful_reconnects: u64,
    /// Attempts allowed per reconnect cycle (0 disables reconnection)
    pub max_reconnect_attempts: u32,
    /// Failed attempts in the current cycle
    pub attempt: u32,
}

impl ConnectionData {
    pub fn new(name: String, max_reconnect_attempts: u32) -> Self {
        Self {
            name,
            created_at: SystemTime::now(),
            connected_since: None,
            last_disconnected_at: None,
            disconnect_count: 0,
            reconnect_attempts: 0,
            successful_reconnects: 0,
            max_reconnect_attempts,
            attempt: 0,
        }
    }

    /// Uptime of the current session
    pub fn uptime(&self) -> Duration {
        self.connected_since
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

// ============================================================================
// State: Disconnected
// ============================================================================

/// No session, no recovery in progress
///
/// **Valid Transitions:**
/// - `begin()` → UpstreamConnecting
#[derive(Debug, Clone)]
pub struct UpstreamDisconnected {
    data: ConnectionData,
}

impl UpstreamDisconnected {
    pub fn new(name: String, max_reconnect_attempts: u32) -> Self {
        Self {
            data: ConnectionData::new(name, max_reconnect_attempts),
        }
    }

    pub fn data(&self) -> &ConnectionData {
        &self.data
    }

    /// Transition: Disconnected → Connecting
    pub fn begin(self) -> UpstreamConnecting {
        UpstreamConnecting { data: self.data }
    }
}

// ============================================================================
// State: Connecting
// ============================================================================

/// Initial connect in flight
///
/// **Valid Transitions:**
/// - `established()` → UpstreamConnected
/// - `failed()` → UpstreamReconnecting | UpstreamFailed
#[derive(Debug, Clone)]
pub struct UpstreamConnecting {
    data: ConnectionData,
}

impl UpstreamConnecting {
    pub fn data(&self) -> &ConnectionData {
        &self.data
    }

    /// Transition: Connecting → Connected
    pub fn established(mut self) -> UpstreamConnected {
        self.data.connected_since = Some(Instant::now());
        self.data.attempt = 0;
        UpstreamConnected { data: self.data }
    }

    /// Transition: Connecting → Reconnecting, or Failed when reconnection is disabled
    pub fn failed(mut self) -> AttemptResult {
        if self.data.max_reconnect_attempts == 0 {
            return AttemptResult::Failed(UpstreamFailed { data: self.data });
        }
        self.data.attempt = 0;
        AttemptResult::Reconnecting(UpstreamReconnecting { data: self.data })
    }
}

// ============================================================================
// State: Connected
// ============================================================================

/// Session established and serving calls
///
/// **Valid Transitions:**
/// - `lost()` → UpstreamReconnecting
#[derive(Debug, Clone)]
pub struct UpstreamConnected {
    data: ConnectionData,
}

impl UpstreamConnected {
    pub fn data(&self) -> &ConnectionData {
        &self.data
    }

    /// Transition: Connected → Reconnecting (transport error or close)
    pub fn lost(mut self) -> UpstreamReconnecting {
        self.data.last_disconnected_at = Some(SystemTime::now());
        self.data.connected_since = None;
        self.data.disconnect_count += 1;
        self.data.attempt = 0;
        UpstreamReconnecting { data: self.data }
    }
}

// ============================================================================
// State: Reconnecting
// ============================================================================

/// Recovering after a lost session
///
/// **Valid Transitions:**
/// - `established()` → UpstreamConnected
/// - `attempt_failed()` → UpstreamReconnecting | UpstreamFailed
#[derive(Debug, Clone)]
pub struct UpstreamReconnecting {
    data: ConnectionData,
}

impl UpstreamReconnecting {
    pub fn data(&self) -> &ConnectionData {
        &self.data
    }

    /// Failed attempts in this cycle
    pub fn attempt(&self) -> u32 {
        self.data.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.data.max_reconnect_attempts
    }

    /// Transition: Reconnecting → Connected; resets the attempt counter
    pub fn established(mut self) -> UpstreamConnected {
        self.data.connected_since = Some(Instant::now());
        self.data.attempt = 0;
        self.data.successful_reconnects += 1;
        UpstreamConnected { data: self.data }
    }

    /// Transition: Reconnecting → Failed without another attempt
    /// (reconnection disabled)
    pub fn give_up(self) -> UpstreamFailed {
        UpstreamFailed { data: self.data }
    }

    /// Transition: Reconnecting → Reconnecting | Failed
    pub fn attempt_failed(mut self) -> AttemptResult {
        self.data.attempt += 1;
        self.data.reconnect_attempts += 1;
        if self.data.attempt >= self.data.max_reconnect_attempts {
            AttemptResult::Failed(UpstreamFailed { data: self.data })
        } else {
            AttemptResult::Reconnecting(self)
        }
    }
}

// ============================================================================
// State: Failed (Terminal until manual reconnect)
// ============================================================================

/// Reconnect attempts exhausted; needs `reconnect()` or a restart
#[derive(Debug, Clone)]
pub struct UpstreamFailed {
    data: ConnectionData,
}

impl UpstreamFailed {
    pub fn data(&self) -> &ConnectionData {
        &self.data
    }
}

// ============================================================================
// Result types for state transitions
// ============================================================================

/// Outcome of a failed connect or reconnect attempt
pub enum AttemptResult {
    Reconnecting(UpstreamReconnecting),
    Failed(UpstreamFailed),
}

// ============================================================================
// Enum wrapper
// ============================================================================

/// Type-erased connection state, stored behind the manager's lock
#[derive(Debug, Clone)]
pub enum ConnectionState {
    Disconnected(UpstreamDisconnected),
    Connecting(UpstreamConnecting),
    Connected(UpstreamConnected),
    Reconnecting(UpstreamReconnecting),
    Failed(UpstreamFailed),
}

impl ConnectionState {
    pub fn new(name: String, max_reconnect_attempts: u32) -> Self {
        ConnectionState::Disconnected(UpstreamDisconnected::new(name, max_reconnect_attempts))
    }

    pub fn data(&self) -> &ConnectionData {
        match self {
            ConnectionState::Disconnected(s) => s.data(),
            ConnectionState::Connecting(s) => s.data(),
            ConnectionState::Connected(s) => s.data(),
            ConnectionState::Reconnecting(s) => s.data(),
            ConnectionState::Failed(s) => s.data(),
        }
    }

    fn into_data(self) -> ConnectionData {
        match self {
            ConnectionState::Disconnected(s) => s.data,
            ConnectionState::Connecting(s) => s.data,
            ConnectionState::Connected(s) => s.data,
            ConnectionState::Reconnecting(s) => s.data,
            ConnectionState::Failed(s) => s.data,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        match self {
            ConnectionState::Disconnected(_) => ConnectionStatus::Disconnected,
            ConnectionState::Connecting(_) => ConnectionStatus::Connecting,
            ConnectionState::Connected(_) => ConnectionStatus::Connected,
            ConnectionState::Reconnecting(_) => ConnectionStatus::Reconnecting,
            ConnectionState::Failed(_) => ConnectionStatus::Failed,
        }
    }

    pub fn is_operational(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    /// Transition: any → Reconnecting, starting a fresh attempt cycle
    ///
    /// Used by manual `reconnect()`, which overrides whatever state the
    /// machine is in (including FAILED).
    pub fn force_reconnect(self) -> ConnectionState {
        match self {
            ConnectionState::Connected(c) => ConnectionState::Reconnecting(c.lost()),
            other => {
                let mut data = other.into_data();
                data.attempt = 0;
                data.connected_since = None;
                ConnectionState::Reconnecting(UpstreamReconnecting { data })
            }
        }
    }

    /// Transition: any → Disconnected, keeping lifetime counters
    pub fn close(self) -> ConnectionState {
        let mut data = self.into_data();
        if data.connected_since.take().is_some() {
            data.last_disconnected_at = Some(SystemTime::now());
        }
        data.attempt = 0;
        ConnectionState::Disconnected(UpstreamDisconnected { data })
    }
}

// Conversions
impl From<UpstreamDisconnected> for ConnectionState {
    fn from(c: UpstreamDisconnected) -> Self {
        ConnectionState::Disconnected(c)
    }
}

impl From<UpstreamConnecting> for ConnectionState {
    fn from(c: UpstreamConnecting) -> Self {
        ConnectionState::Connecting(c)
    }
}

impl From<UpstreamConnected> for ConnectionState {
    fn from(c: UpstreamConnected) -> Self {
        ConnectionState::Connected(c)
    }
}

impl From<UpstreamReconnecting> for ConnectionState {
    fn from(c: UpstreamReconnecting) -> Self {
        ConnectionState::Reconnecting(c)
    }
}

impl From<UpstreamFailed> for ConnectionState {
    fn from(c: UpstreamFailed) -> Self {
        ConnectionState::Failed(c)
    }
}

impl From<AttemptResult> for ConnectionState {
    fn from(r: AttemptResult) -> Self {
        match r {
            AttemptResult::Reconnecting(r) => r.into(),
            AttemptResult::Failed(f) => f.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(max: u32) -> UpstreamConnected {
        UpstreamDisconnected::new("test-rpc".to_string(), max)
            .begin()
            .established()
    }

    #[test]
    fn test_connect_sequence() {
        let conn = UpstreamDisconnected::new("test-rpc".to_string(), 3);
        let conn = conn.begin();
        let conn = conn.established();
        assert!(conn.data().connected_since.is_some());

        let state: ConnectionState = conn.into();
        assert!(state.is_operational());
        assert_eq!(state.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_connecting_fails_without_reconnect() {
        let conn = UpstreamDisconnected::new("test-rpc".to_string(), 0).begin();
        let state: ConnectionState = conn.failed().into();
        assert_eq!(state.status(), ConnectionStatus::Failed);
    }

    #[test]
    fn test_connecting_failure_starts_recovery() {
        let conn = UpstreamDisconnected::new("test-rpc".to_string(), 3).begin();
        let state: ConnectionState = conn.failed().into();
        assert_eq!(state.status(), ConnectionStatus::Reconnecting);
    }

    #[test]
    fn test_lost_counts_disconnect() {
        let conn = connected(3).lost();
        assert_eq!(conn.data().disconnect_count, 1);
        assert_eq!(conn.attempt(), 0);
        assert!(conn.data().connected_since.is_none());
    }

    #[test]
    fn test_exhaust_attempts() {
        let mut reconnecting = connected(3).lost();

        for expected in 1..3 {
            reconnecting = match reconnecting.attempt_failed() {
                AttemptResult::Reconnecting(r) => {
                    assert_eq!(r.attempt(), expected);
                    r
                }
                AttemptResult::Failed(_) => panic!("Should still be reconnecting"),
            };
        }

        match reconnecting.attempt_failed() {
            AttemptResult::Failed(failed) => {
                assert_eq!(failed.data().reconnect_attempts, 3);
            }
            AttemptResult::Reconnecting(_) => panic!("Should be failed"),
        }
    }

    #[test]
    fn test_reconnect_resets_attempts() {
        let reconnecting = connected(5).lost();
        let reconnecting = match reconnecting.attempt_failed() {
            AttemptResult::Reconnecting(r) => r,
            AttemptResult::Failed(_) => panic!(),
        };
        let conn = reconnecting.established();
        assert_eq!(conn.data().attempt, 0);
        assert_eq!(conn.data().successful_reconnects, 1);
    }

    #[test]
    fn test_force_reconnect_from_failed() {
        let failed = match connected(1).lost().attempt_failed() {
            AttemptResult::Failed(f) => f,
            AttemptResult::Reconnecting(_) => panic!(),
        };
        let state = ConnectionState::from(failed).force_reconnect();
        assert_eq!(state.status(), ConnectionStatus::Reconnecting);
        assert_eq!(state.data().attempt, 0);
    }

    #[test]
    fn test_close_from_any_state() {
        let state: ConnectionState = connected(3).into();
        let state = state.close();
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
        assert!(state.data().last_disconnected_at.is_some());

        // Closing twice is harmless
        let state = state.close();
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
    }
}
