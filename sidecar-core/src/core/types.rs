//! Identifier and state types shared by every layer
//!
//! - `ChannelKey`: validated logical subscription target (`logs:<addr>`, ...)
//! - `SubscriberHandle`: local handle returned by `ConnectionManager::subscribe`
//! - `UpstreamId`: opaque subscription id issued by the provider
//! - `ConnectionStatus`: flat copy of the connection state for observers

use crate::core::errors::SidecarError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of upstream stream a channel key targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    /// Transaction logs mentioning an address
    Logs,
    /// Account data changes for one address
    Account,
    /// Account changes for every account owned by a program
    Program,
    /// Slot progression (no address)
    Slot,
}

impl ChannelKind {
    /// Prefix used in the textual key
    pub fn prefix(&self) -> &'static str {
        match self {
            ChannelKind::Logs => "logs",
            ChannelKind::Account => "account",
            ChannelKind::Program => "program",
            ChannelKind::Slot => "slot",
        }
    }
}

/// Validated channel key, e.g. `logs:<address>` or `account:<address>`
///
/// Two keys are the same upstream subscription iff their text is equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelKey {
    kind: ChannelKind,
    target: Option<String>,
}

impl ChannelKey {
    /// Parse and validate a channel key
    pub fn parse(raw: &str) -> Result<Self, SidecarError> {
        let raw = raw.trim();
        let (prefix, target) = match raw.split_once(':') {
            Some((prefix, target)) => (prefix, Some(target)),
            None => (raw, None),
        };

        let kind = match prefix {
            "logs" => ChannelKind::Logs,
            "account" => ChannelKind::Account,
            "program" => ChannelKind::Program,
            "slot" => ChannelKind::Slot,
            other => {
                return Err(SidecarError::subscription(
                    raw,
                    format!("unknown channel kind '{}'", other),
                ))
            }
        };

        let target = match (kind, target) {
            (ChannelKind::Slot, None) => None,
            (ChannelKind::Slot, Some(_)) => {
                return Err(SidecarError::subscription(raw, "slot channel takes no target"))
            }
            (_, Some(t)) if is_valid_address(t) => Some(t.to_string()),
            (_, Some(_)) => {
                return Err(SidecarError::subscription(raw, "invalid address"));
            }
            (_, None) => {
                return Err(SidecarError::subscription(raw, "missing address"));
            }
        };

        Ok(Self { kind, target })
    }

    /// Logs channel for an address
    pub fn logs(address: &str) -> Result<Self, SidecarError> {
        Self::parse(&format!("logs:{}", address))
    }

    /// Account channel for an address
    pub fn account(address: &str) -> Result<Self, SidecarError> {
        Self::parse(&format!("account:{}", address))
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Address part of the key (`None` for `slot`)
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}

/// Base58 alphabet, 32..=44 chars covers every on-chain address form
fn is_valid_address(s: &str) -> bool {
    (32..=44).contains(&s.len())
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l'))
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{}:{}", self.kind.prefix(), target),
            None => write!(f, "{}", self.kind.prefix()),
        }
    }
}

impl FromStr for ChannelKey {
    type Err = SidecarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ChannelKey {
    type Error = SidecarError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ChannelKey> for String {
    fn from(key: ChannelKey) -> Self {
        key.to_string()
    }
}

/// Local subscriber handle issued by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberHandle(pub u64);

impl fmt::Display for SubscriberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Opaque subscription id returned by the provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpstreamId(pub String);

impl UpstreamId {
    /// Build from a JSON-RPC result, which may be a number or a string
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => Some(Self(n.to_string())),
            serde_json::Value::String(s) => Some(Self(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for UpstreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flat view of the connection state, cheap to copy and publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Reconnecting => "RECONNECTING",
            ConnectionStatus::Failed => "FAILED",
        }
    }

    /// Numeric code exported as a gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            ConnectionStatus::Disconnected => 0,
            ConnectionStatus::Connecting => 1,
            ConnectionStatus::Connected => 2,
            ConnectionStatus::Reconnecting => 3,
            ConnectionStatus::Failed => 4,
        }
    }

    /// States in which a reconnect may still bring the session back
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Reconnecting)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

    #[test]
    fn test_parse_logs_key() {
        let key = ChannelKey::parse(&format!("logs:{}", ADDR)).unwrap();
        assert_eq!(key.kind(), ChannelKind::Logs);
        assert_eq!(key.target(), Some(ADDR));
        assert_eq!(key.to_string(), format!("logs:{}", ADDR));
    }

    #[test]
    fn test_parse_slot_key() {
        let key = ChannelKey::parse("slot").unwrap();
        assert_eq!(key.kind(), ChannelKind::Slot);
        assert!(key.target().is_none());
        assert!(ChannelKey::parse("slot:abc").is_err());
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(ChannelKey::parse("blocks:whatever").is_err());
        assert!(ChannelKey::parse("logs").is_err());
        assert!(ChannelKey::parse("logs:short").is_err());
        // '0' is not in the base58 alphabet
        assert!(ChannelKey::parse("logs:0000000000000000000000000000000000000000").is_err());
    }

    #[test]
    fn test_rejected_key_is_subscription_error() {
        let err = ChannelKey::parse("nope:x").unwrap_err();
        assert_eq!(err.kind(), "subscription");
    }

    #[test]
    fn test_serde_as_string() {
        let key = ChannelKey::account(ADDR).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"account:{}\"", ADDR));
        let back: ChannelKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_upstream_id_from_json() {
        assert_eq!(
            UpstreamId::from_json(&serde_json::json!(42)),
            Some(UpstreamId("42".into()))
        );
        assert_eq!(
            UpstreamId::from_json(&serde_json::json!("abc")),
            Some(UpstreamId("abc".into()))
        );
        assert_eq!(UpstreamId::from_json(&serde_json::json!(null)), None);
    }

    #[test]
    fn test_status_serializes_screaming() {
        let json = serde_json::to_string(&ConnectionStatus::Reconnecting).unwrap();
        assert_eq!(json, "\"RECONNECTING\"");
    }
}
