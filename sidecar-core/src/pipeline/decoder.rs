//! Event decoding
//!
//! Turns a raw `{channel, data}` push into a [`ChainEvent`]. The decoder is
//! a seam: [`LogClassifier`] only sorts log notifications by the program
//! instructions they mention; richer decoders plug in behind the same trait.

use crate::broker::protocol::EventPush;
use crate::core::errors::{SidecarError, SidecarResult};
use crate::core::types::{ChannelKey, ChannelKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// What happened on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TokenBurn,
    LiquidityChange,
    NewMarket,
    AccountUpdate,
    ProgramAccount,
    Slot,
    /// Log line set with nothing we recognise
    Other,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TokenBurn => "token_burn",
            EventKind::LiquidityChange => "liquidity_change",
            EventKind::NewMarket => "new_market",
            EventKind::AccountUpdate => "account_update",
            EventKind::ProgramAccount => "program_account",
            EventKind::Slot => "slot",
            EventKind::Other => "other",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded event handed to business logic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEvent {
    pub kind: EventKind,
    pub channel: String,
    /// Transaction signature, when the notification carries one
    pub signature: Option<String>,
    pub slot: Option<u64>,
    /// Account or program address the event is about
    pub target: Option<String>,
    /// Raw notification payload
    pub data: Value,
}

impl ChainEvent {
    /// Idempotency key: kind plus signature, or kind plus slot for
    /// signature-less events; `None` disables deduplication
    pub fn dedup_key(&self) -> Option<String> {
        match (&self.signature, self.slot) {
            (Some(signature), _) => Some(format!("{}:{}", self.kind, signature)),
            (None, Some(slot)) => {
                let target = self.target.as_deref().unwrap_or("-");
                Some(format!("{}:{}:{}", self.kind, target, slot))
            }
            (None, None) => None,
        }
    }
}

/// Decoder seam
pub trait EventDecoder: Send + Sync {
    /// `Ok(None)` drops the push as uninteresting
    fn decode(&self, push: &EventPush) -> SidecarResult<Option<ChainEvent>>;
}

/// Default decoder: classifies log notifications by instruction names
#[derive(Debug, Clone, Default)]
pub struct LogClassifier {
    /// Drop log notifications of failed transactions
    pub skip_failed: bool,
}

impl LogClassifier {
    pub fn new() -> Self {
        Self { skip_failed: true }
    }

    /// First matching kind wins; burns are checked before liquidity since a
    /// withdraw burns LP tokens too
    pub fn classify_logs<S: AsRef<str>>(logs: &[S]) -> EventKind {
        let mentions = |needles: &[&str]| {
            logs.iter()
                .any(|line| needles.iter().any(|needle| line.as_ref().contains(needle)))
        };

        if mentions(&["InitializeMarket", "initialize2", "Instruction: CreatePool"]) {
            EventKind::NewMarket
        } else if mentions(&["Instruction: Burn", "Instruction: BurnChecked"]) {
            EventKind::TokenBurn
        } else if mentions(&[
            "Instruction: Deposit",
            "Instruction: Withdraw",
            "Instruction: AddLiquidity",
            "Instruction: RemoveLiquidity",
        ]) {
            EventKind::LiquidityChange
        } else {
            EventKind::Other
        }
    }
}

fn context_slot(data: &Value) -> Option<u64> {
    data.pointer("/context/slot").and_then(Value::as_u64)
}

impl EventDecoder for LogClassifier {
    fn decode(&self, push: &EventPush) -> SidecarResult<Option<ChainEvent>> {
        let key = ChannelKey::parse(&push.channel)?;
        let target = key.target().map(str::to_string);
        let data = &push.data;

        let event = match key.kind() {
            ChannelKind::Logs => {
                let value = data.get("value").ok_or_else(|| {
                    SidecarError::Protocol("log notification without value".into())
                })?;
                if self.skip_failed && !value.get("err").map_or(true, Value::is_null) {
                    return Ok(None);
                }
                let logs: Vec<&str> = value
                    .get("logs")
                    .and_then(Value::as_array)
                    .map(|lines| lines.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                ChainEvent {
                    kind: Self::classify_logs(&logs),
                    channel: push.channel.clone(),
                    signature: value.get("signature").and_then(Value::as_str).map(str::to_string),
                    slot: context_slot(data),
                    target,
                    data: data.clone(),
                }
            }
            ChannelKind::Account => ChainEvent {
                kind: EventKind::AccountUpdate,
                channel: push.channel.clone(),
                signature: None,
                slot: context_slot(data),
                target,
                data: data.clone(),
            },
            ChannelKind::Program => ChainEvent {
                kind: EventKind::ProgramAccount,
                channel: push.channel.clone(),
                signature: None,
                slot: context_slot(data),
                target: data
                    .pointer("/value/pubkey")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or(target),
                data: data.clone(),
            },
            ChannelKind::Slot => ChainEvent {
                kind: EventKind::Slot,
                channel: push.channel.clone(),
                signature: None,
                slot: data.get("slot").and_then(Value::as_u64),
                target: None,
                data: data.clone(),
            },
        };
        Ok(Some(event))
    }
}
