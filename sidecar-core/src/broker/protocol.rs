//! Local wire protocol (newline-delimited JSON)
//!
//! Call channel:
//! ```text
//! → {"id": 1, "method": "getSlot", "params": [], "timeoutMs": 5000}
//! ← {"id": 1, "result": 123}
//! ← {"id": 1, "error": "not connected (state: RECONNECTING)", "errorKind": "not_connected"}
//! ```
//!
//! Event channel:
//! ```text
//! → {"type": "subscribe", "channel": "logs:<addr>"}
//! ← {"type": "subscribed", "channel": "logs:<addr>"}
//! ← {"channel": "logs:<addr>", "data": {...}}
//! ```

use crate::core::errors::{SidecarError, SidecarResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Longest accepted request line, newline included
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Call-channel request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    /// Echoed in the response; string or number
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Call-channel response; exactly one of `result` and `error` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl CallResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
            error_kind: None,
        }
    }

    pub fn err(id: Value, error: &SidecarError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
        }
    }

    pub fn from_result(id: Value, result: SidecarResult<Value>) -> Self {
        match result {
            Ok(value) => Self::ok(id, value),
            Err(e) => Self::err(id, &e),
        }
    }

    /// Rebuild the typed outcome on the client side
    pub fn into_result(self) -> SidecarResult<Value> {
        match (self.result, self.error) {
            (_, Some(message)) => Err(SidecarError::from_wire(
                self.error_kind.as_deref().unwrap_or("protocol"),
                &message,
            )),
            (Some(result), None) => Ok(result),
            // `"result": null` is dropped by the Option; it is still a success
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Event-channel request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventRequest {
    Subscribe {
        channel: String,
        /// Accepted for compatibility; does not affect channel identity
        #[serde(default, skip_serializing_if = "Value::is_null")]
        params: Value,
    },
    Unsubscribe {
        channel: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        params: Value,
    },
}

/// Event-channel acknowledgement or error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventReply {
    Subscribed {
        channel: String,
    },
    Unsubscribed {
        channel: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        error: String,
        #[serde(rename = "errorKind")]
        error_kind: String,
    },
}

impl EventReply {
    pub fn error(channel: Option<String>, error: &SidecarError) -> Self {
        EventReply::Error {
            channel,
            error: error.to_string(),
            error_kind: error.kind().to_string(),
        }
    }
}

/// Event pushed to every member of a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPush {
    pub channel: String,
    pub data: Value,
}

/// Anything the broker writes on the event channel
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EventFrame {
    Reply(EventReply),
    Push(EventPush),
}

/// Serialize a frame as one line, newline included
pub fn encode_line<T: Serialize>(frame: &T) -> SidecarResult<String> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// One newline-terminated frame read off a local connection
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Raw line bytes without the trailing newline
    Line(Vec<u8>),
    /// Line longer than the limit; its bytes were discarded
    TooLong,
    Eof,
}

impl Frame {
    /// Error for an oversized frame
    pub fn too_long_error() -> SidecarError {
        SidecarError::Protocol(format!("frame exceeds {} bytes", MAX_FRAME_BYTES))
    }
}

/// Read the next frame, holding at most `max_len` bytes in memory
///
/// Bytes are returned as-is; UTF-8 is checked by the JSON decoder so a bad
/// line is answered instead of ending the connection. A final line without
/// a newline is still returned before `Eof`.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut overflow = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (overflow, line.is_empty()) {
                (true, _) => Frame::TooLong,
                (false, true) => Frame::Eof,
                (false, false) => Frame::Line(line),
            });
        }

        let (used, done) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        let content = if done { &available[..used - 1] } else { &available[..used] };
        if !overflow {
            if line.len() + content.len() > max_len {
                overflow = true;
                line = Vec::new();
            } else {
                line.extend_from_slice(content);
            }
        }
        reader.consume(used);

        if done {
            return Ok(if overflow { Frame::TooLong } else { Frame::Line(line) });
        }
    }
}

/// Whether a raw line carries nothing but whitespace
pub fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// Parse a call request; malformed input yields the error response to send
///
/// The id is salvaged from the raw JSON when possible so the client can
/// still correlate the failure.
pub fn parse_call_request(line: &[u8]) -> Result<CallRequest, CallResponse> {
    serde_json::from_slice::<CallRequest>(line).map_err(|e| {
        let id = serde_json::from_slice::<Value>(line)
            .ok()
            .and_then(|v| v.get("id").cloned())
            .unwrap_or(Value::Null);
        CallResponse::err(id, &SidecarError::Protocol(format!("malformed request: {}", e)))
    })
}

/// Parse an event-channel request
pub fn parse_event_request(line: &[u8]) -> Result<EventRequest, EventReply> {
    serde_json::from_slice::<EventRequest>(line).map_err(|e| {
        EventReply::error(None, &SidecarError::Protocol(format!("malformed request: {}", e)))
    })
}
