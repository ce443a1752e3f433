//! Wire framing for relay output.
//!
//! Streaming frames follow the chat widget's SSE convention:
//!
//! ```text
//! data: {"text":"He"}
//!
//! data: [DONE]
//!
//! ```
//!
//! Failures after the stream has started are signalled in-band with
//! `data: {"error":"...","code":"..."}`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DONE_SENTINEL: &str = "[DONE]";

/// One outbound unit on a relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Data(String),
    Done,
    Error { code: String, message: String },
}

impl WireEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WireEvent::Data(_))
    }
}

/// Body of the synchronous response and of each data frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBody {
    pub text: String,
}

/// Error body, used both as a JSON response and as an in-band frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame is missing the 'data: ' prefix: {0:?}")]
    MissingPrefix(String),

    #[error("Frame payload is not a text or error object: {0:?}")]
    InvalidPayload(String),

    #[error("Trailing bytes after last frame: {0:?}")]
    Truncated(String),
}

/// Encode one event as an SSE frame.
pub fn encode(event: &WireEvent) -> Bytes {
    let payload = match event {
        WireEvent::Data(text) => json_string(&TextBody { text: text.clone() }),
        WireEvent::Done => DONE_SENTINEL.to_string(),
        WireEvent::Error { code, message } => json_string(&ErrorBody {
            error: message.clone(),
            code: code.clone(),
        }),
    };
    Bytes::from(format!("data: {payload}\n\n"))
}

/// Encode the complete reply of the synchronous path.
pub fn encode_completion(text: String) -> TextBody {
    TextBody { text }
}

fn json_string<T: Serialize>(value: &T) -> String {
    // Serializing a struct of plain strings cannot fail.
    serde_json::to_string(value).unwrap_or_default()
}

/// Decode a concatenation of frames produced by [`encode`].
///
/// Comment frames (lines starting with `:`) such as keep-alives are skipped.
pub fn decode(stream: &str) -> Result<Vec<WireEvent>, DecodeError> {
    let mut events = Vec::new();
    let mut rest = stream;

    while !rest.is_empty() {
        let Some(end) = rest.find("\n\n") else {
            return Err(DecodeError::Truncated(rest.to_string()));
        };
        let frame = &rest[..end];
        rest = &rest[end + 2..];

        if frame.starts_with(':') {
            continue;
        }
        let payload = frame
            .strip_prefix("data: ")
            .ok_or_else(|| DecodeError::MissingPrefix(frame.to_string()))?;
        events.push(decode_payload(payload)?);
    }

    Ok(events)
}

fn decode_payload(payload: &str) -> Result<WireEvent, DecodeError> {
    if payload == DONE_SENTINEL {
        return Ok(WireEvent::Done);
    }
    if let Ok(body) = serde_json::from_str::<TextBody>(payload) {
        return Ok(WireEvent::Data(body.text));
    }
    if let Ok(body) = serde_json::from_str::<ErrorBody>(payload) {
        return Ok(WireEvent::Error {
            code: body.code,
            message: body.error,
        });
    }
    Err(DecodeError::InvalidPayload(payload.to_string()))
}
