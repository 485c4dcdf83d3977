//! Length-prefixed JSON frame codec.
//!
//! Every frame on the chat connection is a 4-byte big-endian length followed
//! by a UTF-8 JSON envelope `{"type": ..., "data": {...}, "timestamp": ...}`.
//! Message frames carry a numeric type code; control frames carry a string
//! name (`ping`, `pong`, `error`, `init`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use wl_core::constants::frame_types;
use wl_core::error::{WlError, WlResult};

/// Upper bound on a single frame's JSON body.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Wire tag of a frame: numeric for messages, named for control frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameTag {
    Code(i64),
    Name(String),
}

impl FrameTag {
    pub fn ping() -> Self {
        Self::Name("ping".into())
    }

    pub fn pong() -> Self {
        Self::Name("pong".into())
    }

    pub fn error() -> Self {
        Self::Name("error".into())
    }

    pub fn init() -> Self {
        Self::Name("init".into())
    }

    pub fn text() -> Self {
        Self::Code(frame_types::TEXT as i64)
    }

    pub fn media() -> Self {
        Self::Code(frame_types::MEDIA as i64)
    }

    pub fn location() -> Self {
        Self::Code(frame_types::LOCATION as i64)
    }

    pub fn contact() -> Self {
        Self::Code(frame_types::CONTACT as i64)
    }

    pub fn group() -> Self {
        Self::Code(frame_types::GROUP as i64)
    }

    pub fn presence() -> Self {
        Self::Code(frame_types::PRESENCE as i64)
    }

    /// Whether this tag names a control frame rather than a message.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Name(_))
    }

    /// The control name, when this is a control tag.
    pub fn control_name(&self) -> Option<&str> {
        match self {
            Self::Name(name) => Some(name),
            Self::Code(_) => None,
        }
    }
}

impl std::fmt::Display for FrameTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code(code) => write!(f, "{code}"),
            Self::Name(name) => write!(f, "{name}"),
        }
    }
}

/// A decoded frame: tag, payload, and send-time timestamp (unix seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub tag: FrameTag,
    pub data: Value,
    pub timestamp: i64,
}

impl Frame {
    /// Build a frame stamped with the current time.
    pub fn new(tag: FrameTag, data: Value) -> Self {
        Self {
            tag,
            data,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Encode a frame to its wire form: `[u32 BE length][JSON body]`.
pub fn encode(frame: &Frame) -> WlResult<Vec<u8>> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(WlError::Protocol(format!(
            "frame body of {} bytes exceeds limit",
            body.len()
        )));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a frame from its wire form.
pub fn decode(bytes: &[u8]) -> WlResult<Frame> {
    if bytes.len() < 4 {
        return Err(WlError::Protocol("Message too short".into()));
    }

    let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if declared > MAX_FRAME_BYTES {
        return Err(WlError::Protocol(format!(
            "declared frame length {declared} exceeds limit"
        )));
    }
    let available = bytes.len() - 4;
    if declared > available {
        return Err(WlError::Protocol(format!(
            "declared frame length {declared} exceeds available {available} bytes"
        )));
    }

    serde_json::from_slice(&bytes[4..4 + declared])
        .map_err(|e| WlError::Protocol(format!("malformed frame body: {e}")))
}
