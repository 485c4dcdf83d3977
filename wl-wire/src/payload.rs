//! Typed builders for every outbound payload shape.
//!
//! Each builder returns a ready-to-encode [`Frame`] with a fresh message id
//! where the payload carries one. Recipients are expected to already be
//! normalized JIDs.

use serde_json::json;
use uuid::Uuid;

use wl_core::constants::presence;
use wl_core::error::{WlError, WlResult};

use crate::frame::{Frame, FrameTag};

fn message_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A text message, optionally quoting an earlier message by id.
pub fn text(to: &str, body: &str, quoted_id: Option<&str>) -> Frame {
    let mut data = json!({
        "id": message_id(),
        "to": to,
        "body": body,
    });
    if let Some(quoted) = quoted_id {
        data["quoted_id"] = json!(quoted);
    }
    Frame::new(FrameTag::text(), data)
}

/// A media message referencing an already-uploaded blob.
pub fn media(
    to: &str,
    url: &str,
    mime_type: &str,
    file_name: &str,
    file_size: u64,
    caption: Option<&str>,
) -> Frame {
    let mut data = json!({
        "id": message_id(),
        "to": to,
        "url": url,
        "mime_type": mime_type,
        "file_name": file_name,
        "file_size": file_size,
    });
    if let Some(caption) = caption {
        data["caption"] = json!(caption);
    }
    Frame::new(FrameTag::media(), data)
}

/// A geographic location share.
pub fn location(to: &str, latitude: f64, longitude: f64, name: Option<&str>) -> Frame {
    let mut data = json!({
        "id": message_id(),
        "to": to,
        "latitude": latitude,
        "longitude": longitude,
    });
    if let Some(name) = name {
        data["name"] = json!(name);
    }
    Frame::new(FrameTag::location(), data)
}

/// A contact card share (vCard text).
pub fn contact(to: &str, contact_name: &str, vcard: &str) -> Frame {
    Frame::new(
        FrameTag::contact(),
        json!({
            "id": message_id(),
            "to": to,
            "contact_name": contact_name,
            "vcard": vcard,
        }),
    )
}

/// A group management command.
///
/// `group_id` is absent for `create`; `subject` only accompanies `create` and
/// `subject`; `participants` only accompanies membership commands.
pub fn group(
    command: &str,
    group_id: Option<&str>,
    subject: Option<&str>,
    participants: &[String],
) -> Frame {
    let mut data = json!({
        "id": message_id(),
        "command": command,
    });
    if let Some(group_id) = group_id {
        data["group_id"] = json!(group_id);
    }
    if let Some(subject) = subject {
        data["subject"] = json!(subject);
    }
    if !participants.is_empty() {
        data["participants"] = json!(participants);
    }
    Frame::new(FrameTag::group(), data)
}

/// A presence update, broadcast or directed at one chat.
pub fn presence_update(state: &str, to: Option<&str>) -> WlResult<Frame> {
    if !presence::ALL.contains(&state) {
        return Err(WlError::BadParam(format!("invalid presence state: {state}")));
    }
    let mut data = json!({ "state": state });
    if let Some(to) = to {
        data["to"] = json!(to);
    }
    Ok(Frame::new(FrameTag::presence(), data))
}

/// Connection-open announcement, the first frame after the transport opens.
pub fn init(session_id: &str, client_id: &str) -> Frame {
    Frame::new(
        FrameTag::init(),
        json!({
            "session_id": session_id,
            "client_id": client_id,
        }),
    )
}

/// Liveness probe.
pub fn ping() -> Frame {
    Frame::new(FrameTag::ping(), json!({}))
}

/// Liveness reply.
pub fn pong() -> Frame {
    Frame::new(FrameTag::pong(), json!({}))
}
