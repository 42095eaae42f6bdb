//! Decoding of event-subscription callbacks into [`InboundEvent`]s.

use chrono::{DateTime, Utc};
use courier_core::types::{ChatKind, ContentKind, InboundEvent, Mention};
use serde::Deserialize;
use serde_json::Value;

use crate::error::LarkError;

pub const MESSAGE_RECEIVE_EVENT: &str = "im.message.receive_v1";

/// What a callback body asks of us.
#[derive(Debug)]
pub enum Callback {
    /// Endpoint ownership check; echo the challenge back.
    Challenge { challenge: String },
    /// A received chat message.
    Message(Box<InboundEvent>),
    /// Any other event type; acknowledged and dropped.
    Ignored { event_type: String },
    /// Body encrypted with the app's encrypt key.
    Encrypted,
}

#[derive(Deserialize)]
struct MessageEvent {
    message: RawMessage,
}

#[derive(Deserialize)]
struct RawMessage {
    message_id: String,
    chat_id: String,
    #[serde(default)]
    thread_id: Option<String>,
    chat_type: String,
    message_type: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    mentions: Vec<RawMention>,
}

#[derive(Deserialize)]
struct RawMention {
    key: String,
    #[serde(default)]
    id: MentionIds,
    name: Option<String>,
}

#[derive(Deserialize, Default)]
struct MentionIds {
    open_id: Option<String>,
    user_id: Option<String>,
}

/// Verification token carried by the body (v2 header or v1 top level).
pub fn verification_token(body: &Value) -> Option<&str> {
    body.pointer("/header/token")
        .or_else(|| body.get("token"))
        .and_then(Value::as_str)
}

pub fn classify(body: Value) -> Result<Callback, LarkError> {
    if body.get("encrypt").is_some() {
        return Ok(Callback::Encrypted);
    }

    if body.get("type").and_then(Value::as_str) == Some("url_verification") {
        let challenge = body
            .get("challenge")
            .and_then(Value::as_str)
            .ok_or_else(|| LarkError::InvalidEvent("url_verification without challenge".into()))?;
        return Ok(Callback::Challenge {
            challenge: challenge.to_string(),
        });
    }

    let event_type = body
        .pointer("/header/event_type")
        .or_else(|| body.pointer("/event/type"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if event_type != MESSAGE_RECEIVE_EVENT {
        return Ok(Callback::Ignored { event_type });
    }

    parse_message_event(body).map(|e| Callback::Message(Box::new(e)))
}

/// Decode an `im.message.receive_v1` body, keeping the original as `raw_payload`.
pub fn parse_message_event(body: Value) -> Result<InboundEvent, LarkError> {
    let event = body
        .get("event")
        .cloned()
        .ok_or_else(|| LarkError::InvalidEvent("missing event".into()))?;
    let MessageEvent { message } = serde_json::from_value(event)
        .map_err(|e| LarkError::InvalidEvent(format!("malformed message event: {e}")))?;

    let str_at = |ptr: &str| {
        body.pointer(ptr)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let received_at = str_at("/header/create_time")
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Ok(InboundEvent {
        primary_id: str_at("/header/event_id"),
        secondary_id: str_at("/uuid"),
        message_id: Some(message.message_id).filter(|s| !s.is_empty()),
        conversation_id: message.chat_id,
        thread_id: message.thread_id.filter(|s| !s.is_empty()),
        chat_kind: ChatKind::parse(&message.chat_type),
        content_kind: ContentKind::parse(&message.message_type),
        content: message.content,
        mentions: message
            .mentions
            .into_iter()
            .map(|m| Mention {
                key: m.key,
                open_id: m.id.open_id,
                user_id: m.id.user_id,
                name: m.name,
            })
            .collect(),
        received_at,
        raw_payload: body,
    })
}
