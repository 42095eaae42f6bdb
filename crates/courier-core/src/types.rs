use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a queued task (UUIDv7, time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Platform identifier of a message that was sent by us and may be edited later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef(pub String);

impl MessageRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of conversation an event arrived in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    /// One-to-one chat with the bot.
    P2p,
    /// Group chat; the bot only answers when mentioned.
    Group,
    /// Anything the platform adds later.
    Other(String),
}

impl ChatKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "p2p" => ChatKind::P2p,
            "group" => ChatKind::Group,
            other => ChatKind::Other(other.to_string()),
        }
    }
}

/// Message payload type as declared by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Other(String),
}

impl ContentKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "text" => ContentKind::Text,
            other => ContentKind::Other(other.to_string()),
        }
    }
}

/// Outbound payload kinds; each has its own maximum byte size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Plain text message.
    Text,
    /// Structured interactive card rendered from markdown.
    Card,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadKind::Text => write!(f, "text"),
            PayloadKind::Card => write!(f, "card"),
        }
    }
}

/// A user or bot mentioned inside an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    /// Placeholder key inside the message text (e.g. `@_user_1`).
    pub key: String,
    pub open_id: Option<String>,
    pub user_id: Option<String>,
    pub name: Option<String>,
}

/// An inbound conversational event, normalised from the platform payload.
///
/// Immutable once created. The dedup key is derived from the id fields on
/// demand and never stored next to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Protocol-level event id (`header.event_id` for v2 events).
    pub primary_id: Option<String>,
    /// Legacy event id (`uuid` for v1 events).
    pub secondary_id: Option<String>,
    /// Platform id of the message carried by the event.
    pub message_id: Option<String>,
    /// Chat the message was posted in.
    pub conversation_id: String,
    /// Thread the message belongs to, if any.
    pub thread_id: Option<String>,
    pub chat_kind: ChatKind,
    pub content_kind: ContentKind,
    /// Raw message content string exactly as delivered (JSON for text messages).
    pub content: String,
    #[serde(default)]
    pub mentions: Vec<Mention>,
    /// Full raw payload for fields the pipeline does not model.
    pub raw_payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Where replies for an event should go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub chat_id: String,
    pub chat_kind: ChatKind,
    /// Message being answered; replies in groups are threaded under it.
    pub reply_to: Option<String>,
    pub thread_id: Option<String>,
}

impl DeliveryTarget {
    pub fn for_event(event: &InboundEvent) -> Self {
        Self {
            chat_id: event.conversation_id.clone(),
            chat_kind: event.chat_kind.clone(),
            reply_to: event.message_id.clone(),
            thread_id: event.thread_id.clone(),
        }
    }
}

/// A placeholder message sent early and possibly edited with the final answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placeholder {
    pub message_ref: MessageRef,
    pub kind: PayloadKind,
}

/// A unit of work handed from the arrival path to the queue worker.
#[derive(Debug, Clone)]
pub struct QueueTask {
    pub id: TaskId,
    pub event: InboundEvent,
    /// User text extracted from the event content.
    pub parsed_text: String,
    /// Thread used to look up prior context.
    pub thread_ref: Option<String>,
    pub target: DeliveryTarget,
    pub placeholder: Option<Placeholder>,
}
