use async_trait::async_trait;
use courier_core::types::{DeliveryTarget, MessageRef, PayloadKind};
use serde::{Deserialize, Serialize};

use crate::error::{ContextError, DeliveryError};

/// Body of an outbound message or edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundContent {
    pub kind: PayloadKind,
    pub text: String,
}

impl OutboundContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: PayloadKind::Text,
            text: text.into(),
        }
    }

    pub fn card(text: impl Into<String>) -> Self {
        Self {
            kind: PayloadKind::Card,
            text: text.into(),
        }
    }
}

/// Sends and edits messages on the chat platform.
///
/// Implementations must be `Send + Sync`; the pipeline shares one instance
/// between the arrival path (acks) and the queue worker.
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    /// Post a new message for `target` and return its platform reference.
    async fn send(
        &self,
        target: &DeliveryTarget,
        content: &OutboundContent,
    ) -> Result<MessageRef, DeliveryError>;

    /// Replace the body of an existing message.
    async fn edit(
        &self,
        message_ref: &MessageRef,
        content: &OutboundContent,
    ) -> Result<(), DeliveryError>;

    /// Size in bytes of `content` once serialized for the platform.
    ///
    /// Default: the UTF-8 length of the text.
    fn rendered_size(&self, content: &OutboundContent) -> usize {
        content.text.len()
    }
}

/// One prior message in a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub speaker: String,
    pub body: String,
}

/// Reads recent thread history.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Up to `limit` messages from `thread_id`, oldest first.
    async fn fetch_recent(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<ContextMessage>, ContextError>;
}
