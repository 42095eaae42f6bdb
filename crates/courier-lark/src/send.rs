use std::sync::Arc;

use async_trait::async_trait;
use courier_channels::{DeliveryError, DeliveryGateway, OutboundContent};
use courier_core::types::{ChatKind, DeliveryTarget, MessageRef, PayloadKind};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::card::render;
use crate::client::LarkClient;
use crate::error::{LarkError, EDIT_LIMIT_CODE};

/// Where a new message for a target is posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Plain message in the chat.
    Create { chat_id: String },
    /// Reply to a message, optionally opening a thread under it.
    Reply { message_id: String, in_thread: bool },
}

impl Route {
    /// Direct chats get a plain message; group replies stay in the thread
    /// they came from or open a new one.
    pub fn for_target(target: &DeliveryTarget) -> Self {
        match (&target.chat_kind, &target.reply_to) {
            (ChatKind::P2p, _) | (_, None) => Route::Create {
                chat_id: target.chat_id.clone(),
            },
            (_, Some(message_id)) => Route::Reply {
                message_id: message_id.clone(),
                in_thread: target.thread_id.is_none(),
            },
        }
    }
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: String,
}

/// [`DeliveryGateway`] backed by the Lark IM v1 message API.
pub struct LarkGateway {
    client: Arc<LarkClient>,
}

impl LarkGateway {
    pub fn new(client: Arc<LarkClient>) -> Self {
        Self { client }
    }

    async fn post(
        &self,
        target: &DeliveryTarget,
        content: &OutboundContent,
    ) -> Result<MessageRef, LarkError> {
        let rendered = render(content);
        let sent: SentMessage = match Route::for_target(target) {
            Route::Create { chat_id } => {
                debug!(chat = %chat_id, msg_type = rendered.msg_type, "creating message");
                let body = json!({
                    "receive_id": chat_id,
                    "msg_type": rendered.msg_type,
                    "content": rendered.content,
                });
                self.client
                    .call(
                        Method::POST,
                        "/open-apis/im/v1/messages",
                        &[("receive_id_type", "chat_id")],
                        Some(&body),
                    )
                    .await?
            }
            Route::Reply {
                message_id,
                in_thread,
            } => {
                debug!(reply_to = %message_id, in_thread, msg_type = rendered.msg_type, "replying to message");
                let mut body = json!({
                    "msg_type": rendered.msg_type,
                    "content": rendered.content,
                });
                if in_thread {
                    body["reply_in_thread"] = json!(true);
                }
                let path = format!("/open-apis/im/v1/messages/{message_id}/reply");
                self.client.call(Method::POST, &path, &[], Some(&body)).await?
            }
        };
        Ok(MessageRef(sent.message_id))
    }

    async fn update(&self, message_ref: &MessageRef, content: &OutboundContent) -> Result<(), LarkError> {
        let rendered = render(content);
        let path = format!("/open-apis/im/v1/messages/{}", message_ref.as_str());
        // Text messages are edited with PUT; cards are patched in place.
        match content.kind {
            PayloadKind::Text => {
                let body = json!({ "msg_type": rendered.msg_type, "content": rendered.content });
                self.client.call_empty(Method::PUT, &path, &[], Some(&body)).await
            }
            PayloadKind::Card => {
                let body = json!({ "content": rendered.content });
                self.client.call_empty(Method::PATCH, &path, &[], Some(&body)).await
            }
        }
    }
}

fn to_delivery_error(err: LarkError, message_ref: Option<&MessageRef>) -> DeliveryError {
    match err {
        LarkError::Api { code, .. } if code == EDIT_LIMIT_CODE => DeliveryError::EditLimitExceeded {
            message_ref: message_ref.map(|r| r.to_string()).unwrap_or_default(),
        },
        LarkError::Api { code, msg } => DeliveryError::Rejected { code, message: msg },
        other => DeliveryError::Transport(other.to_string()),
    }
}

#[async_trait]
impl DeliveryGateway for LarkGateway {
    async fn send(
        &self,
        target: &DeliveryTarget,
        content: &OutboundContent,
    ) -> Result<MessageRef, DeliveryError> {
        let message_ref = self
            .post(target, content)
            .await
            .map_err(|e| to_delivery_error(e, None))?;
        info!(message = %message_ref, kind = %content.kind, bytes = content.text.len(), "message sent");
        Ok(message_ref)
    }

    async fn edit(
        &self,
        message_ref: &MessageRef,
        content: &OutboundContent,
    ) -> Result<(), DeliveryError> {
        self.update(message_ref, content)
            .await
            .map_err(|e| to_delivery_error(e, Some(message_ref)))?;
        info!(message = %message_ref, kind = %content.kind, bytes = content.text.len(), "message edited");
        Ok(())
    }

    fn rendered_size(&self, content: &OutboundContent) -> usize {
        render(content).content.len()
    }
}
