use std::sync::Arc;

use async_trait::async_trait;
use courier_channels::{ContextError, ContextMessage, ContextProvider};
use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::client::LarkClient;
use crate::error::NO_HISTORY_PERMISSION_CODE;

/// [`ContextProvider`] reading thread history through the message list API.
pub struct LarkContext {
    client: Arc<LarkClient>,
}

impl LarkContext {
    pub fn new(client: Arc<LarkClient>) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
struct MessageList {
    #[serde(default)]
    items: Vec<ListedMessage>,
}

#[derive(Deserialize)]
struct ListedMessage {
    #[serde(default)]
    chat_id: String,
    #[serde(default)]
    deleted: bool,
    sender: Option<Sender>,
    body: Option<Body>,
}

#[derive(Deserialize)]
struct Sender {
    #[serde(default)]
    id: String,
    #[serde(default)]
    sender_type: String,
}

#[derive(Deserialize)]
struct Body {
    #[serde(default)]
    content: String,
}

impl ListedMessage {
    fn into_context(self) -> Option<ContextMessage> {
        if self.deleted {
            return None;
        }
        let raw = self.body?.content;
        let speaker = match self.sender {
            Some(s) if s.sender_type == "app" => "assistant".to_string(),
            Some(s) if !s.id.is_empty() => s.id,
            _ => self.chat_id,
        };
        Some(ContextMessage {
            speaker,
            body: extract_text(&raw),
        })
    }
}

/// Text of a `{"text": ...}` body, or the raw content for other types.
fn extract_text(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("text").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| raw.to_string())
}

#[async_trait]
impl ContextProvider for LarkContext {
    async fn fetch_recent(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<ContextMessage>, ContextError> {
        let page_size = limit.clamp(1, 50).to_string();
        let list: MessageList = self
            .client
            .call(
                Method::GET,
                "/open-apis/im/v1/messages",
                &[
                    ("container_id_type", "thread"),
                    ("container_id", thread_id),
                    ("sort_type", "ByCreateTimeDesc"),
                    ("page_size", &page_size),
                ],
                None,
            )
            .await
            .map_err(|e| {
                if e.api_code() == Some(NO_HISTORY_PERMISSION_CODE) {
                    warn!(
                        thread = thread_id,
                        "missing permission to read message history; grant the app im:message history scope"
                    );
                }
                ContextError::Unavailable(e.to_string())
            })?;

        // Newest first from the API; callers want chronological order.
        let mut messages: Vec<ContextMessage> = list
            .items
            .into_iter()
            .filter_map(ListedMessage::into_context)
            .take(limit)
            .collect();
        messages.reverse();

        debug!(thread = thread_id, count = messages.len(), "thread context fetched");
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::config::LarkConfig;
    use mockito::Matcher;
    use serde_json::json;

    use super::*;

    #[test]
    fn text_bodies_are_unwrapped() {
        assert_eq!(extract_text(r#"{"text":"hello"}"#), "hello");
        assert_eq!(extract_text(r#"{"image_key":"img"}"#), r#"{"image_key":"img"}"#);
        assert_eq!(extract_text("not json"), "not json");
    }

    #[tokio::test]
    async fn history_is_chronological_and_labelled() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/open-apis/auth/v3/tenant_access_token/internal")
            .with_status(200)
            .with_body(r#"{"code":0,"msg":"ok","tenant_access_token":"t","expire":7200}"#)
            .create_async()
            .await;
        let list = server
            .mock("GET", "/open-apis/im/v1/messages")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("container_id_type".into(), "thread".into()),
                Matcher::UrlEncoded("container_id".into(), "omt_1".into()),
                Matcher::UrlEncoded("page_size".into(), "10".into()),
            ]))
            .with_status(200)
            .with_body(
                json!({"code": 0, "msg": "ok", "data": {"items": [
                    {"chat_id": "oc", "sender": {"id": "cli_bot", "sender_type": "app"},
                     "body": {"content": "{\"text\":\"second\"}"}},
                    {"chat_id": "oc", "deleted": true, "body": {"content": "{\"text\":\"gone\"}"}},
                    {"chat_id": "oc", "sender": {"id": "ou_user", "sender_type": "user"},
                     "body": {"content": "{\"text\":\"first\"}"}}
                ]}})
                .to_string(),
            )
            .create_async()
            .await;

        let client = LarkClient::new(&LarkConfig {
            app_id: "cli".into(),
            app_secret: "s".into(),
            base_url: server.url(),
            ..LarkConfig::default()
        });
        let ctx = LarkContext::new(Arc::new(client));
        let messages = ctx.fetch_recent("omt_1", 10).await.unwrap();

        assert_eq!(
            messages,
            vec![
                ContextMessage {
                    speaker: "ou_user".into(),
                    body: "first".into()
                },
                ContextMessage {
                    speaker: "assistant".into(),
                    body: "second".into()
                },
            ]
        );
        list.assert_async().await;
    }

    #[tokio::test]
    async fn permission_error_is_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/open-apis/auth/v3/tenant_access_token/internal")
            .with_status(200)
            .with_body(r#"{"code":0,"msg":"ok","tenant_access_token":"t","expire":7200}"#)
            .create_async()
            .await;
        let _list = server
            .mock("GET", "/open-apis/im/v1/messages")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":99991672,"msg":"Access denied"}"#)
            .create_async()
            .await;

        let client = LarkClient::new(&LarkConfig {
            app_id: "cli".into(),
            app_secret: "s".into(),
            base_url: server.url(),
            ..LarkConfig::default()
        });
        let err = LarkContext::new(Arc::new(client))
            .fetch_recent("omt_1", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::Unavailable(msg) if msg.contains("99991672")));
    }
}
