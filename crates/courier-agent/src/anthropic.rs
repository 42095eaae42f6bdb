use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::provider::{
    Completion, CompletionProvider, CompletionRequest, CompletionStream, ProviderError,
};

const API_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";
const OAUTH_TOKEN_PREFIX: &str = "sk-ant-oat01-";

/// Anthropic Messages API client (also works with compatible gateways).
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    is_oauth: bool,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>, timeout: Duration) -> Self {
        let is_oauth = api_key.starts_with(OAUTH_TOKEN_PREFIX);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeout, using defaults");
                reqwest::Client::new()
            });
        Self {
            client,
            is_oauth,
            api_key,
            base_url: base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
        }
    }

    /// Apply auth headers. OAuth tokens use Bearer + beta header,
    /// regular API keys use x-api-key.
    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.is_oauth {
            builder
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("anthropic-beta", OAUTH_BETA)
        } else {
            builder.header("x-api-key", &self.api_key)
        }
    }

    async fn post(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let builder = self
            .client
            .post(&url)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body);

        let resp = self.apply_auth(builder).send().await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        Ok(resp)
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn invoke(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        let body = build_request_body(req, false);
        debug!(model = %req.model, max_tokens = req.max_tokens, "sending request to Anthropic");

        let api_resp: ApiResponse = self
            .post(&body)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn invoke_streaming(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        let body = build_request_body(req, true);
        debug!(model = %req.model, max_tokens = req.max_tokens, "sending streaming request to Anthropic");

        let resp = self.post(&body).await?;
        Ok(crate::anthropic_stream::event_stream(resp))
    }
}

fn build_request_body(req: &CompletionRequest, stream: bool) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": m.role,
                "content": m.content,
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "max_tokens": req.max_tokens,
        "messages": messages,
        "stream": stream,
    });

    if let Some(ref system) = req.system {
        body["system"] = serde_json::Value::String(system.clone());
    }

    body
}

fn parse_response(resp: ApiResponse) -> Completion {
    let text = resp
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Unknown => None,
        })
        .collect::<Vec<_>>()
        .join("");

    Completion {
        text,
        model: resp.model,
        tokens_in: resp.usage.input_tokens,
        tokens_out: resp.usage.output_tokens,
        stop_reason: resp.stop_reason.unwrap_or_default(),
    }
}

// Anthropic API response types (private, deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Message;

    #[test]
    fn request_body_includes_system_only_when_set() {
        let req = CompletionRequest::prompt("m", "hi", 100);
        let body = build_request_body(&req, false);
        assert!(body.get("system").is_none());
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["stream"], false);

        let body = build_request_body(&req.with_system("be brief"), true);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn request_body_preserves_roles() {
        let req = CompletionRequest {
            model: "m".into(),
            system: None,
            messages: vec![Message::user("q"), Message::assistant("a")],
            max_tokens: 10,
        };
        let body = build_request_body(&req, false);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][1]["role"], "assistant");
    }

    #[test]
    fn response_joins_text_blocks_and_skips_unknown() {
        let raw = r#"{
            "model": "claude-test",
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Hello "},
                {"type": "text", "text": "there."}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 9}
        }"#;
        let resp: ApiResponse = serde_json::from_str(raw).unwrap();
        let completion = parse_response(resp);
        assert_eq!(completion.text, "Hello there.");
        assert_eq!(completion.tokens_out, 9);
        assert_eq!(completion.stop_reason, "end_turn");
    }

    #[test]
    fn oauth_tokens_are_detected() {
        let p = AnthropicProvider::new(
            "sk-ant-oat01-abc".into(),
            Some("https://example.com/".into()),
            Duration::from_secs(5),
        );
        assert!(p.is_oauth);
        assert_eq!(p.base_url, "https://example.com");
    }
}
