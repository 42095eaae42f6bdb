use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::stream::StreamEvent;

/// A lazy, finite, non-restartable sequence of completion events.
pub type CompletionStream = BoxStream<'static, StreamEvent>;

/// A single message in the prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Request to a completion provider.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    /// Optional system prompt.
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
}

impl CompletionRequest {
    /// Single-turn request carrying one user prompt.
    pub fn prompt(model: impl Into<String>, prompt: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            system: None,
            messages: vec![Message::user(prompt)],
            max_tokens,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Response from a completion provider (non-streaming).
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub tokens_in: u32,
    /// Output tokens charged against `max_tokens`.
    pub tokens_out: u32,
    pub stop_reason: String,
}

/// Common interface for text-completion backends.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send a non-streaming request and wait for the full response.
    async fn invoke(&self, req: &CompletionRequest) -> Result<Completion, ProviderError>;

    /// Start a streaming request.
    ///
    /// The returned stream yields `TextDelta` events and ends with `Done`
    /// (or `Error`). Default: falls back to `invoke` and replays the result
    /// as one delta.
    async fn invoke_streaming(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        let resp = self.invoke(req).await?;
        let events = vec![
            StreamEvent::TextDelta { text: resp.text },
            StreamEvent::Done {
                model: resp.model,
                tokens_in: resp.tokens_in,
                tokens_out: resp.tokens_out,
                stop_reason: resp.stop_reason,
            },
        ];
        Ok(Box::pin(tokio_stream::iter(events)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Stream error: {0}")]
    Stream(String),
}
