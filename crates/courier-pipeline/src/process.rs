use std::sync::Arc;

use async_trait::async_trait;
use courier_agent::{CompletionRequest, CompletionResult, TruncationGuard};
use courier_channels::{ContextMessage, ContextProvider, DeliveryManager, DeliveryOutcome};
use courier_core::config::{CourierConfig, ReplyConfig};
use courier_core::types::QueueTask;
use courier_core::CourierError;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::queue::TaskProcessor;

/// Per-reply knobs taken from config.
#[derive(Debug, Clone)]
pub struct ReplySettings {
    pub model: String,
    pub max_tokens: u32,
    pub streaming: bool,
    pub history_limit: usize,
    pub reply: ReplyConfig,
}

impl From<&CourierConfig> for ReplySettings {
    fn from(cfg: &CourierConfig) -> Self {
        Self {
            model: cfg.provider.model.clone(),
            max_tokens: cfg.provider.max_tokens,
            streaming: cfg.provider.streaming,
            history_limit: cfg.context.history_limit,
            reply: cfg.reply.clone(),
        }
    }
}

/// Queue worker body: context, completion, rendering, delivery.
pub struct ReplyProcessor {
    context: Arc<dyn ContextProvider>,
    guard: TruncationGuard,
    delivery: DeliveryManager,
    settings: ReplySettings,
}

impl ReplyProcessor {
    pub fn new(
        context: Arc<dyn ContextProvider>,
        guard: TruncationGuard,
        delivery: DeliveryManager,
        settings: ReplySettings,
    ) -> Self {
        Self {
            context,
            guard,
            delivery,
            settings,
        }
    }

    async fn load_context(&self, task: &QueueTask) -> Vec<ContextMessage> {
        let Some(thread) = task.thread_ref.as_deref() else {
            return Vec::new();
        };
        match self.context.fetch_recent(thread, self.settings.history_limit).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(task = %task.id, thread, error = %e, "thread context unavailable, answering without it");
                Vec::new()
            }
        }
    }

    fn request(&self, prompt: String) -> CompletionRequest {
        let req = CompletionRequest::prompt(&self.settings.model, prompt, self.settings.max_tokens);
        if self.settings.reply.deep_thinking {
            req.with_system(&self.settings.reply.deep_thinking_prompt)
        } else {
            req
        }
    }

    /// Model answer, or the apology text when the provider fails.
    async fn answer(&self, task: &QueueTask, prompt: String) -> String {
        let req = self.request(prompt);
        match self.guard.complete(&req, self.settings.streaming).await {
            Ok(result) => {
                info!(
                    task = %task.id,
                    chars = result.text.chars().count(),
                    used_tokens = result.used_tokens,
                    truncated = result.declared_truncated,
                    continued = result.continued,
                    ceiling_hit = result.ceiling_hit,
                    "completion finished"
                );
                if let Some(err) = truncation_notice(&result) {
                    if result.continued {
                        info!(task = %task.id, code = err.code(), "{err}, continuation appended");
                    } else {
                        warn!(task = %task.id, code = err.code(), "{err}, delivering partial answer");
                    }
                }
                result.text
            }
            Err(e) => {
                let err = CourierError::ProviderUnavailable(e.to_string());
                warn!(
                    task = %task.id,
                    provider = self.guard.provider_name(),
                    code = err.code(),
                    error = %e,
                    "completion failed, sending apology"
                );
                self.settings.reply.apology.clone()
            }
        }
    }

    fn decorate(&self, answer: &str) -> String {
        let reply = &self.settings.reply;
        if reply.deep_thinking {
            format!("{}\n\n{}{}", reply.deep_thinking_prefix, answer, reply.deep_thinking_suffix)
        } else {
            format!("{}\n\n{}", reply.standard_prefix, answer)
        }
    }
}

/// Internal truncation signal for a completion judged cut short.
fn truncation_notice(result: &CompletionResult) -> Option<CourierError> {
    result.declared_truncated.then(|| CourierError::TruncatedResponse {
        used_tokens: result.used_tokens,
    })
}

/// Prompt sent to the model: numbered thread history, then the user text.
pub fn render_prompt(context: &[ContextMessage], user_text: &str) -> String {
    if context.is_empty() {
        return user_text.to_string();
    }
    let mut prompt = format!("📚 Thread context (last {} messages):\n", context.len());
    for (i, msg) in context.iter().enumerate() {
        prompt.push_str(&format!("{}. {}: {}\n", i + 1, msg.speaker, msg.body));
    }
    prompt.push_str("\nCurrent user message: ");
    prompt.push_str(user_text);
    prompt
}

#[async_trait]
impl TaskProcessor for ReplyProcessor {
    async fn process(&self, task: QueueTask) -> Result<(), PipelineError> {
        debug!(task = %task.id, chat = %task.target.chat_id, "processing task");

        let context = self.load_context(&task).await;
        let prompt = render_prompt(&context, &task.parsed_text);
        let answer = self.answer(&task, prompt).await;
        let reply = self.decorate(&answer);

        match self
            .delivery
            .deliver(&reply, &task.target, task.placeholder.as_ref())
            .await
        {
            DeliveryOutcome::Dropped => Err(CourierError::DeliveryFailure(format!(
                "reply for task {} could not be delivered",
                task.id
            ))
            .into()),
            outcome => {
                debug!(task = %task.id, ?outcome, "task delivered");
                Ok(())
            }
        }
    }
}
