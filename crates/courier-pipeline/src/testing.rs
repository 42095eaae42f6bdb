//! Builders and mock collaborators shared by the unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use courier_agent::{Completion, CompletionProvider, CompletionRequest, ProviderError};
use courier_channels::{
    ContextError, ContextMessage, ContextProvider, DeliveryError, DeliveryGateway, OutboundContent,
};
use courier_core::types::{
    ChatKind, ContentKind, DeliveryTarget, InboundEvent, Mention, MessageRef, QueueTask, TaskId,
};

pub(crate) fn event(chat_kind: ChatKind, text: &str) -> InboundEvent {
    InboundEvent {
        primary_id: Some("ev_1".into()),
        secondary_id: None,
        message_id: Some("om_1".into()),
        conversation_id: "oc_1".into(),
        thread_id: None,
        chat_kind,
        content_kind: ContentKind::Text,
        content: serde_json::json!({ "text": text }).to_string(),
        mentions: Vec::new(),
        raw_payload: serde_json::Value::Null,
        received_at: Utc::now(),
    }
}

pub(crate) fn mention(key: &str, open_id: &str, name: &str) -> Mention {
    Mention {
        key: key.into(),
        open_id: Some(open_id.into()),
        user_id: None,
        name: Some(name.into()),
    }
}

pub(crate) fn task(label: &str) -> QueueTask {
    let event = event(ChatKind::P2p, label);
    QueueTask {
        id: TaskId::new(),
        parsed_text: label.to_string(),
        thread_ref: None,
        target: DeliveryTarget::for_event(&event),
        placeholder: None,
        event,
    }
}

/// Gateway traffic, text only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Send(String),
    Edit(String, String),
}

#[derive(Default)]
pub(crate) struct RecordingGateway {
    calls: Mutex<Vec<Call>>,
    refuse: bool,
}

impl RecordingGateway {
    /// Every send and edit fails.
    pub(crate) fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryGateway for RecordingGateway {
    async fn send(
        &self,
        _target: &DeliveryTarget,
        content: &OutboundContent,
    ) -> Result<MessageRef, DeliveryError> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(Call::Send(content.text.clone()));
        if self.refuse {
            return Err(DeliveryError::Transport("refused".into()));
        }
        Ok(MessageRef(format!("om_sent_{}", calls.len())))
    }

    async fn edit(
        &self,
        message_ref: &MessageRef,
        content: &OutboundContent,
    ) -> Result<(), DeliveryError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Edit(message_ref.to_string(), content.text.clone()));
        if self.refuse {
            return Err(DeliveryError::Transport("refused".into()));
        }
        Ok(())
    }
}

pub(crate) struct FixedContext {
    messages: Option<Vec<ContextMessage>>,
}

impl FixedContext {
    pub(crate) fn empty() -> Self {
        Self::with(Vec::new())
    }

    pub(crate) fn with(messages: Vec<ContextMessage>) -> Self {
        Self {
            messages: Some(messages),
        }
    }

    pub(crate) fn failing() -> Self {
        Self { messages: None }
    }
}

#[async_trait]
impl ContextProvider for FixedContext {
    async fn fetch_recent(
        &self,
        _thread_id: &str,
        limit: usize,
    ) -> Result<Vec<ContextMessage>, ContextError> {
        match &self.messages {
            Some(messages) => Ok(messages.iter().take(limit).cloned().collect()),
            None => Err(ContextError::Unavailable("no permission".into())),
        }
    }
}

/// Answers every request with the same text, or fails them all.
pub(crate) struct ScriptedProvider {
    reply: Option<String>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub(crate) fn replying(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
            requests: Arc::default(),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            reply: None,
            requests: Arc::default(),
        }
    }

    /// Handle to the requests received so far.
    pub(crate) fn requests(&self) -> Arc<Mutex<Vec<CompletionRequest>>> {
        Arc::clone(&self.requests)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.requests.lock().unwrap().push(req.clone());
        match &self.reply {
            Some(text) => Ok(Completion {
                text: text.clone(),
                model: req.model.clone(),
                tokens_in: 10,
                tokens_out: 20,
                stop_reason: "end_turn".into(),
            }),
            None => Err(ProviderError::Unavailable("scripted outage".into())),
        }
    }
}
