use std::sync::Arc;
use std::time::Duration;

use courier_channels::{DeliveryGateway, OutboundContent};
use courier_core::config::AckConfig;
use courier_core::types::{DeliveryTarget, InboundEvent, PayloadKind, Placeholder, QueueTask, TaskId};
use courier_core::CourierError;
use tracing::{debug, info, warn};

use crate::dedup::DedupStore;
use crate::queue::ProcessingQueue;
use crate::trigger::TriggerDetector;

/// What the arrival path did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Seen inside the dedup window.
    Duplicate,
    /// Not addressed to the bot.
    Ignored,
    /// Addressed to the bot but not processable; the user was told if possible.
    Rejected,
    Enqueued(TaskId),
}

/// Arrival path: dedup, trigger detection, parsing, acknowledgement, enqueue.
///
/// Everything here is short and bounded; the reply itself is produced by the
/// queue worker.
pub struct EventHandler {
    dedup: Arc<DedupStore>,
    queue: ProcessingQueue,
    gateway: Arc<dyn DeliveryGateway>,
    trigger: TriggerDetector,
    ack: AckConfig,
    parse_failure: String,
}

impl EventHandler {
    pub fn new(
        dedup: Arc<DedupStore>,
        queue: ProcessingQueue,
        gateway: Arc<dyn DeliveryGateway>,
        trigger: TriggerDetector,
        ack: AckConfig,
        parse_failure: impl Into<String>,
    ) -> Self {
        Self {
            dedup,
            queue,
            gateway,
            trigger,
            ack,
            parse_failure: parse_failure.into(),
        }
    }

    pub fn queue(&self) -> &ProcessingQueue {
        &self.queue
    }

    /// Never fails; every problem is logged and folded into the outcome.
    pub async fn handle_inbound_event(&self, event: InboundEvent) -> HandleOutcome {
        if self.dedup.seen(&event) {
            let dup = CourierError::DuplicateEvent {
                key: DedupStore::key_for(&event).unwrap_or_default(),
            };
            debug!(code = dup.code(), "{dup}");
            return HandleOutcome::Duplicate;
        }

        let trigger = self.trigger.detect(&event);
        if !trigger.should_process() {
            debug!(chat = %event.conversation_id, ?trigger, "event ignored");
            return HandleOutcome::Ignored;
        }

        let target = DeliveryTarget::for_event(&event);
        let text = match self.trigger.parse_text(&event) {
            Ok(text) => text,
            Err(e) => {
                warn!(chat = %event.conversation_id, code = e.code(), error = %e, "cannot parse message");
                self.reply_parse_failure(&target).await;
                return HandleOutcome::Rejected;
            }
        };
        if text.is_empty() {
            debug!(chat = %event.conversation_id, "mention without text, ignoring");
            return HandleOutcome::Ignored;
        }

        let placeholder = self.acknowledge(&target).await;
        let task = QueueTask {
            id: TaskId::new(),
            thread_ref: event.thread_id.clone(),
            parsed_text: text,
            target,
            placeholder,
            event,
        };
        let id = task.id.clone();

        if !self.queue.enqueue(task) {
            return HandleOutcome::Rejected;
        }
        info!(task = %id, ?trigger, backlog = self.queue.status().backlog, "event accepted");
        HandleOutcome::Enqueued(id)
    }

    fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack.timeout_ms)
    }

    /// Send the "thinking" card that later becomes the reply placeholder.
    ///
    /// A slow send is abandoned after the ack timeout and the task goes on
    /// without a placeholder.
    async fn acknowledge(&self, target: &DeliveryTarget) -> Option<Placeholder> {
        if !self.ack.enabled {
            return None;
        }
        let content = OutboundContent::card(self.ack.text.clone());
        match tokio::time::timeout(self.ack_timeout(), self.gateway.send(target, &content)).await {
            Ok(Ok(message_ref)) => Some(Placeholder {
                message_ref,
                kind: PayloadKind::Card,
            }),
            Ok(Err(e)) => {
                warn!(chat = %target.chat_id, error = %e, "acknowledgement failed, continuing without placeholder");
                None
            }
            Err(_) => {
                let err = CourierError::Timeout {
                    ms: self.ack.timeout_ms,
                };
                warn!(chat = %target.chat_id, code = err.code(), "acknowledgement timed out, continuing without placeholder");
                None
            }
        }
    }

    async fn reply_parse_failure(&self, target: &DeliveryTarget) {
        let content = OutboundContent::text(self.parse_failure.clone());
        match tokio::time::timeout(self.ack_timeout(), self.gateway.send(target, &content)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(chat = %target.chat_id, error = %e, "parse failure reply not sent"),
            Err(_) => warn!(chat = %target.chat_id, "parse failure reply timed out"),
        }
    }
}
