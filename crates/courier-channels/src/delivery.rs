use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::config::DeliveryConfig;
use courier_core::types::{DeliveryTarget, MessageRef, PayloadKind, Placeholder};
use tracing::{debug, error, info, warn};

use crate::error::DeliveryError;
use crate::gateway::{DeliveryGateway, OutboundContent};
use crate::segment::{floor_char_boundary, DeliveryPlan, SegmentPlanner, SegmentPolicy, TRUNCATION_MARKER};

/// What a reply delivery ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The placeholder was edited in place; nothing new was sent.
    Edited { message_ref: MessageRef },
    /// The reply went out as `delivered` of `total` segments.
    Segmented {
        delivered: usize,
        total: usize,
        edited_placeholder: bool,
    },
    /// One plain-text message was sent.
    PlainText {
        message_ref: MessageRef,
        truncated: bool,
    },
    /// Every strategy failed.
    Dropped,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        !matches!(self, Self::Dropped)
    }
}

/// Inputs shared by every strategy in the chain.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryRequest<'a> {
    pub text: &'a str,
    pub target: &'a DeliveryTarget,
    pub placeholder: Option<&'a Placeholder>,
}

/// Result of one strategy.
#[derive(Debug)]
pub enum Attempt {
    Delivered(DeliveryOutcome),
    /// The strategy does not apply to this request.
    Skipped(&'static str),
    Failed(DeliveryError),
}

/// One step of the delivery fallback chain.
#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(&self, gateway: &dyn DeliveryGateway, req: &DeliveryRequest<'_>) -> Attempt;
}

/// Replace the placeholder with the whole reply in a single edit.
pub struct EditPlaceholder {
    limits: DeliveryConfig,
}

impl EditPlaceholder {
    pub fn new(limits: DeliveryConfig) -> Self {
        Self { limits }
    }
}

#[async_trait]
impl DeliveryStrategy for EditPlaceholder {
    fn name(&self) -> &'static str {
        "edit_placeholder"
    }

    async fn attempt(&self, gateway: &dyn DeliveryGateway, req: &DeliveryRequest<'_>) -> Attempt {
        let Some(placeholder) = req.placeholder else {
            return Attempt::Skipped("no placeholder");
        };

        let plan = DeliveryPlan::edit(req.text);
        let content = OutboundContent {
            kind: placeholder.kind,
            text: plan.segments[0].text.clone(),
        };
        let size = gateway.rendered_size(&content);
        let limit = self.limits.limit_for(placeholder.kind);
        if size > limit {
            debug!(size, limit, kind = %placeholder.kind, "reply too large for a single edit");
            return Attempt::Skipped("reply exceeds placeholder limit");
        }

        match gateway.edit(&placeholder.message_ref, &content).await {
            Ok(()) => Attempt::Delivered(DeliveryOutcome::Edited {
                message_ref: placeholder.message_ref.clone(),
            }),
            Err(e) => Attempt::Failed(e),
        }
    }
}

/// Split the reply into annotated segments; the first one reuses the
/// placeholder when there is one.
pub struct Segmented {
    planner: SegmentPlanner,
    payload: PayloadKind,
    delay: Duration,
}

impl Segmented {
    pub fn new(cfg: &DeliveryConfig) -> Self {
        Self {
            planner: SegmentPlanner::new(SegmentPolicy::from(cfg)),
            payload: cfg.segment_payload,
            delay: Duration::from_millis(cfg.inter_send_delay_ms),
        }
    }

    async fn deliver_first(
        &self,
        gateway: &dyn DeliveryGateway,
        req: &DeliveryRequest<'_>,
        text: &str,
    ) -> Result<bool, DeliveryError> {
        if let Some(placeholder) = req.placeholder {
            let content = OutboundContent {
                kind: placeholder.kind,
                text: text.to_string(),
            };
            match gateway.edit(&placeholder.message_ref, &content).await {
                Ok(()) => return Ok(true),
                Err(e) => {
                    warn!(error = %e, "editing placeholder with first segment failed, sending it instead");
                }
            }
        }
        let content = OutboundContent {
            kind: self.payload,
            text: text.to_string(),
        };
        gateway.send(req.target, &content).await.map(|_| false)
    }
}

#[async_trait]
impl DeliveryStrategy for Segmented {
    fn name(&self) -> &'static str {
        "segmented"
    }

    async fn attempt(&self, gateway: &dyn DeliveryGateway, req: &DeliveryRequest<'_>) -> Attempt {
        // The first segment may go out as an edit of the placeholder, so it
        // has to fit whichever payload kind is larger once rendered.
        let placeholder_kind = req.placeholder.map(|p| p.kind);
        let measure = |text: &str| {
            let rendered = |kind| {
                gateway.rendered_size(&OutboundContent {
                    kind,
                    text: text.to_string(),
                })
            };
            let size = rendered(self.payload);
            match placeholder_kind {
                Some(kind) if kind != self.payload => size.max(rendered(kind)),
                _ => size,
            }
        };
        let plan = self.planner.plan_measured(req.text, &measure);
        let total = plan.segments.len();
        if total == 0 {
            return Attempt::Skipped("empty reply");
        }

        let mut delivered = 0;
        let mut edited_placeholder = false;
        let mut last_error = None;

        for segment in &plan.segments {
            let result = if segment.index == 1 {
                self.deliver_first(gateway, req, &segment.text)
                    .await
                    .map(|edited| edited_placeholder = edited)
            } else {
                tokio::time::sleep(self.delay).await;
                let content = OutboundContent {
                    kind: self.payload,
                    text: segment.text.clone(),
                };
                gateway.send(req.target, &content).await.map(|_| ())
            };

            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(segment = segment.index, total, error = %e, "segment delivery failed");
                    last_error = Some(e);
                }
            }
        }

        match (delivered, last_error) {
            (0, Some(e)) => Attempt::Failed(e),
            _ => Attempt::Delivered(DeliveryOutcome::Segmented {
                delivered,
                total,
                edited_placeholder,
            }),
        }
    }
}

/// Last resort: a single plain-text message cut to the text limit.
pub struct PlainText {
    max_bytes: usize,
}

impl PlainText {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

#[async_trait]
impl DeliveryStrategy for PlainText {
    fn name(&self) -> &'static str {
        "plain_text"
    }

    async fn attempt(&self, gateway: &dyn DeliveryGateway, req: &DeliveryRequest<'_>) -> Attempt {
        let (text, truncated) = if req.text.len() <= self.max_bytes {
            (req.text.to_string(), false)
        } else {
            let keep = floor_char_boundary(
                req.text,
                self.max_bytes.saturating_sub(TRUNCATION_MARKER.len()),
            );
            (format!("{}{}", &req.text[..keep], TRUNCATION_MARKER), true)
        };

        match gateway.send(req.target, &OutboundContent::text(text)).await {
            Ok(message_ref) => Attempt::Delivered(DeliveryOutcome::PlainText {
                message_ref,
                truncated,
            }),
            Err(e) => Attempt::Failed(e),
        }
    }
}

/// Runs the fallback chain for a finished reply.
pub struct DeliveryManager {
    gateway: Arc<dyn DeliveryGateway>,
    strategies: Vec<Box<dyn DeliveryStrategy>>,
}

impl DeliveryManager {
    /// Standard chain: edit placeholder, segmented, plain text.
    pub fn new(gateway: Arc<dyn DeliveryGateway>, cfg: &DeliveryConfig) -> Self {
        Self::with_strategies(
            gateway,
            vec![
                Box::new(EditPlaceholder::new(cfg.clone())),
                Box::new(Segmented::new(cfg)),
                Box::new(PlainText::new(cfg.text_max_bytes)),
            ],
        )
    }

    pub fn with_strategies(
        gateway: Arc<dyn DeliveryGateway>,
        strategies: Vec<Box<dyn DeliveryStrategy>>,
    ) -> Self {
        Self {
            gateway,
            strategies,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn DeliveryGateway> {
        &self.gateway
    }

    /// Deliver `text`, falling through the chain until one strategy succeeds.
    ///
    /// Never fails: exhaustion is logged and reported as
    /// [`DeliveryOutcome::Dropped`].
    pub async fn deliver(
        &self,
        text: &str,
        target: &DeliveryTarget,
        placeholder: Option<&Placeholder>,
    ) -> DeliveryOutcome {
        let mut req = DeliveryRequest {
            text,
            target,
            placeholder,
        };

        for strategy in &self.strategies {
            match strategy.attempt(self.gateway.as_ref(), &req).await {
                Attempt::Delivered(outcome) => {
                    info!(strategy = strategy.name(), chat = %target.chat_id, ?outcome, "reply delivered");
                    return outcome;
                }
                Attempt::Skipped(reason) => {
                    debug!(strategy = strategy.name(), reason, "delivery strategy skipped");
                }
                Attempt::Failed(e) if e.is_edit_limit() => {
                    warn!(strategy = strategy.name(), error = %e, "placeholder can no longer be edited");
                    req.placeholder = None;
                }
                Attempt::Failed(e) => {
                    warn!(strategy = strategy.name(), error = %e, "delivery strategy failed, falling back");
                }
            }
        }

        error!(chat = %target.chat_id, bytes = text.len(), "all delivery strategies failed, dropping reply");
        DeliveryOutcome::Dropped
    }
}
