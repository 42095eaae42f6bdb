//! Lark event-subscription callback endpoint: POST /lark/events.
//!
//! Answers URL verification challenges, checks the verification token,
//! turns message events into `InboundEvent`s and runs them through the
//! arrival path. The platform retries anything that is not a 200, so every body we
//! can make sense of is acknowledged with 200 whatever happens to it.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    Json,
};
use courier_lark::{event::verification_token, Callback};
use courier_pipeline::HandleOutcome;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::app::AppState;

type Rejection = (StatusCode, Json<Value>);

pub async fn lark_events(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, Rejection> {
    let lark = &state.config.lark;

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "invalid JSON in event callback");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid JSON body"})),
        )
    })?;

    if let Some(expected) = lark.verification_token.as_deref().filter(|t| !t.is_empty()) {
        if verification_token(&payload) != Some(expected) {
            return Err(auth_error("verification token mismatch"));
        }
    }

    let callback = courier_lark::classify(payload).map_err(|e| {
        warn!(error = %e, "undecodable event callback");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        )
    })?;

    match callback {
        Callback::Challenge { challenge } => {
            info!("answering url verification challenge");
            Ok(Json(json!({ "challenge": challenge })))
        }
        Callback::Encrypted => {
            warn!("encrypted callback received; disable body encryption in the app console");
            Err((
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "encrypted callbacks are not supported"})),
            ))
        }
        Callback::Ignored { event_type } => {
            debug!(event_type = %event_type, "event type not handled");
            Ok(Json(json!({"ok": true})))
        }
        Callback::Message(event) => {
            let outcome = state.handler.handle_inbound_event(*event).await;
            Ok(Json(json!({"ok": true, "outcome": outcome_label(&outcome)})))
        }
    }
}

fn outcome_label(outcome: &HandleOutcome) -> &'static str {
    match outcome {
        HandleOutcome::Duplicate => "duplicate",
        HandleOutcome::Ignored => "ignored",
        HandleOutcome::Rejected => "rejected",
        HandleOutcome::Enqueued(_) => "enqueued",
    }
}

fn auth_error(reason: &str) -> Rejection {
    warn!(reason = %reason, "event callback authentication failed");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "authentication failed", "reason": reason})),
    )
}
