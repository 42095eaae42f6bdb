use axum::{
    routing::{get, post},
    Router,
};
use courier_core::CourierConfig;
use courier_pipeline::{DedupStore, EventHandler};
use std::sync::Arc;

/// Shared state handed to every Axum handler as `Arc<AppState>`.
pub struct AppState {
    pub config: CourierConfig,
    pub handler: EventHandler,
    pub dedup: Arc<DedupStore>,
}

impl AppState {
    pub fn new(config: CourierConfig, handler: EventHandler, dedup: Arc<DedupStore>) -> Self {
        Self {
            config,
            handler,
            dedup,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/lark/events", post(crate::http::events::lark_events))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
