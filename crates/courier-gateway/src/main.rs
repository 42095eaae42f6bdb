use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use courier_agent::{AnthropicProvider, TrailingPatternHeuristic, TruncationGuard, TruncationPolicy};
use courier_channels::{DeliveryGateway, DeliveryManager};
use courier_core::CourierConfig;
use courier_lark::{LarkClient, LarkContext, LarkGateway};
use courier_pipeline::{
    DedupStore, EventHandler, ProcessingQueue, QueuePolicy, ReplyProcessor, ReplySettings,
    TriggerDetector,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod app;
mod http;

/// Lark chat assistant: receives event callbacks and answers through a
/// single-flight reply queue.
#[derive(Debug, Parser)]
#[command(name = "courier-gateway", version)]
struct Args {
    /// Config file (defaults to $COURIER_CONFIG, then ~/.courier/courier.toml).
    #[arg(long, short)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "courier_gateway=info,courier_pipeline=info,tower_http=debug".into()
            }),
        )
        .init();

    let args = Args::parse();
    let config_path = args.config.or_else(|| std::env::var("COURIER_CONFIG").ok());
    let config = CourierConfig::load(config_path.as_deref())?;
    config.validate()?;

    let lark = Arc::new(LarkClient::new(&config.lark));
    let gateway: Arc<dyn DeliveryGateway> = Arc::new(LarkGateway::new(Arc::clone(&lark)));
    let context = Arc::new(LarkContext::new(Arc::clone(&lark)));

    let provider = Arc::new(AnthropicProvider::new(
        config.provider.auth_token.clone(),
        Some(config.provider.base_url.clone()),
        Duration::from_secs(config.provider.request_timeout_secs),
    ));
    info!(
        base_url = %config.provider.base_url,
        model = %config.provider.model,
        streaming = config.provider.streaming,
        "completion provider configured"
    );
    let guard = TruncationGuard::new(
        provider,
        Box::new(TrailingPatternHeuristic::new(config.truncation.trailing_window)),
        TruncationPolicy::from(&config.truncation),
    );

    let processor = Arc::new(ReplyProcessor::new(
        context,
        guard,
        DeliveryManager::new(Arc::clone(&gateway), &config.delivery),
        ReplySettings::from(&config),
    ));
    let (queue, worker) = ProcessingQueue::new(processor, QueuePolicy::from(&config.queue));

    let cancel = CancellationToken::new();
    let worker_task = worker.spawn(cancel.clone());

    let dedup = Arc::new(DedupStore::new(Duration::from_secs(config.dedup.ttl_secs)));
    let sweeper_task = Arc::clone(&dedup).spawn_sweeper(
        Duration::from_secs(config.dedup.sweep_interval_secs.max(1)),
        cancel.clone(),
    );

    let handler = EventHandler::new(
        Arc::clone(&dedup),
        queue,
        gateway,
        TriggerDetector::new(config.lark.bot.clone(), config.lark.app_id.clone()),
        config.ack.clone(),
        config.reply.parse_failure.clone(),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let state = Arc::new(app::AppState::new(config, handler, dedup));
    let router = app::build_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Courier gateway listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let status = state.handler.queue().status();
    info!(
        state = ?status.state,
        backlog = status.backlog,
        processed = status.processed,
        failed = status.failed,
        "shutting down, queue status"
    );

    // The worker finishes its current task before observing the cancellation.
    cancel.cancel();
    if let Err(e) = worker_task.await {
        warn!(error = %e, "queue worker ended abnormally");
    }
    let _ = sweeper_task.await;
    info!("Courier gateway stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
