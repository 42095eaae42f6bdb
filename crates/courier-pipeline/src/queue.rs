use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::config::QueueConfig;
use courier_core::types::QueueTask;
use courier_core::CourierError;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;

/// Work performed for each dequeued task.
#[async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    async fn process(&self, task: QueueTask) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Idle,
    Draining,
    /// Cooling down after too many consecutive failures.
    Paused,
}

/// Point-in-time view of the queue for logs and the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub state: QueueState,
    pub backlog: usize,
    pub consecutive_failures: u32,
    pub processed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl From<&QueueConfig> for QueuePolicy {
    fn from(cfg: &QueueConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold.max(1),
            cooldown: Duration::from_secs(cfg.cooldown_secs),
        }
    }
}

struct Shared {
    backlog: AtomicUsize,
    consecutive_failures: AtomicU32,
    processed: AtomicU64,
    failed: AtomicU64,
    state: watch::Sender<QueueState>,
}

impl Shared {
    fn set_state(&self, state: QueueState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn status(&self) -> QueueStatus {
        QueueStatus {
            state: *self.state.borrow(),
            backlog: self.backlog.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Producer handle of the single-flight FIFO queue. Cheap to clone.
#[derive(Clone)]
pub struct ProcessingQueue {
    tx: mpsc::UnboundedSender<QueueTask>,
    shared: Arc<Shared>,
}

/// Consumer half; run it once with [`spawn`](Self::spawn) or [`run`](Self::run).
pub struct QueueWorker<P> {
    rx: mpsc::UnboundedReceiver<QueueTask>,
    shared: Arc<Shared>,
    processor: Arc<P>,
    policy: QueuePolicy,
}

impl ProcessingQueue {
    pub fn new<P: TaskProcessor>(processor: Arc<P>, policy: QueuePolicy) -> (Self, QueueWorker<P>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(QueueState::Idle);
        let shared = Arc::new(Shared {
            backlog: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            state,
        });
        let worker = QueueWorker {
            rx,
            shared: Arc::clone(&shared),
            processor,
            policy,
        };
        (Self { tx, shared }, worker)
    }

    /// Append a task without waiting for it. Accepted while paused.
    ///
    /// Returns `false` only when the worker has shut down.
    pub fn enqueue(&self, task: QueueTask) -> bool {
        let id = task.id.clone();
        self.shared.backlog.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(task).is_err() {
            self.shared.backlog.fetch_sub(1, Ordering::SeqCst);
            error!(task = %id, "queue worker is gone, task dropped");
            return false;
        }
        debug!(task = %id, backlog = self.shared.backlog.load(Ordering::SeqCst), "task enqueued");
        true
    }

    pub fn status(&self) -> QueueStatus {
        self.shared.status()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<QueueState> {
        self.shared.state.subscribe()
    }
}

impl<P: TaskProcessor> QueueWorker<P> {
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Drain tasks one at a time until cancelled or every producer is dropped.
    ///
    /// Cancellation is observed between tasks only; a running task always
    /// finishes.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            threshold = self.policy.failure_threshold,
            cooldown_secs = self.policy.cooldown.as_secs(),
            "queue worker started"
        );

        loop {
            let task = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                task = self.rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            self.shared.backlog.fetch_sub(1, Ordering::SeqCst);
            self.shared.set_state(QueueState::Draining);
            self.execute(task).await;

            let failures = self.shared.consecutive_failures.load(Ordering::SeqCst);
            if failures >= self.policy.failure_threshold {
                let overload = CourierError::QueueOverload { failures };
                self.shared.set_state(QueueState::Paused);
                warn!(
                    code = overload.code(),
                    backlog = self.shared.backlog.load(Ordering::SeqCst),
                    cooldown_secs = self.policy.cooldown.as_secs(),
                    "{overload}, pausing"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.policy.cooldown) => {}
                }
                self.shared.consecutive_failures.store(0, Ordering::SeqCst);
                info!("queue cooldown elapsed, resuming");
            }

            if self.shared.backlog.load(Ordering::SeqCst) == 0 {
                self.shared.set_state(QueueState::Idle);
            } else {
                self.shared.set_state(QueueState::Draining);
            }
        }

        let status = self.shared.status();
        info!(
            backlog = status.backlog,
            processed = status.processed,
            failed = status.failed,
            "queue worker stopped"
        );
    }

    async fn execute(&self, task: QueueTask) {
        let id = task.id.clone();
        let processor = Arc::clone(&self.processor);
        // A separate tokio task turns panics into JoinErrors.
        let result = match tokio::spawn(async move { processor.process(task).await }).await {
            Ok(result) => result,
            Err(join) => Err(PipelineError::Panicked(join.to_string())),
        };

        match result {
            Ok(()) => {
                self.shared.processed.fetch_add(1, Ordering::SeqCst);
                self.shared.consecutive_failures.store(0, Ordering::SeqCst);
                debug!(task = %id, "task completed");
            }
            Err(e) => {
                self.shared.failed.fetch_add(1, Ordering::SeqCst);
                let failures = self.shared.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(task = %id, code = e.code(), error = %e, consecutive_failures = failures, "task failed");
            }
        }
    }
}
