//! Inbound event pipeline: deduplication, trigger detection, the
//! single-flight processing queue and the reply worker.

pub mod dedup;
pub mod error;
pub mod handler;
pub mod process;
pub mod queue;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;

pub use dedup::DedupStore;
pub use error::PipelineError;
pub use handler::{EventHandler, HandleOutcome};
pub use process::{render_prompt, ReplyProcessor, ReplySettings};
pub use queue::{ProcessingQueue, QueuePolicy, QueueState, QueueStatus, QueueWorker, TaskProcessor};
pub use trigger::{Trigger, TriggerDetector};
