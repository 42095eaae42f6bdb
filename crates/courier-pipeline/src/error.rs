use courier_core::CourierError;
use thiserror::Error;

/// Why a queued task did not complete.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Task(#[from] CourierError),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Task(e) => e.code(),
            PipelineError::Panicked(_) => "TASK_PANICKED",
        }
    }
}
