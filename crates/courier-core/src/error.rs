use thiserror::Error;

#[derive(Debug, Error)]
pub enum CourierError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Duplicate event: {key}")]
    DuplicateEvent { key: String },

    #[error("Unsupported content: {0}")]
    UnsupportedContent(String),

    #[error("Completion provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Response truncated after {used_tokens} tokens")]
    TruncatedResponse { used_tokens: u32 },

    #[error("Delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("Queue paused after {failures} consecutive failures")]
    QueueOverload { failures: u32 },

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },
}

impl CourierError {
    /// Short error code string used in logs and the health endpoint.
    pub fn code(&self) -> &'static str {
        match self {
            CourierError::Config(_) => "CONFIG_ERROR",
            CourierError::DuplicateEvent { .. } => "DUPLICATE_EVENT",
            CourierError::UnsupportedContent(_) => "UNSUPPORTED_CONTENT",
            CourierError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            CourierError::TruncatedResponse { .. } => "TRUNCATED_RESPONSE",
            CourierError::DeliveryFailure(_) => "DELIVERY_FAILURE",
            CourierError::QueueOverload { .. } => "QUEUE_OVERLOAD",
            CourierError::Timeout { .. } => "TIMEOUT",
        }
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;
