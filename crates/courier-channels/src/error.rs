use thiserror::Error;

/// Errors returned by a [`DeliveryGateway`](crate::gateway::DeliveryGateway).
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The platform refuses further edits of this message.
    #[error("Edit limit exceeded for message {message_ref}")]
    EditLimitExceeded { message_ref: String },

    /// The platform answered but refused the request.
    #[error("Rejected by platform (code {code}): {message}")]
    Rejected { code: i64, message: String },

    /// The request never got a platform answer (network, auth, decoding).
    #[error("Transport error: {0}")]
    Transport(String),
}

impl DeliveryError {
    pub fn is_edit_limit(&self) -> bool {
        matches!(self, Self::EditLimitExceeded { .. })
    }
}

/// Errors returned by a [`ContextProvider`](crate::gateway::ContextProvider).
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Context unavailable: {0}")]
    Unavailable(String),
}
