use thiserror::Error;

/// The platform refuses further edits of a message.
pub const EDIT_LIMIT_CODE: i64 = 230072;
/// The app lacks permission to read message history.
pub const NO_HISTORY_PERMISSION_CODE: i64 = 99991672;
/// Tenant access token invalid or expired.
pub const TOKEN_INVALID_CODES: &[i64] = &[99991661, 99991663, 99991668];

#[derive(Debug, Error)]
pub enum LarkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Lark API error {code}: {msg}")]
    Api { code: i64, msg: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Unexpected response: {0}")]
    Parse(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),
}

impl LarkError {
    pub fn api_code(&self) -> Option<i64> {
        match self {
            Self::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}
