use thiserror::Error;

use crate::validation::ValidationError;

/// Outcome taxonomy of a single real-time event handler.
///
/// Every variant except `InvalidReference` is reported to the initiating
/// connection as exactly one `errorMessage`; nothing is ever reported to
/// other participants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Bad, missing or expired credential at handshake.
    #[error("Unauthorized")]
    Unauthorized,

    /// Malformed or unknown id in an event payload. Dropped silently.
    #[error("Invalid reference: {0}")]
    InvalidReference(&'static str),

    /// Authorization gate denial or acting on someone else's message.
    #[error("{0}")]
    Forbidden(String),

    /// Payload failed validation (empty text, oversized, ...).
    #[error("{0}")]
    Validation(String),

    /// Store unavailable or write failed. Carries the client-facing text only.
    #[error("{0}")]
    Persistence(String),
}

impl ChatError {
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Text to send back as `errorMessage`, or `None` when the event is
    /// dropped silently.
    pub fn client_message(&self) -> Option<String> {
        match self {
            ChatError::InvalidReference(_) => None,
            other => Some(other.to_string()),
        }
    }
}

impl From<ValidationError> for ChatError {
    fn from(e: ValidationError) -> Self {
        ChatError::Validation(e.to_string())
    }
}
