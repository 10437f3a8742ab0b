//! Error types surfaced by the delivery core.

use shared::models::ErrorResponse;
use thiserror::Error;

use crate::assistant::AssistantError;
use crate::store::StoreError;

/// Errors returned by the resolver, the live channel, and conversation views.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Input rejected before any I/O happened.
    #[error("validation error: {0}")]
    Validation(String),
    /// A participant or conversation could not be resolved.
    #[error("not found: {0}")]
    NotFound(String),
    /// The store rejected a read or write.
    #[error("persistence error: {0}")]
    Persistence(#[source] StoreError),
    /// A live subscription could not be established or was dropped.
    #[error("channel error: {0}")]
    Channel(String),
    /// The assistant service failed to produce a reply.
    #[error("assistant error: {0}")]
    Assistant(#[from] AssistantError),
}

impl ChatError {
    /// Stable code used by UI screens to pick an inline message.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation_failed",
            ChatError::NotFound(_) => "not_found",
            ChatError::Persistence(_) => "persistence_failed",
            ChatError::Channel(_) => "channel_failed",
            ChatError::Assistant(_) => "assistant_failed",
        }
    }

    /// Whether an explicit user action (resend, re-enter the view) can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Persistence(_) | ChatError::Channel(_) | ChatError::Assistant(_)
        )
    }

    /// Converts the error into the payload rendered by UI screens.
    #[must_use]
    pub fn to_response(&self) -> ErrorResponse {
        let response = ErrorResponse::new(self.code(), self.to_string());
        if self.is_retryable() {
            response.retryable()
        } else {
            response
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(message) => ChatError::NotFound(message),
            other => ChatError::Persistence(other),
        }
    }
}

/// Result alias used across the crate.
pub type ChatResult<T> = Result<T, ChatError>;
