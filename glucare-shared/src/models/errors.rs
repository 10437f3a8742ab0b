use serde::{Deserialize, Serialize};

/// Error payload handed to UI screens for inline display.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Machine readable error code (e.g. `validation_failed`).
    pub code: String,
    /// The main error message
    pub message: String,
    /// Whether retrying the same action can succeed
    pub retryable: bool,
}

impl ErrorResponse {
    /// Creates a non-retryable error response.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Marks the error as retryable by an explicit user action.
    #[must_use]
    pub const fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorResponse {}
