//! Client-side errors.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single transport attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("unable to encode request: {0}")]
    Encoding(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Transport failure that outlived every retry. The command may or may not
/// have reached the server.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("communication error after {attempts} attempt(s): {source}")]
pub struct CommunicationError {
    pub attempts: u32,
    #[source]
    pub source: TransportError,
}

#[derive(Debug, Error)]
pub enum SenderError {
    #[error(transparent)]
    Communication(#[from] CommunicationError),

    #[error("command '{command}' failed: {message}")]
    CommandFailed {
        command: String,
        is_validation_error: bool,
        message: String,
        log_key: Option<String>,
    },

    #[error("invalid command graph: {0}")]
    InvalidCommand(String),

    #[error("unexpected result for command '{command}': {reason}")]
    UnexpectedResult { command: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SenderError>;
