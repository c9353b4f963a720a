//! Error taxonomy for the Cris core.
//!
//! Business failures never show up here: they are user messages carried by
//! the result envelope. These errors cover startup configuration, decoding
//! and the background executor plumbing.

/// Reasons a payload could not be turned into a command.
///
/// Each variant becomes a validation error envelope; the pipeline is never
/// entered for an undecodable payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty request body")]
    EmptyBody,

    #[error("malformed payload (byte length = {length}): {reason}")]
    Malformed { length: usize, reason: String },

    #[error("expected a [\"CommandName\", {{...}}] pair (byte length = {length})")]
    NotACommand { length: usize },

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("invalid fields for command '{command}': {reason}")]
    InvalidFields { command: String, reason: String },
}

impl DecodeError {
    /// Machine code attached to the synthesized error message.
    pub fn code(&self) -> &'static str {
        match self {
            DecodeError::EmptyBody => "Cris.EmptyBody",
            DecodeError::Malformed { .. } => "Cris.ReadCommandFailed",
            DecodeError::NotACommand { .. } => "Cris.NotACommand",
            DecodeError::UnknownCommand(_) => "Cris.UnknownCommand",
            DecodeError::InvalidFields { .. } => "Cris.InvalidFields",
        }
    }

    /// Whether the failure deserves its own log record (and log key).
    pub fn is_logged(&self) -> bool {
        !matches!(self, DecodeError::EmptyBody)
    }
}

/// Cris core errors.
#[derive(Debug, thiserror::Error)]
pub enum CrisError {
    #[error("duplicate command name: {0}")]
    DuplicateCommand(String),

    #[error("command '{command}' has {count} handlers bound, at most one is allowed")]
    MultipleHandlers { command: String, count: usize },

    #[error("command '{command}' declares result types that do not converge: {facets:?}")]
    ResultTypeConflict {
        command: String,
        facets: Vec<String>,
    },

    #[error("binding targets unknown command: {0}")]
    UnknownCommand(String),

    #[error("background queue is full ({capacity} pending submissions)")]
    QueueFull { capacity: usize },

    #[error("background executor is stopped")]
    ExecutorStopped,

    #[error("deferred wait cancelled")]
    WaitCancelled,

    #[error("request cancelled before completion")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Cris core operations.
pub type Result<T> = std::result::Result<T, CrisError>;
