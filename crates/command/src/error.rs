use std::time::Duration;

use stellwerk_core::{CoreError, MessageStatus};
use stellwerk_tasks::TaskError;
use thiserror::Error;

/// Errors raised by command dispatch and request tracking.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("no handler supports message {0}")]
    NotSupported(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("duplicate outgoing request id {0}")]
    DuplicateRequest(String),

    #[error("outgoing request {id} timed out after {ttl:?}")]
    Timeout { id: String, ttl: Duration },

    #[error("outgoing request {0} was cancelled")]
    Cancelled(String),

    #[error("remote returned {status:?}: {description}")]
    Remote {
        status: MessageStatus,
        description: String,
    },

    #[error("command {0} is not started")]
    NotStarted(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl CommandError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

impl From<CoreError> for CommandError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Config(msg) => Self::Config(msg),
            other => Self::Codec(other.to_string()),
        }
    }
}

impl From<CommandError> for TaskError {
    fn from(err: CommandError) -> Self {
        TaskError::Failed(err.to_string())
    }
}
