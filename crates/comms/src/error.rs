use stellwerk_core::CoreError;
use stellwerk_tasks::TaskError;
use thiserror::Error;

/// Errors raised by transport clients and the communication container.
#[derive(Debug, Error)]
pub enum CommsError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("no sender supports channel {0}")]
    NoSender(String),

    #[error("client {0} is closed")]
    Closed(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(#[from] CoreError),
}

impl From<CommsError> for TaskError {
    fn from(err: CommsError) -> Self {
        TaskError::Failed(err.to_string())
    }
}
