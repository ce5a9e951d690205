use thiserror::Error;

/// Error type for task scheduling and tracker execution.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("invalid priority level {level}: policy defines {levels} levels")]
    InvalidLevel { level: usize, levels: usize },

    #[error("task manager already running")]
    AlreadyRunning,

    #[error("config error: {0}")]
    Config(String),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<stellwerk_core::CoreError> for TaskError {
    fn from(err: stellwerk_core::CoreError) -> Self {
        Self::Failed(err.to_string())
    }
}
