use stellwerk_command::CommandError;
use stellwerk_comms::CommsError;
use stellwerk_core::CoreError;
use stellwerk_tasks::TaskError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("service already started")]
    AlreadyStarted,

    #[error("command {0} is already registered")]
    DuplicateCommand(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Comms(#[from] CommsError),
}
