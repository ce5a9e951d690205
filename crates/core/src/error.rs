use thiserror::Error;

/// Failures shared by every layer: envelope codec and invalid addressing.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}
