//! Crate-wide error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// A subprocess could not be spawned or did not survive its start window.
    #[error("startup error: {0}")]
    Startup(String),

    /// Anything that goes wrong after startup.
    #[error("{0}")]
    Runtime(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
