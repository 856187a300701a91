//! Error types for the fabric emulator.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Result type for control-path operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned synchronously to the caller. Faults detected on a
/// worker never surface here; they become completions or async events.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid attributes or arguments
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The referenced object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// An object table or pool is full
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The queue pair is in the wrong state for the request
    #[error("queue pair state: {0}")]
    QpState(String),

    /// The completion queue is in the error state
    #[error("completion queue state: {0}")]
    CqState(String),

    /// I/O error on a fabric socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    pub(crate) fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub(crate) fn exhausted(msg: impl Into<String>) -> Self {
        Error::ResourceExhausted(msg.into())
    }
}
