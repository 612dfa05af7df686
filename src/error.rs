//! Structured error taxonomy for the control API. Transport and protocol
//! errors are recovered internally (reconnect backoff, malformed-record
//! counters) and never reach this enum during normal operation; everything
//! else bubbles up to callers as one of these variants.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("device not found")]
    NotFound,
    #[error("device or characteristic not supported")]
    Unsupported,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("a workout is already active")]
    AlreadyActive,
    #[error("no workout is active")]
    NotActive,
    #[error("workout has not ended")]
    NotEnded,
    #[error("workout not found")]
    WorkoutNotFound,
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
