//! Error types for daily-dispatch

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    /// Credentials were revoked by the remote side. Never retried.
    #[error("Authentication lost: {0}")]
    Auth(String),

    #[error("Transport unavailable: connection is not open")]
    TransportUnavailable,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
