//! Error types for the avatar speech core

use thiserror::Error;

/// Result type alias for avatar operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the avatar speech core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation was cancelled by its caller or an emergency stop
    #[error("operation aborted")]
    Aborted,

    /// Pending speech was rejected because the queue was cleared
    #[error("speech queue cleared")]
    QueueCleared,

    /// Utterance was pre-empted by a newer one
    #[error("speech interrupted")]
    Interrupted,

    /// Speech engine failure
    #[error("speech engine error: {0}")]
    Engine(String),

    /// Microphone or recognizer access denied
    #[error("permission denied: {0}")]
    Permission(String),

    /// Speech recognition error
    #[error("recognizer error: {0}")]
    Recognizer(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Chat completion error
    #[error("completion error: {0}")]
    Completion(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error is a cancellation rather than a failure
    ///
    /// Cancellations are expected during pre-emption and emergency stops and
    /// are never logged as failures.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Aborted | Self::QueueCleared | Self::Interrupted)
    }
}
