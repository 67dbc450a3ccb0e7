//! Error types shared by the coach crates

use thiserror::Error;

/// Result type alias for core operations
pub type CoachResult<T> = Result<T, CoachError>;

/// Errors raised by configuration, chat completion and feedback generation
#[derive(Error, Debug)]
pub enum CoachError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chat completion error: {0}")]
    Chat(String),

    #[error("Feedback error: {0}")]
    Feedback(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<config::ConfigError> for CoachError {
    fn from(err: config::ConfigError) -> Self {
        CoachError::Config(err.to_string())
    }
}
