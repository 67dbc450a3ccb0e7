//! Error types for the voice turn engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice turn engine.
///
/// Only configuration and permission errors ever reach the caller of a
/// running session; everything else is recovered inside the event loop.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Speech recognition error: {0}")]
    Recognition(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Session already finished")]
    SessionFinished,

    #[error(transparent)]
    Core(#[from] coach_core::CoachError),
}
