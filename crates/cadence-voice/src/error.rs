//! Error types for the Cadence voice engine

use crate::state::ConversationState;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice conversation engine
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Channel failed to open or closed unexpectedly. Recoverable by reconnect.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected to voice agent")]
    NotConnected,

    #[error("Recording already in progress")]
    AlreadyRecording,

    #[error("No recording in progress")]
    NotRecording,

    /// A single playback chunk could not be decoded
    #[error("Decode error (chunk {chunk_id}): {reason}")]
    Decode { chunk_id: u64, reason: String },

    /// Error reported by the remote agent
    #[error("Remote error [{error_type}]: {message}")]
    Remote {
        error_type: String,
        message: String,
        recoverable: bool,
    },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: ConversationState,
        to: ConversationState,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Health check failed: {0}")]
    Health(String),

    #[error("Capture device error: {0}")]
    Capture(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VoiceError {
    /// Precondition violations are caller defects and are never retried.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            VoiceError::NotConnected | VoiceError::AlreadyRecording | VoiceError::NotRecording
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Connection(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Decode {
            chunk_id: 0,
            reason: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VoiceError::Timeout(err.to_string())
        } else {
            VoiceError::Health(err.to_string())
        }
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}
