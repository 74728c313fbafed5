//! Error types for the Parley voice pipeline

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the duplex voice pipeline
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    /// Frame did not satisfy the decoder's length/shape precondition.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Agent channel error: {0}")]
    Channel(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Agent channel closed")]
    ChannelClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Narration error: {0}")]
    Narration(String),

    /// The output device is held by a live session.
    #[error("Output device busy: {0}")]
    OutputBusy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PauseStreamError> for VoiceError {
    fn from(err: cpal::PauseStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<rodio::StreamError> for VoiceError {
    fn from(err: rodio::StreamError) -> Self {
        VoiceError::Playback(err.to_string())
    }
}

impl From<rodio::PlayError> for VoiceError {
    fn from(err: rodio::PlayError) -> Self {
        VoiceError::Playback(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::MalformedFrame(format!("invalid base64 payload: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Channel(err.to_string())
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Channel(format!("invalid message: {}", err))
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::Narration(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}
