//! Error types for PetalSonic Pool

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PetalSonicError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    /// No output device could be opened at startup, even after retrying.
    /// The engine cannot run without an audio path, so callers should treat this as fatal.
    #[error("No audio device available after {attempts} attempts: {reason}")]
    NoDevice { attempts: u32, reason: String },

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audio loading error: {0}")]
    AudioLoading(String),

    #[error("Mixing backend error: {0}")]
    Backend(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

pub type Result<T> = std::result::Result<T, PetalSonicError>;
