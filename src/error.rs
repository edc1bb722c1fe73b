use thiserror::Error;

use crate::note::ChannelId;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in config {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Reasons a timeline cannot be handed to the engine.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read MIDI file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed MIDI data: {0}")]
    Malformed(String),

    #[error("SMPTE timecode timing is not supported, only ticks-per-beat")]
    UnsupportedTiming,

    #[error("Track {index} does not exist ({count} tracks available)")]
    TrackOutOfRange { index: usize, count: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpioError {
    #[error("GPIO backend unavailable: {0}")]
    Unavailable(String),

    #[error("Pin {0} was never set up as an output")]
    NotConfigured(ChannelId),

    #[error("Write to pin {pin} failed: {message}")]
    Write { pin: ChannelId, message: String },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Tempo must be positive, got {0} microseconds per beat")]
pub struct InvalidTempo(pub u32);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] LoadError),
}
