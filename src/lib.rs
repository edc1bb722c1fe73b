//! Plays MIDI tracks on a bagpipe whose finger holes are GPIO-driven valves and whose air
//! comes from a bellows on its own pin.
//!
//! [`timeline::MidiFile`] turns a file into ordered [`note::TimedEvent`]s,
//! [`engine::PlaybackEngine`] schedules them under the running tempo, and
//! [`actuator::ActuatorDriver`] opens and closes valves through a [`gpio::GpioBackend`].

pub mod actuator;
pub mod config;
pub mod engine;
pub mod error;
pub mod gpio;
pub mod note;
pub mod tempo;
pub mod timeline;

pub use actuator::ActuatorDriver;
pub use config::{load_config, PlayerConfig};
pub use engine::{
    EngineSettings, PlaybackEngine, PlaybackReport, PlaybackState, RecordingSleeper, Sleeper,
    StopHandle, ThreadSleeper,
};
pub use error::{ConfigError, EngineError, GpioError, InvalidTempo, LoadError};
pub use note::{ChannelConfig, ChannelId, ChannelMap, EventKind, NoteId, TimedEvent};
pub use tempo::TempoClock;
pub use timeline::{MidiFile, Timeline, TimelineSource};
