use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Note number as it appears in the timeline.
pub type NoteId = u8;
/// Output pin driving one valve (BCM numbering on a Pi).
pub type ChannelId = u8;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChannelConfig {
    pub note: NoteId,
    pub pin: ChannelId,
    #[serde(default)]
    pub name: Option<String>,
}

/// Fixed note -> channel lookup, read-only once playback starts.
///
/// Each note and each pin appears at most once, so an active note always owns its pin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMap {
    entries: BTreeMap<NoteId, ChannelConfig>,
}

impl ChannelMap {
    pub fn new(configs: impl IntoIterator<Item = ChannelConfig>) -> Result<Self, ConfigError> {
        let mut entries = BTreeMap::new();
        let mut pins = BTreeSet::new();
        for config in configs {
            if entries.contains_key(&config.note) {
                return Err(ConfigError::Invalid(format!(
                    "note {} is mapped more than once",
                    config.note
                )));
            }
            if !pins.insert(config.pin) {
                return Err(ConfigError::Invalid(format!(
                    "pin {} is shared by more than one note",
                    config.pin
                )));
            }
            entries.insert(config.note, config);
        }
        Ok(Self { entries })
    }

    pub fn channel_for(&self, note: NoteId) -> Option<ChannelId> {
        self.entries.get(&note).map(|c| c.pin)
    }

    pub fn contains_pin(&self, pin: ChannelId) -> bool {
        self.entries.values().any(|c| c.pin == pin)
    }

    pub fn name_for(&self, note: NoteId) -> Option<&str> {
        self.entries.get(&note).and_then(|c| c.name.as_deref())
    }

    /// Every mapped channel, in note order.
    pub fn channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.entries.values().map(|c| c.pin)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TempoChange(u32),          // microseconds per beat
    NoteOn(NoteId, u8),        // (note, velocity)
    NoteOff(NoteId),           // (note)
    ProgramChange(u8),         // (program)
    Other,
}

/// One timeline entry; `delta` is in ticks since the previous event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedEvent {
    pub delta: u32,
    pub kind: EventKind,
}

impl TimedEvent {
    pub fn new(delta: u32, kind: EventKind) -> Self {
        Self { delta, kind }
    }
}
