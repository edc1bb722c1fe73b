use std::fs;
use std::path::Path;

use log::info;
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};

use crate::error::LoadError;
use crate::note::{EventKind, TimedEvent};
use crate::tempo::DEFAULT_TEMPO_US;

/// One playable track: ordered events plus the clock settings they were written against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeline {
    pub name: String,
    pub ticks_per_beat: u16,
    pub initial_tempo: u32,
    pub events: Vec<TimedEvent>,
}

impl Timeline {
    pub fn new(ticks_per_beat: u16, events: Vec<TimedEvent>) -> Self {
        Self {
            name: String::new(),
            ticks_per_beat,
            initial_tempo: DEFAULT_TEMPO_US,
            events,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_initial_tempo(mut self, tempo_us: u32) -> Self {
        self.initial_tempo = tempo_us;
        self
    }
}

/// Anything that can hand the engine a track by index.
pub trait TimelineSource {
    fn load(&self, track: usize) -> Result<Timeline, LoadError>;
}

/// A built timeline is a source with a single track, index 0.
impl TimelineSource for Timeline {
    fn load(&self, track: usize) -> Result<Timeline, LoadError> {
        if track == 0 {
            Ok(self.clone())
        } else {
            Err(LoadError::TrackOutOfRange {
                index: track,
                count: 1,
            })
        }
    }
}

/// A Standard MIDI File, converted track by track when opened.
#[derive(Debug, Clone)]
pub struct MidiFile {
    ticks_per_beat: u16,
    tracks: Vec<Timeline>,
}

impl MidiFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file = Self::from_bytes(&bytes)?;
        info!("Loaded MIDI file: {}", path.display());
        info!("Ticks per beat: {}", file.ticks_per_beat);
        info!("Number of tracks: {}", file.tracks.len());
        for (index, name) in file.tracks() {
            info!("Track {index}: {name}");
        }
        Ok(file)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LoadError> {
        let smf = Smf::parse(bytes).map_err(|e| LoadError::Malformed(e.to_string()))?;
        let ticks_per_beat = match smf.header.timing {
            Timing::Metrical(tpb) => tpb.as_int(),
            Timing::Timecode(..) => return Err(LoadError::UnsupportedTiming),
        };
        if ticks_per_beat == 0 {
            return Err(LoadError::Malformed("ticks per beat is zero".to_string()));
        }

        let tracks = smf
            .tracks
            .iter()
            .map(|track| convert_track(track, ticks_per_beat))
            .collect();

        Ok(Self {
            ticks_per_beat,
            tracks,
        })
    }

    pub fn ticks_per_beat(&self) -> u16 {
        self.ticks_per_beat
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// `(index, name)` for every track; unnamed tracks have an empty name.
    pub fn tracks(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.tracks
            .iter()
            .enumerate()
            .map(|(index, track)| (index, track.name.as_str()))
    }
}

impl TimelineSource for MidiFile {
    fn load(&self, track: usize) -> Result<Timeline, LoadError> {
        self.tracks
            .get(track)
            .cloned()
            .ok_or(LoadError::TrackOutOfRange {
                index: track,
                count: self.tracks.len(),
            })
    }
}

fn convert_track(track: &[TrackEvent<'_>], ticks_per_beat: u16) -> Timeline {
    let mut name = String::new();
    let events = track
        .iter()
        .map(|event| {
            if let TrackEventKind::Meta(MetaMessage::TrackName(raw)) = &event.kind {
                if name.is_empty() {
                    name = String::from_utf8_lossy(raw).trim().to_string();
                }
            }
            TimedEvent::new(event.delta.as_int(), convert_kind(&event.kind))
        })
        .collect();

    Timeline::new(ticks_per_beat, events).with_name(name)
}

fn convert_kind(kind: &TrackEventKind<'_>) -> EventKind {
    match kind {
        TrackEventKind::Midi { message, .. } => match message {
            MidiMessage::NoteOn { key, vel } => EventKind::NoteOn(key.as_int(), vel.as_int()),
            MidiMessage::NoteOff { key, .. } => EventKind::NoteOff(key.as_int()),
            MidiMessage::ProgramChange { program } => EventKind::ProgramChange(program.as_int()),
            _ => EventKind::Other,
        },
        TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => EventKind::TempoChange(tempo.as_int()),
        _ => EventKind::Other,
    }
}
