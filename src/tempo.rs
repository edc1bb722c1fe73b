use std::time::Duration;

use crate::error::InvalidTempo;

pub const DEFAULT_TEMPO_US: u32 = 500_000;
pub const DEFAULT_TICKS_PER_BEAT: u16 = 480;

const NANOS_PER_MICRO: u128 = 1_000;

/// Current tempo plus the session's fixed resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempoClock {
    tempo_us: u32,
    ticks_per_beat: u16,
}

impl Default for TempoClock {
    fn default() -> Self {
        Self {
            tempo_us: DEFAULT_TEMPO_US,
            ticks_per_beat: DEFAULT_TICKS_PER_BEAT,
        }
    }
}

impl TempoClock {
    /// A zero resolution falls back to the default; loaders reject it before this point.
    pub fn new(tempo_us: u32, ticks_per_beat: u16) -> Self {
        let defaults = Self::default();
        Self {
            tempo_us: if tempo_us > 0 { tempo_us } else { defaults.tempo_us },
            ticks_per_beat: if ticks_per_beat > 0 {
                ticks_per_beat
            } else {
                defaults.ticks_per_beat
            },
        }
    }

    pub fn tempo(&self) -> u32 {
        self.tempo_us
    }

    pub fn ticks_per_beat(&self) -> u16 {
        self.ticks_per_beat
    }

    pub fn set_tempo(&mut self, tempo_us: u32) -> Result<(), InvalidTempo> {
        if tempo_us == 0 {
            return Err(InvalidTempo(tempo_us));
        }
        self.tempo_us = tempo_us;
        Ok(())
    }

    /// seconds = ticks * (tempo / 1_000_000) / ticks_per_beat, kept in integer nanoseconds.
    pub fn duration_for(&self, ticks: u32) -> Duration {
        if ticks == 0 {
            return Duration::ZERO;
        }
        let nanos = ticks as u128 * self.tempo_us as u128 * NANOS_PER_MICRO
            / self.ticks_per_beat as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}
