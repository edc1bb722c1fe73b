//! Walks a timeline in order, sleeping out each event's delta under the current tempo and
//! turning note events into valve writes.
//!
//! Lifecycle: `Idle -> Priming -> Playing -> Stopping -> Idle`. Priming starts the bellows and
//! waits for pressure before the first event. Stopping releases every sounding note and then
//! the bellows. [`PlaybackEngine::cleanup`] additionally shuts every pin and releases the
//! backend; it also runs on drop.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::actuator::ActuatorDriver;
use crate::error::EngineError;
use crate::note::{EventKind, NoteId, TimedEvent};
use crate::tempo::TempoClock;
use crate::timeline::{Timeline, TimelineSource};

pub const DEFAULT_WARMUP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Priming,
    Playing,
    Stopping,
}

/// Cross-thread stop request. The host sets it, the engine polls it between events.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }
}

/// Blocks the playback thread between events.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records waits instead of blocking. Used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    waits: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().clone()
    }

    pub fn total(&self) -> Duration {
        self.waits.lock().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&mut self, duration: Duration) {
        self.waits.lock().push(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Time the bellows get to build pressure before the first event.
    pub warmup: Duration,
    /// When set, waits are cut into slices this long and a stop request ends them early.
    pub stop_poll: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            warmup: DEFAULT_WARMUP,
            stop_poll: None,
        }
    }
}

/// What happened during one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackReport {
    pub events_dispatched: usize,
    pub notes_played: usize,
    pub unmapped_notes: usize,
    pub invalid_tempos: usize,
    pub actuator_faults: usize,
    /// Sum of every wait, warm-up included.
    pub scheduled: Duration,
    pub stopped_early: bool,
}

pub struct PlaybackEngine {
    driver: ActuatorDriver,
    clock: TempoClock,
    active: BTreeSet<NoteId>,
    state: PlaybackState,
    stop: StopHandle,
    sleeper: Box<dyn Sleeper>,
    settings: EngineSettings,
}

impl PlaybackEngine {
    /// Takes ownership of the driver and puts every pin in a known low state.
    pub fn new(mut driver: ActuatorDriver, settings: EngineSettings) -> Self {
        driver.initialize();
        Self {
            driver,
            clock: TempoClock::default(),
            active: BTreeSet::new(),
            state: PlaybackState::Idle,
            stop: StopHandle::new(),
            sleeper: Box::new(ThreadSleeper),
            settings,
        }
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn active_notes(&self) -> &BTreeSet<NoteId> {
        &self.active
    }

    pub fn clock(&self) -> &TempoClock {
        &self.clock
    }

    pub fn driver(&self) -> &ActuatorDriver {
        &self.driver
    }

    /// Load `track` from `source` and play it to the end or until stopped.
    ///
    /// A load failure leaves the engine idle with no pin touched.
    pub fn start<S>(&mut self, source: &S, track: usize) -> Result<PlaybackReport, EngineError>
    where
        S: TimelineSource + ?Sized,
    {
        let timeline = source.load(track)?;
        info!("Playing track {track}: {}", timeline.name);
        Ok(self.play(&timeline))
    }

    /// Play an already loaded timeline. Always ends idle with the bellows off.
    pub fn play(&mut self, timeline: &Timeline) -> PlaybackReport {
        self.driver.initialize();
        self.clock = TempoClock::new(timeline.initial_tempo, timeline.ticks_per_beat);
        let faults_before = self.driver.faults();
        let mut report = PlaybackReport::default();

        self.state = PlaybackState::Priming;
        if self.driver.set_master_supply(true).is_err() {
            warn!("Bellows did not start; playing anyway");
        }
        report.scheduled += self.settings.warmup;
        self.wait(self.settings.warmup);

        self.state = PlaybackState::Playing;
        for event in &timeline.events {
            if self.stop.is_stop_requested() {
                report.stopped_early = true;
                break;
            }
            if event.delta > 0 {
                let wait = self.clock.duration_for(event.delta);
                report.scheduled += wait;
                self.wait(wait);
                if self.stop.is_stop_requested() {
                    report.stopped_early = true;
                    break;
                }
            }
            self.dispatch(event, &mut report);
        }
        if report.stopped_early {
            info!("Playback stopped on request");
        }

        self.stop_playback();
        self.stop.clear();
        report.actuator_faults = self.driver.faults() - faults_before;
        report
    }

    /// Release everything and shut every pin. Safe to call repeatedly, from any state.
    pub fn cleanup(&mut self) {
        self.stop_playback();
        self.driver.shutdown_all();
        self.clock = TempoClock::default();
    }

    fn dispatch(&mut self, event: &TimedEvent, report: &mut PlaybackReport) {
        report.events_dispatched += 1;
        match event.kind {
            EventKind::TempoChange(tempo) => match self.clock.set_tempo(tempo) {
                Ok(()) => info!("Tempo changed to: {tempo} microseconds per beat"),
                Err(e) => {
                    warn!("Ignoring tempo change: {e}");
                    report.invalid_tempos += 1;
                }
            },
            EventKind::NoteOn(note, velocity) if velocity > 0 => {
                if self.note_on(note, velocity) {
                    report.notes_played += 1;
                } else if self.driver.channels().channel_for(note).is_none() {
                    report.unmapped_notes += 1;
                }
            }
            EventKind::NoteOn(note, _) | EventKind::NoteOff(note) => {
                if !self.note_off(note) {
                    report.unmapped_notes += 1;
                }
            }
            EventKind::ProgramChange(program) => debug!("Program change: {program}"),
            EventKind::Other => {}
        }
    }

    /// `true` when the valve opened.
    fn note_on(&mut self, note: NoteId, velocity: u8) -> bool {
        let Some(pin) = self.driver.channels().channel_for(note) else {
            warn!("Note {note} not mapped to GPIO (Note ON, velocity {velocity})");
            return false;
        };
        if self.driver.set_channel(pin, true).is_err() {
            return false;
        }
        self.active.insert(note);
        let name = self.driver.channels().name_for(note).unwrap_or("");
        debug!("Note ON: {note} {name} (Pin {pin}) Velocity: {velocity}");
        true
    }

    /// `false` when the note is unmapped.
    fn note_off(&mut self, note: NoteId) -> bool {
        let Some(pin) = self.driver.channels().channel_for(note) else {
            warn!("Note {note} not mapped to GPIO (Note OFF)");
            return false;
        };
        // A failed close stays a fault on the driver; shutdown retries the pin.
        let _ = self.driver.set_channel(pin, false);
        self.active.remove(&note);
        debug!("Note OFF: {note} (Pin {pin})");
        true
    }

    fn stop_playback(&mut self) {
        if self.state != PlaybackState::Idle || !self.active.is_empty() {
            self.state = PlaybackState::Stopping;
        }
        for note in std::mem::take(&mut self.active) {
            self.note_off(note);
        }
        if self.driver.level(self.driver.master_pin()) != Some(false)
            && self.driver.set_master_supply(false).is_err()
        {
            warn!("Bellows did not stop; shutdown will retry");
        }
        self.state = PlaybackState::Idle;
    }

    fn wait(&mut self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        match self.settings.stop_poll {
            Some(slice) if !slice.is_zero() => {
                let mut remaining = duration;
                while !remaining.is_zero() && !self.stop.is_stop_requested() {
                    let step = remaining.min(slice);
                    self.sleeper.sleep(step);
                    remaining -= step;
                }
            }
            _ => self.sleeper.sleep(duration),
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("state", &self.state)
            .field("clock", &self.clock)
            .field("active", &self.active)
            .field("driver", &self.driver)
            .finish()
    }
}
