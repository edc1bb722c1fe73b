use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use bagpipe_player::gpio::{GpioJournal, GpioOp, SimulatedGpio};
use bagpipe_player::{
    ActuatorDriver, ChannelConfig, ChannelMap, ConfigError, EngineError, EngineSettings,
    EventKind, LoadError, PlaybackEngine, PlaybackState, PlayerConfig, RecordingSleeper, Sleeper,
    StopHandle, TimedEvent, Timeline,
};

const BELLOWS: u8 = 17;
const LOW_G: u8 = 1; // pin 18
const LOW_A: u8 = 2; // pin 19
const UNMAPPED: u8 = 60;

fn settings() -> EngineSettings {
    EngineSettings {
        warmup: Duration::from_secs(10),
        stop_poll: None,
    }
}

fn driver(journal: &GpioJournal) -> ActuatorDriver {
    let config = PlayerConfig::default();
    ActuatorDriver::new(
        Box::new(SimulatedGpio::with_journal(journal.clone())),
        config.channel_map().unwrap(),
        config.master_supply_pin,
    )
    .unwrap()
}

fn engine() -> (PlaybackEngine, GpioJournal, RecordingSleeper) {
    let journal = GpioJournal::default();
    let sleeper = RecordingSleeper::new();
    let engine = PlaybackEngine::new(driver(&journal), settings()).with_sleeper(sleeper.clone());
    (engine, journal, sleeper)
}

fn on(delta: u32, note: u8) -> TimedEvent {
    TimedEvent::new(delta, EventKind::NoteOn(note, 100))
}

fn off(delta: u32, note: u8) -> TimedEvent {
    TimedEvent::new(delta, EventKind::NoteOff(note))
}

#[test]
fn plays_notes_in_order_between_bellows() {
    let (mut engine, journal, sleeper) = engine();
    journal.clear_ops();
    let timeline = Timeline::new(
        480,
        vec![on(0, LOW_G), off(480, LOW_G), on(0, LOW_A), off(240, LOW_A)],
    );

    let report = engine.play(&timeline);

    assert_eq!(
        journal.writes(),
        vec![
            (BELLOWS, true),
            (18, true),
            (18, false),
            (19, true),
            (19, false),
            (BELLOWS, false),
        ]
    );
    assert_eq!(
        sleeper.waits(),
        vec![
            Duration::from_secs(10),
            Duration::from_millis(500),
            Duration::from_millis(250)
        ]
    );
    assert_eq!(report.events_dispatched, 4);
    assert_eq!(report.notes_played, 2);
    assert_eq!(report.scheduled, Duration::from_millis(10_750));
    assert!(!report.stopped_early);
    assert_eq!(engine.state(), PlaybackState::Idle);
}

#[test]
fn unmatched_notes_are_drained_at_the_end() {
    let (mut engine, journal, _sleeper) = engine();
    let timeline = Timeline::new(480, vec![on(0, LOW_G), on(10, LOW_A), on(10, 3)]);

    engine.play(&timeline);

    assert!(engine.active_notes().is_empty());
    assert!(journal.high_pins().is_empty());
    assert_eq!(journal.writes().last(), Some(&(BELLOWS, false)));
}

#[test]
fn cleanup_shuts_everything_and_releases() {
    let (mut engine, journal, _sleeper) = engine();
    engine.play(&Timeline::new(480, vec![on(0, LOW_G), on(0, 9)]));
    engine.cleanup();

    assert!(engine.active_notes().is_empty());
    assert!(journal.high_pins().is_empty());
    assert!(journal.released());
    assert_eq!(engine.clock().tempo(), 500_000);
}

#[test]
fn drop_releases_the_backend() {
    let (engine, journal, _sleeper) = engine();
    drop(engine);
    assert!(journal.released());
    assert!(journal.high_pins().is_empty());
}

#[test]
fn tempo_change_applies_to_the_following_delay() {
    let (mut engine, journal, sleeper) = engine();
    let timeline = Timeline::new(
        480,
        vec![
            TimedEvent::new(0, EventKind::TempoChange(1_000_000)),
            on(480, LOW_G),
        ],
    );

    engine.play(&timeline);

    assert_eq!(
        sleeper.waits(),
        vec![Duration::from_secs(10), Duration::from_secs(1)]
    );
    assert!(journal.writes().contains(&(18, true)));
}

#[test]
fn initial_tempo_comes_from_the_timeline() {
    let (mut engine, _journal, sleeper) = engine();
    let timeline = Timeline::new(96, vec![on(48, LOW_G)]).with_initial_tempo(400_000);

    engine.play(&timeline);

    assert_eq!(sleeper.waits()[1], Duration::from_millis(200));
}

#[test]
fn unmapped_notes_touch_no_pins() {
    let (mut engine, journal, _sleeper) = engine();
    let timeline = Timeline::new(
        480,
        vec![on(0, UNMAPPED), off(10, UNMAPPED), on(10, LOW_A), off(10, LOW_A)],
    );

    let report = engine.play(&timeline);

    assert_eq!(report.unmapped_notes, 2);
    assert_eq!(report.notes_played, 1);
    assert_eq!(
        journal.writes(),
        vec![(BELLOWS, true), (19, true), (19, false), (BELLOWS, false)]
    );
}

#[test]
fn velocity_zero_is_note_off() {
    let run = |release: TimedEvent| {
        let (mut engine, journal, _sleeper) = engine();
        let report = engine.play(&Timeline::new(480, vec![on(0, LOW_G), release]));
        (journal.writes(), report)
    };

    let (by_velocity, report_velocity) = run(TimedEvent::new(0, EventKind::NoteOn(LOW_G, 0)));
    let (by_off, report_off) = run(off(0, LOW_G));

    assert_eq!(by_velocity, by_off);
    assert_eq!(report_velocity, report_off);
    assert_eq!(
        by_off,
        vec![(BELLOWS, true), (18, true), (18, false), (BELLOWS, false)]
    );
}

#[test]
fn program_change_and_other_events_only_inform() {
    let (mut engine, journal, _sleeper) = engine();
    let timeline = Timeline::new(
        480,
        vec![
            TimedEvent::new(0, EventKind::ProgramChange(109)),
            TimedEvent::new(0, EventKind::Other),
        ],
    );

    let report = engine.play(&timeline);

    assert_eq!(report.events_dispatched, 2);
    assert_eq!(journal.writes(), vec![(BELLOWS, true), (BELLOWS, false)]);
}

/// Requests a stop the n-th time it is asked to wait, like Ctrl-C arriving mid-gap.
struct StopOnWait {
    stop: StopHandle,
    remaining: usize,
}

impl Sleeper for StopOnWait {
    fn sleep(&mut self, _duration: Duration) {
        if self.remaining == 0 {
            return;
        }
        self.remaining -= 1;
        if self.remaining == 0 {
            self.stop.request_stop();
        }
    }
}

#[test]
fn stop_between_events_skips_the_rest() {
    let journal = GpioJournal::default();
    let stop = StopHandle::new();
    // Wait #1 is the warm-up, #2 is the gap before the second note.
    let sleeper = StopOnWait {
        stop: stop.clone(),
        remaining: 2,
    };
    let mut engine = PlaybackEngine::new(driver(&journal), settings())
        .with_stop_handle(stop.clone())
        .with_sleeper(sleeper);
    let timeline = Timeline::new(480, vec![on(0, LOW_G), on(480, LOW_A), off(480, LOW_G)]);

    let report = engine.play(&timeline);

    assert!(report.stopped_early);
    assert_eq!(report.events_dispatched, 1);
    assert!(!journal.writes().contains(&(19, true)));
    assert_eq!(
        journal.writes(),
        vec![(BELLOWS, true), (18, true), (18, false), (BELLOWS, false)]
    );
    assert_eq!(engine.state(), PlaybackState::Idle);
    assert!(engine.active_notes().is_empty());
    assert!(!stop.is_stop_requested());
}

#[test]
fn stop_from_another_thread_ends_a_long_gap() {
    let journal = GpioJournal::default();
    let stop = StopHandle::new();
    let (ready_tx, ready_rx) = mpsc::channel();

    let player = {
        let journal = journal.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let settings = EngineSettings {
                warmup: Duration::ZERO,
                stop_poll: Some(Duration::from_millis(5)),
            };
            let mut engine = PlaybackEngine::new(driver(&journal), settings).with_stop_handle(stop);
            ready_tx.send(()).unwrap();
            // A 60 second gap before the second note.
            let timeline = Timeline::new(1, vec![on(0, LOW_G), on(120, LOW_A)]);
            engine.play(&timeline)
        })
    };

    ready_rx.recv().unwrap();
    let started = Instant::now();
    while journal.level(18) != Some(true) {
        assert!(started.elapsed() < Duration::from_secs(5), "first note never played");
        thread::sleep(Duration::from_millis(1));
    }
    stop.request_stop();

    let report = player.join().unwrap();
    assert!(report.stopped_early);
    assert!(started.elapsed() < Duration::from_secs(30));
    assert!(!journal.writes().contains(&(19, true)));
    assert!(journal.high_pins().is_empty());
}

#[test]
fn load_failure_leaves_pins_untouched() {
    let (mut engine, journal, _sleeper) = engine();
    journal.clear_ops();
    let timeline = Timeline::new(480, vec![on(0, LOW_G)]);

    let err = engine.start(&timeline, 3).unwrap_err();

    assert!(matches!(
        err,
        EngineError::Load(LoadError::TrackOutOfRange { index: 3, count: 1 })
    ));
    assert!(journal.ops().is_empty());
    assert_eq!(engine.state(), PlaybackState::Idle);
}

#[test]
fn start_plays_the_selected_track() {
    let (mut engine, journal, _sleeper) = engine();
    let timeline = Timeline::new(480, vec![on(0, LOW_G), off(480, LOW_G)]).with_name("Chanter");

    let report = engine.start(&timeline, 0).unwrap();

    assert_eq!(report.notes_played, 1);
    assert!(journal.writes().contains(&(18, true)));
}

#[test]
fn actuator_fault_does_not_stop_playback() {
    let (mut engine, journal, _sleeper) = engine();
    journal.fail_pin(18);
    let timeline = Timeline::new(
        480,
        vec![on(0, LOW_G), on(0, LOW_A), off(10, LOW_A), off(0, LOW_G)],
    );

    let report = engine.play(&timeline);

    assert_eq!(report.actuator_faults, 2);
    assert_eq!(report.notes_played, 1);
    assert!(journal.writes().contains(&(19, false)));

    journal.heal_pin(18);
    engine.cleanup();
    assert!(journal.ops().contains(&GpioOp::Write(18, false)));
    assert!(journal.high_pins().is_empty());
}

#[test]
fn engine_can_play_again_after_cleanup() {
    let (mut engine, journal, _sleeper) = engine();
    engine.play(&Timeline::new(480, vec![on(0, LOW_G)]));
    engine.cleanup();
    journal.clear_ops();

    engine.play(&Timeline::new(480, vec![on(0, LOW_A)]));

    assert!(journal.ops().contains(&GpioOp::Setup(19)));
    assert!(journal.writes().contains(&(19, true)));
    assert!(journal.high_pins().is_empty());
}

#[test]
fn valves_cannot_share_a_pin_or_the_bellows() {
    let entry = |note, pin| ChannelConfig {
        note,
        pin,
        name: None,
    };

    let shared = ChannelMap::new([entry(LOW_G, 18), entry(LOW_A, 18)]);
    assert!(matches!(shared, Err(ConfigError::Invalid(_))));

    let map = ChannelMap::new([entry(LOW_G, 18), entry(LOW_A, BELLOWS)]).unwrap();
    let on_bellows = ActuatorDriver::new(Box::new(SimulatedGpio::new()), map, BELLOWS);
    assert!(matches!(on_bellows, Err(ConfigError::Invalid(_))));
}

#[test]
fn releasing_one_valve_leaves_the_other_open() {
    let (mut engine, journal, _sleeper) = engine();
    journal.clear_ops();

    engine.play(&Timeline::new(
        480,
        vec![on(0, LOW_G), on(0, LOW_A), off(0, LOW_G)],
    ));

    // Low A is only closed by the end-of-tune drain.
    assert_eq!(
        journal.writes(),
        vec![
            (BELLOWS, true),
            (18, true),
            (19, true),
            (18, false),
            (19, false),
            (BELLOWS, false),
        ]
    );
}
