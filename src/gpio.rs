//! Pin-level output backends.
//!
//! The driver only ever talks to a [`GpioBackend`]; which one it gets is decided once at
//! startup by [`detect`]. Real hardware sits behind the `rpi` feature, everything else is
//! simulated so the player runs (and is tested) on any machine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{info, warn};
use midir::{MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;

use crate::error::GpioError;
use crate::note::ChannelId;

pub trait GpioBackend {
    /// Claim `pin` as an output, driven low.
    fn setup_output(&mut self, pin: ChannelId) -> Result<(), GpioError>;

    fn write(&mut self, pin: ChannelId, on: bool) -> Result<(), GpioError>;

    /// Give every claimed pin back. Pins must be written low first.
    fn release(&mut self);

    /// `false` when writes only record intent.
    fn is_hardware(&self) -> bool;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioOp {
    Setup(ChannelId),
    Write(ChannelId, bool),
    Release,
}

#[derive(Debug, Default)]
struct JournalInner {
    ops: Vec<GpioOp>,
    levels: BTreeMap<ChannelId, bool>,
    failing: BTreeSet<ChannelId>,
}

/// Shared record of everything a [`SimulatedGpio`] was asked to do.
///
/// Cloning shares the record, so a caller can keep a handle after moving the backend
/// into a driver.
#[derive(Debug, Clone, Default)]
pub struct GpioJournal {
    inner: Arc<Mutex<JournalInner>>,
}

impl GpioJournal {
    pub fn ops(&self) -> Vec<GpioOp> {
        self.inner.lock().ops.clone()
    }

    pub fn writes(&self) -> Vec<(ChannelId, bool)> {
        self.inner
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                GpioOp::Write(pin, on) => Some((*pin, *on)),
                _ => None,
            })
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.writes().len()
    }

    /// Last level written to `pin`, `None` if never set up.
    pub fn level(&self, pin: ChannelId) -> Option<bool> {
        self.inner.lock().levels.get(&pin).copied()
    }

    pub fn high_pins(&self) -> Vec<ChannelId> {
        self.inner
            .lock()
            .levels
            .iter()
            .filter(|(_, on)| **on)
            .map(|(pin, _)| *pin)
            .collect()
    }

    pub fn released(&self) -> bool {
        self.inner.lock().ops.contains(&GpioOp::Release)
    }

    pub fn clear_ops(&self) {
        self.inner.lock().ops.clear();
    }

    /// Make every write to `pin` fail until [`GpioJournal::heal_pin`].
    pub fn fail_pin(&self, pin: ChannelId) {
        self.inner.lock().failing.insert(pin);
    }

    pub fn heal_pin(&self, pin: ChannelId) {
        self.inner.lock().failing.remove(&pin);
    }
}

/// Backend used when no GPIO device is present; records intent in a [`GpioJournal`].
#[derive(Debug, Default)]
pub struct SimulatedGpio {
    journal: GpioJournal,
}

impl SimulatedGpio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: GpioJournal) -> Self {
        Self { journal }
    }

    pub fn journal(&self) -> GpioJournal {
        self.journal.clone()
    }
}

impl GpioBackend for SimulatedGpio {
    fn setup_output(&mut self, pin: ChannelId) -> Result<(), GpioError> {
        let mut inner = self.journal.inner.lock();
        inner.ops.push(GpioOp::Setup(pin));
        inner.levels.insert(pin, false);
        Ok(())
    }

    fn write(&mut self, pin: ChannelId, on: bool) -> Result<(), GpioError> {
        let mut inner = self.journal.inner.lock();
        if !inner.levels.contains_key(&pin) {
            return Err(GpioError::NotConfigured(pin));
        }
        if inner.failing.contains(&pin) {
            return Err(GpioError::Write {
                pin,
                message: "simulated fault".to_string(),
            });
        }
        inner.ops.push(GpioOp::Write(pin, on));
        inner.levels.insert(pin, on);
        Ok(())
    }

    fn release(&mut self) {
        self.journal.inner.lock().ops.push(GpioOp::Release);
    }

    fn is_hardware(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "simulation"
    }
}

const MIRROR_VELOCITY: u8 = 100;

/// Mirrors every pin write as a MIDI note (note number = pin) on an output port.
///
/// Lets a synth stand in for the valves on the bench.
pub struct MidiMirrorGpio {
    port_name: String,
    connection: MidiOutputConnection,
    high: BTreeSet<ChannelId>,
    configured: BTreeSet<ChannelId>,
}

impl MidiMirrorGpio {
    pub fn connect(port_index: usize) -> Result<Self, GpioError> {
        let output = MidiOutput::new("bagpipe-player")
            .map_err(|e| GpioError::Unavailable(format!("couldn't create MIDI output: {e}")))?;
        let ports = output.ports();
        let Some(port) = ports.get(port_index) else {
            return Err(GpioError::Unavailable(format!(
                "MIDI output port {port_index} does not exist ({} available)",
                ports.len()
            )));
        };
        let port_name = output
            .port_name(port)
            .unwrap_or_else(|_| format!("Port {port_index}"));
        let connection = output
            .connect(port, "bagpipe-mirror")
            .map_err(|e| GpioError::Unavailable(format!("couldn't open {port_name}: {e}")))?;
        info!("Mirroring valves to MIDI output: {port_name}");

        Ok(Self {
            port_name,
            connection,
            high: BTreeSet::new(),
            configured: BTreeSet::new(),
        })
    }

    fn send(&mut self, pin: ChannelId, on: bool) -> Result<(), GpioError> {
        let note = mirror_note(pin)?;
        let message = if on {
            [0x90, note, MIRROR_VELOCITY]
        } else {
            [0x80, note, 0]
        };
        self.connection
            .send(&message)
            .map_err(|e| GpioError::Write {
                pin,
                message: e.to_string(),
            })
    }
}

/// MIDI note standing in for `pin`; pins above 127 have none.
fn mirror_note(pin: ChannelId) -> Result<u8, GpioError> {
    if pin > 0x7F {
        return Err(GpioError::Write {
            pin,
            message: "no MIDI note for pins above 127".to_string(),
        });
    }
    Ok(pin)
}

impl GpioBackend for MidiMirrorGpio {
    fn setup_output(&mut self, pin: ChannelId) -> Result<(), GpioError> {
        mirror_note(pin)?;
        self.configured.insert(pin);
        self.send(pin, false)
    }

    fn write(&mut self, pin: ChannelId, on: bool) -> Result<(), GpioError> {
        if !self.configured.contains(&pin) {
            return Err(GpioError::NotConfigured(pin));
        }
        self.send(pin, on)?;
        if on {
            self.high.insert(pin);
        } else {
            self.high.remove(&pin);
        }
        Ok(())
    }

    fn release(&mut self) {
        let stuck: Vec<_> = self.high.iter().copied().collect();
        for pin in stuck {
            if let Err(e) = self.send(pin, false) {
                warn!("Couldn't silence mirrored pin {pin}: {e}");
            }
        }
        self.high.clear();
        self.configured.clear();
    }

    fn is_hardware(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        &self.port_name
    }
}

/// Names of the MIDI output ports [`MidiMirrorGpio::connect`] accepts, by index.
pub fn mirror_ports() -> Result<Vec<String>, GpioError> {
    let output = MidiOutput::new("bagpipe-player")
        .map_err(|e| GpioError::Unavailable(format!("couldn't create MIDI output: {e}")))?;
    Ok(output
        .ports()
        .iter()
        .enumerate()
        .map(|(index, port)| {
            output
                .port_name(port)
                .unwrap_or_else(|_| format!("Port {index}"))
        })
        .collect())
}

#[cfg(feature = "rpi")]
pub use rpi::RpiGpio;

#[cfg(feature = "rpi")]
mod rpi {
    use std::collections::BTreeMap;

    use rppal::gpio::{Gpio, OutputPin};

    use super::GpioBackend;
    use crate::error::GpioError;
    use crate::note::ChannelId;

    /// BCM-numbered output pins through `/dev/gpiomem`.
    pub struct RpiGpio {
        gpio: Gpio,
        pins: BTreeMap<ChannelId, OutputPin>,
    }

    impl RpiGpio {
        pub fn new() -> Result<Self, GpioError> {
            let gpio = Gpio::new().map_err(|e| GpioError::Unavailable(e.to_string()))?;
            Ok(Self {
                gpio,
                pins: BTreeMap::new(),
            })
        }
    }

    impl GpioBackend for RpiGpio {
        fn setup_output(&mut self, pin: ChannelId) -> Result<(), GpioError> {
            let output = self
                .gpio
                .get(pin)
                .map_err(|e| GpioError::Write {
                    pin,
                    message: e.to_string(),
                })?
                .into_output_low();
            self.pins.insert(pin, output);
            Ok(())
        }

        fn write(&mut self, pin: ChannelId, on: bool) -> Result<(), GpioError> {
            let output = self
                .pins
                .get_mut(&pin)
                .ok_or(GpioError::NotConfigured(pin))?;
            if on {
                output.set_high();
            } else {
                output.set_low();
            }
            Ok(())
        }

        fn release(&mut self) {
            // Dropping an OutputPin restores the pin's previous mode.
            for output in self.pins.values_mut() {
                output.set_low();
            }
            self.pins.clear();
        }

        fn is_hardware(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "rpi-gpio"
        }
    }
}

/// Which backend the player should drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// Hardware when available, simulation otherwise.
    #[default]
    Auto,
    Simulate,
    MidiMirror(usize),
}

/// Pick a backend. Falls back to simulation, with a warning, when hardware can't be opened.
pub fn detect(choice: BackendChoice) -> Box<dyn GpioBackend> {
    match choice {
        BackendChoice::Simulate => Box::new(SimulatedGpio::new()),
        BackendChoice::MidiMirror(port) => match MidiMirrorGpio::connect(port) {
            Ok(mirror) => Box::new(mirror),
            Err(e) => {
                warn!("{e} - running in simulation mode");
                Box::new(SimulatedGpio::new())
            }
        },
        BackendChoice::Auto => hardware_or_simulation(),
    }
}

#[cfg(feature = "rpi")]
fn hardware_or_simulation() -> Box<dyn GpioBackend> {
    match RpiGpio::new() {
        Ok(gpio) => Box::new(gpio),
        Err(e) => {
            warn!("{e} - running in simulation mode");
            Box::new(SimulatedGpio::new())
        }
    }
}

#[cfg(not(feature = "rpi"))]
fn hardware_or_simulation() -> Box<dyn GpioBackend> {
    warn!("Built without the `rpi` feature - running in simulation mode");
    Box::new(SimulatedGpio::new())
}
