use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};

use crate::error::{ConfigError, GpioError};
use crate::gpio::GpioBackend;
use crate::note::{ChannelId, ChannelMap};

/// Valves plus the bellows, with a cached level per pin so repeated requests are free.
pub struct ActuatorDriver {
    backend: Box<dyn GpioBackend>,
    channels: ChannelMap,
    master_pin: ChannelId,
    // `None` means unknown: never written, or the last write failed.
    levels: BTreeMap<ChannelId, Option<bool>>,
    initialized: bool,
    faults: usize,
}

impl ActuatorDriver {
    /// Fails when a valve shares the bellows pin.
    pub fn new(
        backend: Box<dyn GpioBackend>,
        channels: ChannelMap,
        master_pin: ChannelId,
    ) -> Result<Self, ConfigError> {
        if channels.contains_pin(master_pin) {
            return Err(ConfigError::Invalid(format!(
                "master supply pin {master_pin} is also mapped to a note"
            )));
        }
        Ok(Self {
            backend,
            channels,
            master_pin,
            levels: BTreeMap::new(),
            initialized: false,
            faults: 0,
        })
    }

    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    pub fn master_pin(&self) -> ChannelId {
        self.master_pin
    }

    pub fn is_simulated(&self) -> bool {
        !self.backend.is_hardware()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Number of backend writes that failed so far.
    pub fn faults(&self) -> usize {
        self.faults
    }

    /// Cached level of `pin`; `None` if unknown.
    pub fn level(&self, pin: ChannelId) -> Option<bool> {
        self.levels.get(&pin).copied().flatten()
    }

    /// Claim every mapped pin and the master pin, all low. Later calls do nothing.
    pub fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;

        let pins: Vec<ChannelId> = self
            .channels
            .channels()
            .chain(std::iter::once(self.master_pin))
            .collect();
        for pin in pins {
            match self.backend.setup_output(pin) {
                Ok(()) => {
                    self.levels.insert(pin, Some(false));
                }
                Err(e) => {
                    self.record_fault(pin, &e);
                }
            }
        }
        info!(
            "Actuators ready on {}: {} valves, bellows on pin {}",
            self.backend.name(),
            self.channels.len(),
            self.master_pin
        );
    }

    pub fn set_channel(&mut self, pin: ChannelId, on: bool) -> Result<(), GpioError> {
        if self.level(pin) == Some(on) {
            return Ok(());
        }
        match self.backend.write(pin, on) {
            Ok(()) => {
                self.levels.insert(pin, Some(on));
                debug!("Pin {pin} {}", if on { "HIGH" } else { "LOW" });
                Ok(())
            }
            Err(e) => {
                self.record_fault(pin, &e);
                Err(e)
            }
        }
    }

    pub fn set_master_supply(&mut self, on: bool) -> Result<(), GpioError> {
        let was = self.level(self.master_pin);
        self.set_channel(self.master_pin, on)?;
        if was != Some(on) {
            info!("Bellows {}", if on { "started" } else { "stopped" });
        }
        Ok(())
    }

    /// Drive every known pin low regardless of the cache, then release the backend.
    /// Does nothing once released.
    pub fn shutdown_all(&mut self) {
        if !self.initialized {
            return;
        }
        let pins: Vec<ChannelId> = self
            .channels
            .channels()
            .chain(self.levels.keys().copied())
            .chain(std::iter::once(self.master_pin))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for pin in pins {
            match self.backend.write(pin, false) {
                Ok(()) => {
                    self.levels.insert(pin, Some(false));
                }
                Err(e) => self.record_fault(pin, &e),
            }
        }
        self.backend.release();
        self.initialized = false;
    }

    fn record_fault(&mut self, pin: ChannelId, error: &GpioError) {
        self.faults += 1;
        self.levels.insert(pin, None);
        warn!("Actuator fault on pin {pin}: {error}");
    }
}

impl std::fmt::Debug for ActuatorDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActuatorDriver")
            .field("backend", &self.backend.name())
            .field("master_pin", &self.master_pin)
            .field("levels", &self.levels)
            .field("faults", &self.faults)
            .finish()
    }
}
