use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::EngineSettings;
use crate::error::ConfigError;
use crate::note::{ChannelConfig, ChannelId, ChannelMap};

pub const DEFAULT_MASTER_SUPPLY_PIN: ChannelId = 17;
pub const DEFAULT_WARMUP_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Pin switching the bellows / air supply.
    pub master_supply_pin: ChannelId,
    pub warmup_ms: u64,
    /// Check for Ctrl-C this often during long waits instead of only between events.
    pub stop_poll_ms: Option<u64>,
    pub channels: Vec<ChannelConfig>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        let names = ["Low G", "Low A", "B", "C", "D", "E", "F#", "High G", "High A"];
        let channels = names
            .iter()
            .zip(1u8..)
            .map(|(name, note)| ChannelConfig {
                note,
                pin: 17 + note,
                name: Some(name.to_string()),
            })
            .collect();

        Self {
            master_supply_pin: DEFAULT_MASTER_SUPPLY_PIN,
            warmup_ms: DEFAULT_WARMUP_MS,
            stop_poll_ms: None,
            channels,
        }
    }
}

impl PlayerConfig {
    pub fn from_json(json: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|source| ConfigError::Json {
            path: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let map = self.channel_map()?;
        if map.contains_pin(self.master_supply_pin) {
            return Err(ConfigError::Invalid(format!(
                "master supply pin {} is also mapped to a note",
                self.master_supply_pin
            )));
        }
        Ok(())
    }

    pub fn channel_map(&self) -> Result<ChannelMap, ConfigError> {
        ChannelMap::new(self.channels.iter().cloned())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            warmup: Duration::from_millis(self.warmup_ms),
            stop_poll: self.stop_poll_ms.map(Duration::from_millis),
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<PlayerConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    PlayerConfig::from_json(&content, &path.display().to_string())
}
