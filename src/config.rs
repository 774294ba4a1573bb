//! Engine configuration.
//!
//! Loaded from a TOML file. Every field is optional; missing fields take
//! their defaults.
//!
//! ```toml
//! sample_rate = 44100
//! block_size = 128
//!
//! [sync]
//! clock_floor_bpm = 10.0
//! beats_per_bar = 4
//!
//! [loops]
//! max_seconds = 30.0
//!
//! [midi]
//! port = "Launchpad"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dsp::midi::DEFAULT_MIDI_BUFFER_CAPACITY;
use crate::dsp::registry::BuiltinOptions;
use crate::engine::channels::{DEFAULT_COMMAND_BUFFER_SIZE, DEFAULT_EVENT_BUFFER_SIZE};
use crate::engine::dispatcher::DEFAULT_MIDI_INPUT_QUEUE_SIZE;
use crate::engine::graph::GraphConfig;
use crate::modules::audio_loop::DEFAULT_MAX_LOOP_SECONDS;
use crate::modules::midi_loop::DEFAULT_LOOP_EVENT_CAPACITY;
use crate::sync::playhead::SyncOptions;

/// Errors that can occur while loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write config file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Loop recorder capacities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Events a MIDI loop can hold.
    pub event_capacity: usize,
    /// Longest audio loop, in seconds.
    pub max_seconds: f64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_LOOP_EVENT_CAPACITY,
            max_seconds: DEFAULT_MAX_LOOP_SECONDS,
        }
    }
}

/// MIDI input settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiConfig {
    /// Client name announced to the MIDI system.
    pub client_name: String,
    /// Input port to open, matched as a case-insensitive substring of the
    /// port name. `None` opens nothing.
    pub port: Option<String>,
    /// Capacity of the queue carrying incoming MIDI to the audio thread.
    pub input_queue_size: usize,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            client_name: "loopgraph".to_string(),
            port: None,
            input_queue_size: DEFAULT_MIDI_INPUT_QUEUE_SIZE,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: f64,
    /// Largest block rendered in one pass.
    pub block_size: usize,
    pub num_channels: usize,
    /// Events each node's MIDI buffer holds per block.
    pub midi_capacity: usize,
    pub command_capacity: usize,
    pub event_capacity: usize,
    pub sync: SyncOptions,
    pub loops: LoopConfig,
    pub midi: MidiConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            block_size: 256,
            num_channels: 2,
            midi_capacity: DEFAULT_MIDI_BUFFER_CAPACITY,
            command_capacity: DEFAULT_COMMAND_BUFFER_SIZE,
            event_capacity: DEFAULT_EVENT_BUFFER_SIZE,
            sync: SyncOptions::default(),
            loops: LoopConfig::default(),
            midi: MidiConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteFile {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        }

        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return invalid("sample_rate", "must be positive");
        }
        if self.block_size == 0 {
            return invalid("block_size", "must be at least 1");
        }
        if self.num_channels == 0 {
            return invalid("num_channels", "must be at least 1");
        }
        if self.command_capacity == 0 || self.event_capacity == 0 {
            return invalid("command_capacity", "queues must hold at least one entry");
        }
        if self.sync.beats_per_bar == 0 {
            return invalid("sync.beats_per_bar", "must be at least 1");
        }
        if self.sync.time_sig_numerator == 0 || self.sync.time_sig_denominator == 0 {
            return invalid("sync.time_sig_numerator", "time signature must be non-zero");
        }
        if !(self.loops.max_seconds > 0.0) {
            return invalid("loops.max_seconds", "must be positive");
        }
        Ok(())
    }

    pub fn graph_config(&self) -> GraphConfig {
        GraphConfig {
            sample_rate: self.sample_rate,
            block_size: self.block_size,
            num_channels: self.num_channels,
            midi_capacity: self.midi_capacity,
            command_capacity: self.command_capacity,
            event_capacity: self.event_capacity,
        }
    }

    pub fn builtin_options(&self) -> BuiltinOptions {
        BuiltinOptions {
            num_channels: self.num_channels,
            loop_event_capacity: self.loops.event_capacity,
            midi_capacity: self.midi_capacity,
            max_loop_seconds: self.loops.max_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(EngineConfig::from_toml("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml(
            r#"
            block_size = 128

            [sync]
            beats_per_bar = 3

            [midi]
            port = "Launch"
            "#,
        )
        .unwrap();

        assert_eq!(config.block_size, 128);
        assert_eq!(config.sample_rate, 48000.0);
        assert_eq!(config.sync.beats_per_bar, 3);
        assert_eq!(config.sync.clock_floor_bpm, 10.0);
        assert_eq!(config.midi.port.as_deref(), Some("Launch"));
        assert_eq!(config.midi.client_name, "loopgraph");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            EngineConfig::from_toml("block_size = 0"),
            Err(ConfigError::Invalid {
                field: "block_size",
                ..
            })
        ));
        assert!(matches!(
            EngineConfig::from_toml("sample_rate = -1.0"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            EngineConfig::from_toml("block_size = \"big\""),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut config = EngineConfig::default();
        config.num_channels = 4;
        config.loops.max_seconds = 12.5;
        config.midi.port = Some("Keys".into());

        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            EngineConfig::load("/nonexistent/engine.toml"),
            Err(ConfigError::ReadFile { .. })
        ));
    }

    #[test]
    fn test_derived_configs() {
        let config = EngineConfig::from_toml("num_channels = 1\n[loops]\nevent_capacity = 64").unwrap();
        assert_eq!(config.graph_config().num_channels, 1);
        assert_eq!(config.builtin_options().loop_event_capacity, 64);
        assert_eq!(config.builtin_options().num_channels, 1);
    }
}
