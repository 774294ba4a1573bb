//! Control actions.
//!
//! A [`ControlAction`] binds an external control (a MIDI CC, or another
//! node's parameter) to a parameter of a graph node.

use serde::{Deserialize, Serialize};

use crate::engine::commands::NodeId;

/// What drives an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlSource {
    /// A MIDI control change. `channel: None` matches any channel.
    MidiCc { channel: Option<u8>, controller: u8 },
    /// A parameter of another node.
    PluginParameter { node: NodeId, index: usize },
}

/// The parameter an action drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlTarget {
    pub node: NodeId,
    pub parameter: usize,
}

fn default_max() -> f32 {
    1.0
}

/// A mapping from a control source to a target parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlAction {
    pub source: ControlSource,
    pub target: ControlTarget,
    /// Flip the normalized input before scaling.
    #[serde(default)]
    pub invert: bool,
    /// Target value for a normalized input of 0.
    #[serde(default)]
    pub min: f32,
    /// Target value for a normalized input of 1.
    #[serde(default = "default_max")]
    pub max: f32,
}

impl ControlAction {
    pub fn new(source: ControlSource, target: ControlTarget) -> Self {
        Self {
            source,
            target,
            invert: false,
            min: 0.0,
            max: 1.0,
        }
    }

    pub fn inverted(mut self) -> Self {
        self.invert = !self.invert;
        self
    }

    /// Sets the output range. `min > max` is allowed and reverses direction.
    pub fn with_range(mut self, min: f32, max: f32) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Maps a normalized input to a normalized target value in `[0, 1]`.
    pub fn map_value(&self, normalized: f32) -> f32 {
        let mut value = normalized.clamp(0.0, 1.0);
        if self.invert {
            value = 1.0 - value;
        }
        (self.min + (self.max - self.min) * value).clamp(0.0, 1.0)
    }

    pub fn matches_cc(&self, channel: u8, controller: u8) -> bool {
        match self.source {
            ControlSource::MidiCc {
                channel: wanted,
                controller: cc,
            } => cc == controller && wanted.map_or(true, |wanted| wanted == channel),
            ControlSource::PluginParameter { .. } => false,
        }
    }

    pub fn matches_parameter(&self, node: NodeId, index: usize) -> bool {
        self.source == ControlSource::PluginParameter { node, index }
    }

    /// Returns true if the action reads from or writes to `node`.
    pub fn references(&self, node: NodeId) -> bool {
        self.target.node == node
            || matches!(self.source, ControlSource::PluginParameter { node: n, .. } if n == node)
    }
}

/// A parameter value produced by an action, waiting to be applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterChange {
    pub node: NodeId,
    pub parameter: usize,
    pub value: f32,
}
