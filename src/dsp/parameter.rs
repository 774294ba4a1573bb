//! Parameter definitions for processors.
//!
//! Every processor parameter is addressed by index and exchanged in the
//! normalized domain [0, 1]. A [`ParameterDefinition`] maps that domain onto
//! the parameter's plain range and formats it for display.

/// How a parameter value should be displayed and interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterDisplay {
    /// Continuous value with a unit suffix (e.g., "dB", "%").
    Linear { unit: &'static str },
    /// Discrete steps with named values.
    Discrete { labels: &'static [&'static str] },
    /// On/off switch. Normalized values >= 0.5 are on.
    Toggle,
}

/// Definition of one processor parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterDefinition {
    /// Stable identifier, used by control-surface documents.
    pub id: &'static str,
    /// Human-readable name.
    pub name: &'static str,
    /// Minimum plain value.
    pub min: f32,
    /// Maximum plain value.
    pub max: f32,
    /// Default plain value.
    pub default: f32,
    /// How to display and interpret the value.
    pub display: ParameterDisplay,
}

impl ParameterDefinition {
    /// Creates a continuous parameter over `[min, max]`.
    pub fn linear(
        id: &'static str,
        name: &'static str,
        min: f32,
        max: f32,
        default: f32,
        unit: &'static str,
    ) -> Self {
        Self {
            id,
            name,
            min,
            max,
            default,
            display: ParameterDisplay::Linear { unit },
        }
    }

    /// Creates a toggle (boolean) parameter.
    pub fn toggle(id: &'static str, name: &'static str, default: bool) -> Self {
        Self {
            id,
            name,
            min: 0.0,
            max: 1.0,
            default: if default { 1.0 } else { 0.0 },
            display: ParameterDisplay::Toggle,
        }
    }

    /// Creates a discrete choice parameter.
    pub fn choice(
        id: &'static str,
        name: &'static str,
        labels: &'static [&'static str],
        default_index: usize,
    ) -> Self {
        Self {
            id,
            name,
            min: 0.0,
            max: labels.len().saturating_sub(1) as f32,
            default: default_index as f32,
            display: ParameterDisplay::Discrete { labels },
        }
    }

    /// Maps a plain value into [0, 1].
    pub fn normalize(&self, value: f32) -> f32 {
        let span = self.max - self.min;
        if span.abs() < f32::EPSILON {
            0.0
        } else {
            ((value - self.min) / span).clamp(0.0, 1.0)
        }
    }

    /// Maps a normalized value back into the plain range.
    ///
    /// Discrete parameters snap to the nearest step.
    pub fn denormalize(&self, normalized: f32) -> f32 {
        let plain = self.min + normalized.clamp(0.0, 1.0) * (self.max - self.min);
        match self.display {
            ParameterDisplay::Discrete { .. } => plain.round(),
            ParameterDisplay::Toggle => {
                if normalized >= 0.5 {
                    self.max
                } else {
                    self.min
                }
            }
            ParameterDisplay::Linear { .. } => plain,
        }
    }

    /// Returns the default value in the normalized domain.
    pub fn default_normalized(&self) -> f32 {
        self.normalize(self.default)
    }

    /// Formats a normalized value for display.
    pub fn format(&self, normalized: f32) -> String {
        let plain = self.denormalize(normalized);
        match self.display {
            ParameterDisplay::Linear { unit } if unit.is_empty() => format!("{plain:.2}"),
            ParameterDisplay::Linear { unit } => format!("{plain:.2} {unit}"),
            ParameterDisplay::Discrete { labels } => labels
                .get(plain as usize)
                .copied()
                .unwrap_or("?")
                .to_string(),
            ParameterDisplay::Toggle => {
                if plain >= 0.5 { "On" } else { "Off" }.to_string()
            }
        }
    }
}

/// Returns true when a normalized toggle value means "on".
pub fn is_on(normalized: f32) -> bool {
    normalized >= 0.5
}
