//! Gain utility.
//!
//! Scales every channel by a level in decibels, ramping linearly across
//! each block so level changes don't click.

use crate::dsp::{
    context::ProcessContext,
    midi::MidiBuffer,
    parameter::ParameterDefinition,
    processor::{Processor, ProcessorError, ProcessorInfo, RenderFault},
    signal::AudioBuffer,
};

const INFO: ProcessorInfo = ProcessorInfo::new("util.gain", "Gain", "Scales audio by a level in dB");

/// Levels at or below this are treated as silence.
const MIN_DB: f32 = -60.0;
const MAX_DB: f32 = 12.0;

/// A stereo gain stage.
pub struct Gain {
    parameters: Vec<ParameterDefinition>,
    num_channels: usize,
    /// Normalized level parameter.
    level: f32,
    /// Linear gain reached at the end of the previous block.
    current: f32,
}

impl Gain {
    pub fn new(num_channels: usize) -> Self {
        let param = ParameterDefinition::linear("level", "Level", MIN_DB, MAX_DB, 0.0, "dB");
        let level = param.default_normalized();
        Self {
            parameters: vec![param],
            num_channels,
            level,
            current: 1.0,
        }
    }

    fn target_gain(&self) -> f32 {
        let db = self.parameters[0].denormalize(self.level);
        if db <= MIN_DB {
            0.0
        } else {
            10.0_f32.powf(db / 20.0)
        }
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::new(2)
    }
}

impl Processor for Gain {
    fn info(&self) -> &ProcessorInfo {
        &INFO
    }

    fn num_input_channels(&self) -> usize {
        self.num_channels
    }

    fn num_output_channels(&self) -> usize {
        self.num_channels
    }

    fn parameters(&self) -> &[ParameterDefinition] {
        &self.parameters
    }

    fn get_parameter(&self, index: usize) -> f32 {
        if index == 0 {
            self.level
        } else {
            0.0
        }
    }

    fn set_parameter(&mut self, index: usize, value: f32) {
        if index == 0 {
            self.level = value.clamp(0.0, 1.0);
        }
    }

    fn prepare(&mut self, _sample_rate: f64, _max_block_size: usize) -> Result<(), ProcessorError> {
        self.current = self.target_gain();
        Ok(())
    }

    fn process_block(
        &mut self,
        audio: &mut AudioBuffer,
        _midi: &mut MidiBuffer,
        _context: &ProcessContext,
    ) -> Result<(), RenderFault> {
        let target = self.target_gain();
        let frames = audio.len();
        if frames == 0 {
            return Ok(());
        }
        let step = (target - self.current) / frames as f32;

        for ch in 0..audio.num_channels().min(self.num_channels) {
            let mut gain = self.current;
            for sample in audio.channel_mut(ch) {
                gain += step;
                *sample *= gain;
            }
        }
        self.current = target;
        Ok(())
    }

    fn reset(&mut self) {
        self.current = self.target_gain();
    }

    fn get_state(&self) -> Option<Vec<u8>> {
        serde_json::to_vec(&self.level).ok()
    }

    fn set_state(&mut self, data: &[u8]) -> Result<(), ProcessorError> {
        self.level = serde_json::from_slice(data)
            .map_err(|e| ProcessorError::InvalidState(e.to_string()))?;
        self.current = self.target_gain();
        Ok(())
    }
}
