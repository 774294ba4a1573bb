//! One-block MIDI delay.
//!
//! The only node a MIDI edge may close a cycle through. The renderer fills
//! this node's buffer from its sources after the whole pass has run, so what
//! it hands downstream in block N is what its sources produced in block N-1.
//! The process step itself passes the buffer through.

use crate::dsp::{
    context::ProcessContext,
    midi::MidiBuffer,
    processor::{Processor, ProcessorError, ProcessorInfo, RenderFault},
    signal::AudioBuffer,
};

const INFO: ProcessorInfo = ProcessorInfo::new(
    "util.midi_delay",
    "MIDI Block Delay",
    "Delays MIDI by one block to allow feedback routing",
);

#[derive(Default)]
pub struct MidiFeedbackDelay;

impl Processor for MidiFeedbackDelay {
    fn info(&self) -> &ProcessorInfo {
        &INFO
    }

    fn num_input_channels(&self) -> usize {
        0
    }

    fn num_output_channels(&self) -> usize {
        0
    }

    fn accepts_midi(&self) -> bool {
        true
    }

    fn produces_midi(&self) -> bool {
        true
    }

    fn prepare(&mut self, _sample_rate: f64, _max_block_size: usize) -> Result<(), ProcessorError> {
        Ok(())
    }

    fn process_block(
        &mut self,
        _audio: &mut AudioBuffer,
        _midi: &mut MidiBuffer,
        _context: &ProcessContext,
    ) -> Result<(), RenderFault> {
        Ok(())
    }

    fn is_feedback_delay(&self) -> bool {
        true
    }
}
