//! Graph I/O nodes.
//!
//! These nodes have no behaviour of their own: the renderer fills an input
//! node's buffer from the host before it runs and collects an output node's
//! buffer after it runs. Their process step leaves the buffer untouched.

use crate::dsp::{
    context::ProcessContext,
    midi::MidiBuffer,
    processor::{IoRole, Processor, ProcessorError, ProcessorInfo, RenderFault},
    signal::AudioBuffer,
};

const AUDIO_IN: ProcessorInfo = ProcessorInfo::new("io.audio_in", "Audio Input", "Host audio input");
const AUDIO_OUT: ProcessorInfo =
    ProcessorInfo::new("io.audio_out", "Audio Output", "Host audio output");
const MIDI_IN: ProcessorInfo = ProcessorInfo::new("io.midi_in", "MIDI Input", "Host MIDI input");
const MIDI_OUT: ProcessorInfo = ProcessorInfo::new("io.midi_out", "MIDI Output", "Host MIDI output");

/// A node bridging the host's buffers into the graph.
pub struct GraphIoProcessor {
    role: IoRole,
    num_channels: usize,
}

impl GraphIoProcessor {
    pub fn new(role: IoRole, num_channels: usize) -> Self {
        let num_channels = match role {
            IoRole::AudioIn | IoRole::AudioOut => num_channels,
            IoRole::MidiIn | IoRole::MidiOut => 0,
        };
        Self { role, num_channels }
    }

    pub fn audio_input(num_channels: usize) -> Self {
        Self::new(IoRole::AudioIn, num_channels)
    }

    pub fn audio_output(num_channels: usize) -> Self {
        Self::new(IoRole::AudioOut, num_channels)
    }

    pub fn midi_input() -> Self {
        Self::new(IoRole::MidiIn, 0)
    }

    pub fn midi_output() -> Self {
        Self::new(IoRole::MidiOut, 0)
    }

    pub fn role(&self) -> IoRole {
        self.role
    }
}

impl Processor for GraphIoProcessor {
    fn info(&self) -> &ProcessorInfo {
        match self.role {
            IoRole::AudioIn => &AUDIO_IN,
            IoRole::AudioOut => &AUDIO_OUT,
            IoRole::MidiIn => &MIDI_IN,
            IoRole::MidiOut => &MIDI_OUT,
        }
    }

    fn num_input_channels(&self) -> usize {
        match self.role {
            IoRole::AudioOut => self.num_channels,
            _ => 0,
        }
    }

    fn num_output_channels(&self) -> usize {
        match self.role {
            IoRole::AudioIn => self.num_channels,
            _ => 0,
        }
    }

    fn accepts_midi(&self) -> bool {
        self.role == IoRole::MidiOut
    }

    fn produces_midi(&self) -> bool {
        self.role == IoRole::MidiIn
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

    fn io_role(&self) -> Option<IoRole> {
        Some(self.role)
    }
}
