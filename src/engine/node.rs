//! Graph nodes as the renderer sees them.
//!
//! A node pairs its processor with the scratch buffers it renders into.
//! Both sit behind one mutex shared between the control thread and the
//! render sequence; the audio thread only ever `try_lock`s it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::dsp::{
    context::ProcessContext,
    midi::MidiBuffer,
    processor::{Processor, ProcessorError, RenderFault},
    signal::AudioBuffer,
};
use crate::modules::{
    audio_loop::AudioLoopProcessor, loop_state::LoopShared, midi_loop::MidiLoopProcessor,
};

/// A node's processor.
///
/// Loop recorders get their own variants so the graph can reach their
/// shared handles without downcasting.
pub enum NodeProcessor {
    Plugin(Box<dyn Processor>),
    MidiLoop(Box<MidiLoopProcessor>),
    AudioLoop(Box<AudioLoopProcessor>),
}

impl NodeProcessor {
    pub fn as_processor(&self) -> &dyn Processor {
        match self {
            NodeProcessor::Plugin(p) => p.as_ref(),
            NodeProcessor::MidiLoop(p) => p.as_ref(),
            NodeProcessor::AudioLoop(p) => p.as_ref(),
        }
    }

    pub fn as_processor_mut(&mut self) -> &mut dyn Processor {
        match self {
            NodeProcessor::Plugin(p) => p.as_mut(),
            NodeProcessor::MidiLoop(p) => p.as_mut(),
            NodeProcessor::AudioLoop(p) => p.as_mut(),
        }
    }

    /// The loop's shared handle, for loop variants.
    pub fn loop_handle(&self) -> Option<Arc<LoopShared>> {
        match self {
            NodeProcessor::Plugin(_) => None,
            NodeProcessor::MidiLoop(p) => Some(p.shared()),
            NodeProcessor::AudioLoop(p) => Some(p.shared()),
        }
    }
}

impl From<Box<dyn Processor>> for NodeProcessor {
    fn from(processor: Box<dyn Processor>) -> Self {
        NodeProcessor::Plugin(processor)
    }
}

impl From<MidiLoopProcessor> for NodeProcessor {
    fn from(processor: MidiLoopProcessor) -> Self {
        NodeProcessor::MidiLoop(Box::new(processor))
    }
}

impl From<AudioLoopProcessor> for NodeProcessor {
    fn from(processor: AudioLoopProcessor) -> Self {
        NodeProcessor::AudioLoop(Box::new(processor))
    }
}

/// A processor and its scratch buffers.
pub struct NodeCell {
    pub processor: NodeProcessor,
    /// `max(inputs, outputs)` channels of `block_size` frames.
    pub audio: AudioBuffer,
    pub midi: MidiBuffer,
}

/// A node cell shared between the graph and its render sequences.
pub type SharedNode = Arc<Mutex<NodeCell>>;

impl NodeCell {
    pub fn new(processor: NodeProcessor, block_size: usize, midi_capacity: usize) -> Self {
        let channels = Self::channel_count(&processor);
        Self {
            processor,
            audio: AudioBuffer::new(channels, block_size),
            midi: MidiBuffer::with_capacity(midi_capacity),
        }
    }

    fn channel_count(processor: &NodeProcessor) -> usize {
        let p = processor.as_processor();
        p.num_input_channels().max(p.num_output_channels())
    }

    /// Prepares the processor and resizes the scratch buffers to match.
    pub fn prepare(
        &mut self,
        sample_rate: f64,
        block_size: usize,
        midi_capacity: usize,
    ) -> Result<(), ProcessorError> {
        self.processor
            .as_processor_mut()
            .prepare(sample_rate, block_size)?;
        let channels = Self::channel_count(&self.processor);
        if self.audio.num_channels() != channels || self.audio.capacity() != block_size {
            self.audio = AudioBuffer::new(channels, block_size);
        }
        if self.midi.capacity() != midi_capacity {
            self.midi = MidiBuffer::with_capacity(midi_capacity);
        }
        Ok(())
    }

    /// Runs the process step over the first `frames` frames of the scratch buffers.
    pub fn process(&mut self, context: &ProcessContext) -> Result<(), RenderFault> {
        self.processor
            .as_processor_mut()
            .process_block(&mut self.audio, &mut self.midi, context)
    }

    /// Silences the scratch buffers.
    pub fn silence(&mut self) {
        self.audio.clear();
        self.midi.clear();
    }
}

impl Drop for NodeCell {
    fn drop(&mut self) {
        self.processor.as_processor_mut().release_resources();
    }
}
