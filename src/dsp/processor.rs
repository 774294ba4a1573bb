//! The core Processor trait and supporting types.
//!
//! Every node in the processing graph owns one processor. Built-in nodes
//! (gain, graph I/O, loop recorders) and hosted plugins all implement this
//! trait, which is the only seam the graph renders through.

use thiserror::Error;

use super::context::ProcessContext;
use super::midi::MidiBuffer;
use super::parameter::ParameterDefinition;
use super::signal::AudioBuffer;

/// Static information about a processor type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessorInfo {
    /// Unique identifier for the processor type (e.g., "loop.midi").
    ///
    /// Project documents store this id and the [`ProcessorRegistry`]
    /// resolves it back to a factory.
    ///
    /// [`ProcessorRegistry`]: super::registry::ProcessorRegistry
    pub type_id: &'static str,
    /// Human-readable name.
    pub name: &'static str,
    /// A brief description of what the processor does.
    pub description: &'static str,
}

impl ProcessorInfo {
    /// Creates a new processor info.
    pub const fn new(type_id: &'static str, name: &'static str, description: &'static str) -> Self {
        Self {
            type_id,
            name,
            description,
        }
    }
}

/// Role of a graph I/O node.
///
/// I/O nodes bridge the buffers handed to the graph by the host with the
/// buffers inside the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IoRole {
    /// Outputs the host's audio input.
    AudioIn,
    /// Collects audio for the host's audio output.
    AudioOut,
    /// Outputs the host's MIDI input.
    MidiIn,
    /// Collects MIDI for the host's MIDI output.
    MidiOut,
}

/// Errors raised by processors on the control thread.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessorError {
    /// The processor could not be prepared for the requested configuration.
    #[error("prepare failed at {sample_rate} Hz / {block_size} samples: {reason}")]
    PrepareFailed {
        sample_rate: f64,
        block_size: usize,
        reason: String,
    },

    /// Saved state could not be restored.
    #[error("invalid processor state: {0}")]
    InvalidState(String),
}

/// A processor failure during a render pass.
///
/// Raised on the audio thread and reported back to the control thread
/// through the event queue; never logged where it happens.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFault {
    /// The processor returned an error from its process step.
    #[error("processor reported a failure")]
    Failed,

    /// The processor panicked during its process step.
    #[error("processor panicked")]
    Panicked,
}

/// The interface every graph node implements.
///
/// `process_block` runs on the audio thread; every other method runs on the
/// control thread while the node is locked.
///
/// # Real-time Constraints
///
/// `process_block` must not:
/// - Allocate memory
/// - Acquire locks
/// - Perform I/O operations
/// - Call any functions that might block
///
/// Buffers and event storage are sized in [`prepare`](Processor::prepare).
pub trait Processor: Send + 'static {
    /// Returns static information about this processor.
    fn info(&self) -> &ProcessorInfo;

    /// Number of audio input channels.
    fn num_input_channels(&self) -> usize;

    /// Number of audio output channels.
    fn num_output_channels(&self) -> usize;

    /// Whether the processor reads MIDI from its buffer.
    fn accepts_midi(&self) -> bool {
        false
    }

    /// Whether the processor writes MIDI into its buffer.
    fn produces_midi(&self) -> bool {
        false
    }

    /// Returns the parameter definitions, indexed by parameter number.
    fn parameters(&self) -> &[ParameterDefinition] {
        &[]
    }

    /// Number of parameters.
    fn num_parameters(&self) -> usize {
        self.parameters().len()
    }

    /// Returns a parameter value in the normalized domain [0, 1].
    ///
    /// Out-of-range indices return 0.
    fn get_parameter(&self, _index: usize) -> f32 {
        0.0
    }

    /// Sets a parameter value in the normalized domain [0, 1].
    ///
    /// Out-of-range indices are ignored. Called on the audio thread at
    /// block boundaries, so it must not allocate.
    fn set_parameter(&mut self, _index: usize, _value: f32) {}

    /// Prepares the processor for rendering.
    ///
    /// Called before the node enters the graph and whenever the sample rate
    /// or maximum block size changes. All storage used by `process_block`
    /// is allocated here.
    fn prepare(&mut self, sample_rate: f64, max_block_size: usize) -> Result<(), ProcessorError>;

    /// Frees whatever `prepare` allocated.
    fn release_resources(&mut self) {}

    /// Renders one block in place.
    ///
    /// On entry `audio` holds the gathered input in its first
    /// `num_input_channels` channels and `midi` holds the merged input
    /// events. On return they hold the output. The buffer has
    /// `max(num_input_channels, num_output_channels)` channels.
    fn process_block(
        &mut self,
        audio: &mut AudioBuffer,
        midi: &mut MidiBuffer,
        context: &ProcessContext,
    ) -> Result<(), RenderFault>;

    /// Clears internal running state (delay lines, note tracking).
    fn reset(&mut self) {}

    /// Serializes the processor's state for project documents.
    ///
    /// Returns `None` if there is nothing beyond the defaults.
    fn get_state(&self) -> Option<Vec<u8>> {
        None
    }

    /// Restores state produced by [`get_state`](Processor::get_state).
    fn set_state(&mut self, _data: &[u8]) -> Result<(), ProcessorError> {
        Ok(())
    }

    /// Whether the processor provides its own editor surface.
    fn has_editor(&self) -> bool {
        false
    }

    /// The graph I/O role, if this is an I/O node.
    fn io_role(&self) -> Option<IoRole> {
        None
    }

    /// Whether this node delays MIDI by one block.
    ///
    /// MIDI edges into such a node may close a cycle.
    fn is_feedback_delay(&self) -> bool {
        false
    }
}

/// Stores every parameter of `processor` as normalized values.
pub fn capture_parameters(processor: &dyn Processor) -> Vec<f32> {
    (0..processor.num_parameters())
        .map(|index| processor.get_parameter(index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal processor that halves its input.
    struct HalfGain {
        channels: usize,
    }

    impl Processor for HalfGain {
        fn info(&self) -> &ProcessorInfo {
            static INFO: ProcessorInfo = ProcessorInfo::new("test.half", "Half", "Halves input");
            &INFO
        }

        fn num_input_channels(&self) -> usize {
            self.channels
        }

        fn num_output_channels(&self) -> usize {
            self.channels
        }

        fn prepare(&mut self, _sample_rate: f64, _max_block_size: usize) -> Result<(), ProcessorError> {
            Ok(())
        }

        fn process_block(
            &mut self,
            audio: &mut AudioBuffer,
            _midi: &mut MidiBuffer,
            _context: &ProcessContext,
        ) -> Result<(), RenderFault> {
            for ch in 0..audio.num_channels() {
                for sample in audio.channel_mut(ch) {
                    *sample *= 0.5;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_default_capabilities() {
        let processor = HalfGain { channels: 2 };
        assert!(!processor.accepts_midi());
        assert!(!processor.produces_midi());
        assert!(!processor.has_editor());
        assert!(!processor.is_feedback_delay());
        assert_eq!(processor.io_role(), None);
        assert_eq!(processor.num_parameters(), 0);
        assert_eq!(processor.get_state(), None);
    }

    #[test]
    fn test_process_block_in_place() {
        let mut processor = HalfGain { channels: 1 };
        let mut audio = AudioBuffer::from_channels(vec![vec![1.0, -1.0]]);
        let mut midi = MidiBuffer::with_capacity(4);
        processor
            .process_block(&mut audio, &mut midi, &ProcessContext::default())
            .unwrap();
        assert_eq!(audio.channel(0), &[0.5, -0.5]);
    }

    #[test]
    fn test_error_display() {
        let err = ProcessorError::PrepareFailed {
            sample_rate: 48000.0,
            block_size: 64,
            reason: "no memory".into(),
        };
        assert!(err.to_string().contains("48000"));
        assert_eq!(RenderFault::Panicked.to_string(), "processor panicked");
    }

    #[test]
    fn test_processor_is_object_safe() {
        let boxed: Box<dyn Processor> = Box::new(HalfGain { channels: 2 });
        assert_eq!(boxed.info().type_id, "test.half");
        assert!(capture_parameters(boxed.as_ref()).is_empty());
    }
}
