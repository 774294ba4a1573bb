//! DSP module
//!
//! Core processing types: audio and MIDI buffers, the processing context,
//! parameters, key analysis, the `Processor` trait and its registry.

pub mod context;
pub mod key;
pub mod midi;
pub mod parameter;
pub mod processor;
pub mod registry;
pub mod signal;

pub use context::{PlayHead, PositionInfo, ProcessContext};
pub use midi::{MidiBuffer, MidiEvent, MidiMessage, TimestampedMidiMessage};
pub use processor::{Processor, ProcessorError, ProcessorInfo, RenderFault};
pub use registry::{BuiltinOptions, ProcessorRegistry};
pub use signal::AudioBuffer;
