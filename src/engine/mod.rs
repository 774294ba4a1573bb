//! Engine module
//!
//! The processing graph and its renderer, the queues between the control
//! and audio threads, MIDI fan-out, and the cpal/midir host integration.

pub mod audio_engine;
pub mod audio_processor;
pub mod channels;
pub mod commands;
pub mod dispatcher;
pub mod graph;
pub mod midi_engine;
pub mod node;
pub mod render;

pub use audio_engine::{AudioEngine, AudioError, DeviceInfo};
pub use audio_processor::AudioProcessor;
pub use channels::{
    ControlHandle, EngineChannels, EngineHandle, DEFAULT_COMMAND_BUFFER_SIZE, DEFAULT_EVENT_BUFFER_SIZE,
};
pub use commands::{ChannelIndex, EngineCommand, EngineEvent, NodeId};
pub use dispatcher::{MidiDispatcher, MidiInputQueue, MidiListener, MidiSource};
pub use graph::{Connection, GraphConfig, GraphError, MidiConnection, ProcessingGraph};
pub use midi_engine::{MidiDeviceInfo, MidiEngine, MidiError};
pub use node::NodeProcessor;
pub use render::GraphRenderer;
