//! Modules module
//!
//! Built-in processors: loop recorders, graph I/O nodes, gain and the
//! MIDI feedback delay.

pub mod audio_loop;
pub mod feedback_delay;
pub mod gain;
pub mod io;
pub mod loop_state;
pub mod midi_loop;

// Re-export commonly used types
pub use audio_loop::AudioLoopProcessor;
pub use feedback_delay::MidiFeedbackDelay;
pub use gain::Gain;
pub use io::GraphIoProcessor;
pub use loop_state::{LoopShared, LoopState, LoopTrigger, MasterLoop};
pub use midi_loop::MidiLoopProcessor;
