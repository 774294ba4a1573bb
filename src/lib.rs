//! loopgraph
//!
//! A real-time audio/MIDI processing graph with loop recorders, a sync
//! playhead following a master loop or external MIDI clock, MIDI fan-out
//! and a control-action layer.

pub mod config;
pub mod control;
pub mod dsp;
pub mod engine;
pub mod modules;
pub mod persistence;
pub mod session;
pub mod sync;

pub use config::EngineConfig;
pub use session::Session;
