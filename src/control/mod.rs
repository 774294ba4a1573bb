//! Control-action layer.
//!
//! Binds MIDI controllers and node parameters to node parameters.

pub mod action;
pub mod surface;

pub use action::{ControlAction, ControlSource, ControlTarget, ParameterChange};
pub use surface::ControlSurface;
