//! Tempo and loop synchronization.

pub mod loop_manager;
pub mod playhead;

pub use loop_manager::LoopManager;
pub use playhead::{SyncOptions, SyncPlayHead};
