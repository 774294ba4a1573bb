//! Engine Commands and Events
//!
//! Defines the messages that flow between the control thread and the audio
//! thread. All types here must be Send + 'static for safe cross-thread
//! communication.

use std::fmt;
use std::sync::Arc;

use crate::dsp::processor::RenderFault;

use super::render::{RenderBuffers, RenderSequence};

/// Unique identifier for a node in the processing graph.
///
/// Allocated monotonically from 1 and never reused within a graph.
pub type NodeId = u64;

/// Index of an audio channel on a node.
pub type ChannelIndex = usize;

/// Commands sent from the control thread to the renderer.
///
/// Applied at the start of the next block, in the order they were sent.
pub enum EngineCommand {
    /// Replace the render sequence. The previous one is returned through
    /// the garbage queue.
    SwapSequence(Arc<RenderSequence>),

    /// Replace the renderer's block buffers after a re-prepare.
    Reconfigure(Box<RenderBuffers>),

    /// Set a parameter value on a node.
    SetParameter {
        /// Target node.
        node_id: NodeId,
        /// Parameter index.
        param_index: usize,
        /// New value (normalized 0.0-1.0).
        value: f32,
    },

    /// Start or stop rendering. A stopped graph outputs silence.
    SetPlaying(bool),
}

impl fmt::Debug for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineCommand::SwapSequence(seq) => {
                write!(f, "SwapSequence({} steps)", seq.len())
            }
            EngineCommand::Reconfigure(buffers) => {
                write!(f, "Reconfigure({} frames)", buffers.block_size())
            }
            EngineCommand::SetParameter {
                node_id,
                param_index,
                value,
            } => write!(f, "SetParameter({node_id}, {param_index}, {value})"),
            EngineCommand::SetPlaying(playing) => write!(f, "SetPlaying({playing})"),
        }
    }
}

/// Resources handed back from the audio thread for deallocation.
pub enum Garbage {
    Sequence(Arc<RenderSequence>),
    Buffers(Box<RenderBuffers>),
}

/// Events sent from the renderer to the control thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineEvent {
    /// Peak output levels of the last block.
    OutputLevel {
        /// Left channel peak level (0.0-1.0+).
        left: f32,
        /// Right channel peak level (0.0-1.0+).
        right: f32,
    },

    /// Smoothed fraction of the callback budget spent rendering.
    CpuLoad(f32),

    /// Rendering started.
    Started,

    /// Rendering stopped.
    Stopped,

    /// A node failed during a render pass and was silenced for that block.
    RenderFault {
        /// The failing node.
        node_id: NodeId,
        /// What went wrong.
        fault: RenderFault,
    },

    /// MIDI events were dropped because a buffer was full.
    MidiDropped {
        /// Number of events lost.
        count: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_debug() {
        let cmd = EngineCommand::SetPlaying(true);
        assert_eq!(format!("{:?}", cmd), "SetPlaying(true)");

        let cmd = EngineCommand::SetParameter {
            node_id: 5,
            param_index: 2,
            value: 0.75,
        };
        assert!(format!("{:?}", cmd).contains("SetParameter(5, 2"));
    }

    #[test]
    fn test_fault_event() {
        let event = EngineEvent::RenderFault {
            node_id: 3,
            fault: RenderFault::Panicked,
        };
        let copied = event;
        assert_eq!(copied, event);
    }

    #[test]
    fn test_messages_are_send() {
        fn assert_send<T: Send + 'static>() {}
        assert_send::<EngineCommand>();
        assert_send::<EngineEvent>();
        assert_send::<Garbage>();
    }
}
