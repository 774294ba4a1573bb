//! Engine Channels
//!
//! Lock-free communication between the control thread and the audio thread.
//! Uses rtrb ring buffers for SPSC (single-producer, single-consumer) queues:
//!
//! - commands: control -> audio
//! - events: audio -> control
//! - garbage: audio -> control, for resources the audio thread must not free

use rtrb::{Consumer, Producer, RingBuffer};

use super::commands::{EngineCommand, EngineEvent, Garbage};

/// Default buffer size for command queue (control -> audio).
pub const DEFAULT_COMMAND_BUFFER_SIZE: usize = 1024;

/// Default buffer size for event queue (audio -> control).
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

/// Holds all three queues before they are split between threads.
pub struct EngineChannels {
    command_tx: Producer<EngineCommand>,
    command_rx: Consumer<EngineCommand>,
    event_tx: Producer<EngineEvent>,
    event_rx: Consumer<EngineEvent>,
    garbage_tx: Producer<Garbage>,
    garbage_rx: Consumer<Garbage>,
}

impl EngineChannels {
    /// Create new engine channels with the specified buffer sizes.
    ///
    /// The garbage queue gets twice the command capacity: every command can
    /// produce at most one piece of garbage, and the control thread collects
    /// before it sends.
    pub fn new(command_capacity: usize, event_capacity: usize) -> Self {
        let (command_tx, command_rx) = RingBuffer::new(command_capacity);
        let (event_tx, event_rx) = RingBuffer::new(event_capacity);
        let (garbage_tx, garbage_rx) = RingBuffer::new(command_capacity * 2);

        Self {
            command_tx,
            command_rx,
            event_tx,
            event_rx,
            garbage_tx,
            garbage_rx,
        }
    }

    /// Create new channels with default buffer sizes.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_COMMAND_BUFFER_SIZE, DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// Split the channels into control-side and engine-side handles.
    pub fn split(self) -> (ControlHandle, EngineHandle) {
        let control = ControlHandle {
            command_tx: self.command_tx,
            event_rx: self.event_rx,
            garbage_rx: self.garbage_rx,
        };
        let engine = EngineHandle {
            command_rx: self.command_rx,
            event_tx: self.event_tx,
            garbage_tx: self.garbage_tx,
        };
        (control, engine)
    }
}

/// Control-side handle for communicating with the audio thread.
pub struct ControlHandle {
    command_tx: Producer<EngineCommand>,
    event_rx: Consumer<EngineEvent>,
    garbage_rx: Consumer<Garbage>,
}

impl ControlHandle {
    /// Send a command to the audio thread.
    /// Returns Ok(()) if the command was queued, or Err(cmd) if the buffer is full.
    ///
    /// Garbage is collected first so the audio thread always has room to
    /// hand back what the command replaces.
    pub fn send_command(&mut self, cmd: EngineCommand) -> Result<(), EngineCommand> {
        self.collect_garbage();
        self.command_tx
            .push(cmd)
            .map_err(|rtrb::PushError::Full(cmd)| cmd)
    }

    /// Receive an event from the audio thread.
    pub fn recv_event(&mut self) -> Option<EngineEvent> {
        self.event_rx.pop().ok()
    }

    /// Drain all pending events from the audio thread.
    pub fn drain_events(&mut self) -> impl Iterator<Item = EngineEvent> + '_ {
        std::iter::from_fn(|| self.recv_event())
    }

    /// Frees everything the audio thread has handed back.
    ///
    /// Returns the number of items freed.
    pub fn collect_garbage(&mut self) -> usize {
        let mut count = 0;
        while let Ok(garbage) = self.garbage_rx.pop() {
            drop(garbage);
            count += 1;
        }
        count
    }

    /// Check how many commands can still be queued.
    pub fn command_slots_available(&self) -> usize {
        self.command_tx.slots()
    }

    /// Check if the command buffer is full.
    pub fn is_command_buffer_full(&self) -> bool {
        self.command_tx.is_full()
    }
}

/// Engine-side handle for communicating with the control thread.
///
/// IMPORTANT: All methods are real-time safe (non-blocking, no allocations).
pub struct EngineHandle {
    command_rx: Consumer<EngineCommand>,
    event_tx: Producer<EngineEvent>,
    garbage_tx: Producer<Garbage>,
}

impl EngineHandle {
    /// Receive a command from the control thread.
    pub fn recv_command(&mut self) -> Option<EngineCommand> {
        self.command_rx.pop().ok()
    }

    /// Send an event to the control thread.
    /// Returns Ok(()) if the event was queued, or Err(event) if the buffer is full.
    pub fn send_event(&mut self, event: EngineEvent) -> Result<(), EngineEvent> {
        self.event_tx
            .push(event)
            .map_err(|rtrb::PushError::Full(event)| event)
    }

    /// Try to send an event, dropping it silently if the buffer is full.
    /// Use this for metering data where dropping old values is acceptable.
    pub fn send_event_lossy(&mut self, event: EngineEvent) {
        let _ = self.event_tx.push(event);
    }

    /// Hands a resource back to the control thread for deallocation.
    ///
    /// Returns the resource if the queue is full.
    pub fn retire(&mut self, garbage: Garbage) -> Result<(), Garbage> {
        self.garbage_tx
            .push(garbage)
            .map_err(|rtrb::PushError::Full(garbage)| garbage)
    }

    /// Check how many commands are pending.
    pub fn commands_pending(&self) -> usize {
        self.command_rx.slots()
    }
}
