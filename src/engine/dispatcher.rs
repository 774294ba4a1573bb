//! MIDI input fan-out.
//!
//! The MIDI thread hands every incoming message to a [`MidiDispatcher`],
//! which forwards it to each registered [`MidiListener`] in registration
//! order. The listener list is copy-on-write: dispatch iterates an immutable
//! snapshot, and edits publish a new list. A listener removed while a
//! dispatch is in flight is skipped through its removal marker rather than
//! by touching the list being iterated.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::dsp::midi::{MidiMessage, TimestampedMidiMessage};

/// Default capacity of the MIDI input queue to the audio thread.
pub const DEFAULT_MIDI_INPUT_QUEUE_SIZE: usize = 512;

/// The device a message arrived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MidiSource {
    /// Port index at connection time.
    pub id: usize,
    /// Human-readable port name.
    pub name: String,
}

impl MidiSource {
    pub fn new(id: usize, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Receiver of incoming MIDI.
///
/// Called on the MIDI thread; implementations must not block for long.
pub trait MidiListener: Send + Sync {
    fn handle_incoming_midi_message(&self, source: &MidiSource, message: &TimestampedMidiMessage);

    /// Receives a fragment of a system exclusive message as it streams in.
    fn handle_partial_sysex_message(
        &self,
        _source: &MidiSource,
        _data: &[u8],
        _bytes_so_far: usize,
        _timestamp_us: u64,
    ) {
    }
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    listener: Arc<dyn MidiListener>,
    removed: Arc<AtomicBool>,
}

/// Fans incoming MIDI out to every registered listener.
pub struct MidiDispatcher {
    listeners: ArcSwap<Vec<ListenerEntry>>,
    /// Serializes list edits against each other.
    edit: Mutex<()>,
    next_id: AtomicU64,
}

impl MidiDispatcher {
    pub fn new() -> Self {
        Self {
            listeners: ArcSwap::from_pointee(Vec::new()),
            edit: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a listener at the end of the dispatch order.
    pub fn add_listener(&self, listener: Arc<dyn MidiListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _guard = self.edit.lock();
        let mut list = Vec::clone(&self.listeners.load());
        list.push(ListenerEntry {
            id,
            listener,
            removed: Arc::new(AtomicBool::new(false)),
        });
        self.listeners.store(Arc::new(list));
        id
    }

    /// Unregisters a listener. Returns false if it was not registered.
    ///
    /// Safe to call from inside a listener callback: a dispatch already in
    /// progress skips the listener from this point on.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let _guard = self.edit.lock();
        let current = self.listeners.load_full();
        let Some(entry) = current.iter().find(|entry| entry.id == id) else {
            return false;
        };
        entry.removed.store(true, Ordering::Release);

        let list: Vec<ListenerEntry> = current
            .iter()
            .filter(|entry| !entry.removed.load(Ordering::Acquire))
            .cloned()
            .collect();
        self.listeners.store(Arc::new(list));
        true
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.load().len()
    }

    /// Delivers a message to every listener, in registration order.
    pub fn dispatch(&self, source: &MidiSource, message: &TimestampedMidiMessage) {
        let snapshot = self.listeners.load_full();
        for entry in snapshot.iter() {
            if !entry.removed.load(Ordering::Acquire) {
                entry.listener.handle_incoming_midi_message(source, message);
            }
        }
    }

    /// Delivers a sysex fragment to every listener, in registration order.
    pub fn dispatch_partial_sysex(
        &self,
        source: &MidiSource,
        data: &[u8],
        bytes_so_far: usize,
        timestamp_us: u64,
    ) {
        let snapshot = self.listeners.load_full();
        for entry in snapshot.iter() {
            if !entry.removed.load(Ordering::Acquire) {
                entry
                    .listener
                    .handle_partial_sysex_message(source, data, bytes_so_far, timestamp_us);
            }
        }
    }
}

impl Default for MidiDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener forwarding incoming MIDI to the audio thread.
///
/// Timing clock messages are not forwarded; they drive the sync playhead
/// instead of the graph. Messages that do not fit in the queue are counted.
pub struct MidiInputQueue {
    producer: Mutex<Producer<TimestampedMidiMessage>>,
    dropped: AtomicU64,
}

impl MidiInputQueue {
    /// Creates the queue and the consumer the audio thread drains.
    pub fn new(capacity: usize) -> (Arc<Self>, Consumer<TimestampedMidiMessage>) {
        let (producer, consumer) = RingBuffer::new(capacity);
        let queue = Arc::new(Self {
            producer: Mutex::new(producer),
            dropped: AtomicU64::new(0),
        });
        (queue, consumer)
    }

    /// Number of messages dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MidiListener for MidiInputQueue {
    fn handle_incoming_midi_message(&self, _source: &MidiSource, message: &TimestampedMidiMessage) {
        if message.message == MidiMessage::Clock {
            return;
        }
        if self.producer.lock().push(*message).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
