//! MIDI messages and per-block MIDI buffers.
//!
//! [`MidiMessage`] is the parsed form of a short MIDI message. Hardware
//! input arrives as a [`TimestampedMidiMessage`]; inside the graph each
//! message is placed at a sample offset within the block as a [`MidiEvent`]
//! and collected in a [`MidiBuffer`].

use serde::{Deserialize, Serialize};

/// A parsed MIDI message.
///
/// Channel voice messages carry their channel (0-15). System real-time and
/// song-position messages have no channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MidiMessage {
    /// Note On event.
    NoteOn {
        /// MIDI channel (0-15).
        channel: u8,
        /// Note number (0-127).
        note: u8,
        /// Velocity (1-127).
        velocity: u8,
    },
    /// Note Off event.
    NoteOff {
        /// MIDI channel (0-15).
        channel: u8,
        /// Note number (0-127).
        note: u8,
        /// Release velocity (0-127, often ignored).
        velocity: u8,
    },
    /// Control Change (CC) event.
    ControlChange {
        /// MIDI channel (0-15).
        channel: u8,
        /// Controller number (0-127).
        controller: u8,
        /// Controller value (0-127).
        value: u8,
    },
    /// Pitch Bend event.
    PitchBend {
        /// MIDI channel (0-15).
        channel: u8,
        /// Pitch bend value (-8192 to 8191, center = 0).
        value: i16,
    },
    /// Channel Aftertouch (pressure).
    ChannelPressure {
        /// MIDI channel (0-15).
        channel: u8,
        /// Pressure value (0-127).
        pressure: u8,
    },
    /// Polyphonic Aftertouch (per-note pressure).
    PolyPressure {
        /// MIDI channel (0-15).
        channel: u8,
        /// Note number (0-127).
        note: u8,
        /// Pressure value (0-127).
        pressure: u8,
    },
    /// Program Change.
    ProgramChange {
        /// MIDI channel (0-15).
        channel: u8,
        /// Program number (0-127).
        program: u8,
    },
    /// Timing clock, 24 per quarter note.
    Clock,
    /// Start the sequence from the beginning.
    Start,
    /// Continue from the current position.
    Continue,
    /// Stop the sequence.
    Stop,
    /// Song Position Pointer, in sixteenth notes since the start.
    SongPosition {
        /// Position in MIDI beats (sixteenth notes).
        beats: u16,
    },
}

impl MidiMessage {
    /// Parse a MIDI message from raw bytes.
    ///
    /// Returns None for unsupported or malformed messages.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let status = *data.first()?;

        match status {
            0xF8 => return Some(MidiMessage::Clock),
            0xFA => return Some(MidiMessage::Start),
            0xFB => return Some(MidiMessage::Continue),
            0xFC => return Some(MidiMessage::Stop),
            0xF2 => {
                let lsb = *data.get(1)? as u16 & 0x7F;
                let msb = *data.get(2)? as u16 & 0x7F;
                return Some(MidiMessage::SongPosition {
                    beats: (msb << 7) | lsb,
                });
            }
            _ => {}
        }

        let channel = status & 0x0F;
        let data1 = data.get(1).map(|b| b & 0x7F);
        let data2 = data.get(2).map(|b| b & 0x7F);

        match status & 0xF0 {
            0x90 => {
                let (note, velocity) = (data1?, data2?);
                if velocity == 0 {
                    Some(MidiMessage::NoteOff {
                        channel,
                        note,
                        velocity: 0,
                    })
                } else {
                    Some(MidiMessage::NoteOn {
                        channel,
                        note,
                        velocity,
                    })
                }
            }
            0x80 => Some(MidiMessage::NoteOff {
                channel,
                note: data1?,
                velocity: data2?,
            }),
            0xB0 => Some(MidiMessage::ControlChange {
                channel,
                controller: data1?,
                value: data2?,
            }),
            0xE0 => {
                let (lsb, msb) = (data1? as i16, data2? as i16);
                // 14-bit, centered at 8192
                Some(MidiMessage::PitchBend {
                    channel,
                    value: ((msb << 7) | lsb) - 8192,
                })
            }
            0xD0 => Some(MidiMessage::ChannelPressure {
                channel,
                pressure: data1?,
            }),
            0xA0 => Some(MidiMessage::PolyPressure {
                channel,
                note: data1?,
                pressure: data2?,
            }),
            0xC0 => Some(MidiMessage::ProgramChange {
                channel,
                program: data1?,
            }),
            _ => None,
        }
    }

    /// Encode this message as raw MIDI bytes.
    ///
    /// Returns the byte array and the number of valid bytes in it.
    pub fn to_bytes(&self) -> ([u8; 3], usize) {
        match *self {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => ([0x90 | channel, note, velocity], 3),
            MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            } => ([0x80 | channel, note, velocity], 3),
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => ([0xB0 | channel, controller, value], 3),
            MidiMessage::PitchBend { channel, value } => {
                let raw = (value + 8192) as u16;
                ([0xE0 | channel, (raw & 0x7F) as u8, (raw >> 7) as u8], 3)
            }
            MidiMessage::ChannelPressure { channel, pressure } => {
                ([0xD0 | channel, pressure, 0], 2)
            }
            MidiMessage::PolyPressure {
                channel,
                note,
                pressure,
            } => ([0xA0 | channel, note, pressure], 3),
            MidiMessage::ProgramChange { channel, program } => ([0xC0 | channel, program, 0], 2),
            MidiMessage::Clock => ([0xF8, 0, 0], 1),
            MidiMessage::Start => ([0xFA, 0, 0], 1),
            MidiMessage::Continue => ([0xFB, 0, 0], 1),
            MidiMessage::Stop => ([0xFC, 0, 0], 1),
            MidiMessage::SongPosition { beats } => {
                ([0xF2, (beats & 0x7F) as u8, ((beats >> 7) & 0x7F) as u8], 3)
            }
        }
    }

    /// Get the MIDI channel for this message, if it has one.
    pub fn channel(&self) -> Option<u8> {
        match self {
            MidiMessage::NoteOn { channel, .. }
            | MidiMessage::NoteOff { channel, .. }
            | MidiMessage::ControlChange { channel, .. }
            | MidiMessage::PitchBend { channel, .. }
            | MidiMessage::ChannelPressure { channel, .. }
            | MidiMessage::PolyPressure { channel, .. }
            | MidiMessage::ProgramChange { channel, .. } => Some(*channel),
            _ => None,
        }
    }

    /// Returns the note number for note on/off and poly pressure messages.
    pub fn note(&self) -> Option<u8> {
        match self {
            MidiMessage::NoteOn { note, .. }
            | MidiMessage::NoteOff { note, .. }
            | MidiMessage::PolyPressure { note, .. } => Some(*note),
            _ => None,
        }
    }

    /// Returns true for a Note On with non-zero velocity.
    pub fn is_note_on(&self) -> bool {
        matches!(self, MidiMessage::NoteOn { .. })
    }

    /// Returns true for system real-time and song position messages.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            MidiMessage::Clock
                | MidiMessage::Start
                | MidiMessage::Continue
                | MidiMessage::Stop
                | MidiMessage::SongPosition { .. }
        )
    }
}

/// MIDI message with the host timestamp it arrived at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimestampedMidiMessage {
    /// The MIDI message.
    pub message: MidiMessage,
    /// Timestamp in microseconds since the input connection opened.
    pub timestamp_us: u64,
}

impl TimestampedMidiMessage {
    /// Creates a timestamped message.
    pub fn new(message: MidiMessage, timestamp_us: u64) -> Self {
        Self {
            message,
            timestamp_us,
        }
    }
}

/// A MIDI message positioned inside a processing block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiEvent {
    /// Offset in samples from the start of the block.
    pub sample_offset: usize,
    /// The MIDI message.
    pub message: MidiMessage,
}

impl MidiEvent {
    /// Creates an event at the given offset.
    pub fn new(sample_offset: usize, message: MidiMessage) -> Self {
        Self {
            sample_offset,
            message,
        }
    }
}

/// Default number of events a block buffer holds before dropping.
pub const DEFAULT_MIDI_BUFFER_CAPACITY: usize = 512;

/// A fixed-capacity, time-ordered list of MIDI events for one block.
///
/// Storage is reserved at construction. Insertions past the capacity are
/// dropped and counted rather than reallocating, so the buffer can be
/// filled on the audio thread.
#[derive(Clone, Debug)]
pub struct MidiBuffer {
    events: Vec<MidiEvent>,
    capacity: usize,
    dropped: usize,
}

impl MidiBuffer {
    /// Creates an empty buffer that holds at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Inserts an event keeping the buffer ordered by sample offset.
    ///
    /// An event lands after any existing events at the same offset.
    /// Returns false if the buffer is full and the event was dropped.
    pub fn push(&mut self, event: MidiEvent) -> bool {
        if self.events.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        let index = self
            .events
            .partition_point(|e| e.sample_offset <= event.sample_offset);
        self.events.insert(index, event);
        true
    }

    /// Merges every event of `other` into this buffer.
    ///
    /// Events from `other` land after existing events at the same offset,
    /// so merging sources one after another keeps their relative order.
    pub fn merge_from(&mut self, other: &MidiBuffer) {
        for event in &other.events {
            self.push(*event);
        }
    }

    /// Merges the events of `other` that fall in `[start, start + len)`,
    /// moving them so `start` becomes offset 0.
    pub fn merge_range_from(&mut self, other: &MidiBuffer, start: usize, len: usize) {
        for event in &other.events {
            if event.sample_offset >= start && event.sample_offset < start + len {
                self.push(MidiEvent::new(event.sample_offset - start, event.message));
            }
        }
    }

    /// Merges every event of this buffer into `dest`, shifted forward by `shift`.
    pub fn merge_into_shifted(&self, dest: &mut MidiBuffer, shift: usize) {
        for event in &self.events {
            dest.push(MidiEvent::new(event.sample_offset + shift, event.message));
        }
    }

    /// Removes all events. The dropped counter is left alone.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Returns the events in time order.
    pub fn events(&self) -> &[MidiEvent] {
        &self.events
    }

    /// Iterates over the events in time order.
    pub fn iter(&self) -> std::slice::Iter<'_, MidiEvent> {
        self.events.iter()
    }

    /// Returns the number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if there are no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns the maximum number of events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns how many events were dropped since the last call, and resets the count.
    pub fn take_dropped(&mut self) -> usize {
        std::mem::take(&mut self.dropped)
    }
}

impl Default for MidiBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MIDI_BUFFER_CAPACITY)
    }
}

impl<'a> IntoIterator for &'a MidiBuffer {
    type Item = &'a MidiEvent;
    type IntoIter = std::slice::Iter<'a, MidiEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on(note: u8) -> MidiMessage {
        MidiMessage::NoteOn {
            channel: 0,
            note,
            velocity: 100,
        }
    }

    #[test]
    fn test_from_bytes_note_on() {
        let msg = MidiMessage::from_bytes(&[0x91, 60, 100]).unwrap();
        assert_eq!(
            msg,
            MidiMessage::NoteOn {
                channel: 1,
                note: 60,
                velocity: 100
            }
        );
        assert_eq!(msg.channel(), Some(1));
        assert_eq!(msg.note(), Some(60));
    }

    #[test]
    fn test_from_bytes_note_on_zero_velocity() {
        let msg = MidiMessage::from_bytes(&[0x90, 60, 0]);
        assert!(matches!(msg, Some(MidiMessage::NoteOff { .. })));
    }

    #[test]
    fn test_from_bytes_pitch_bend_center() {
        let msg = MidiMessage::from_bytes(&[0xE0, 0x00, 0x40]);
        assert_eq!(msg, Some(MidiMessage::PitchBend { channel: 0, value: 0 }));
    }

    #[test]
    fn test_from_bytes_realtime() {
        assert_eq!(MidiMessage::from_bytes(&[0xF8]), Some(MidiMessage::Clock));
        assert_eq!(MidiMessage::from_bytes(&[0xFA]), Some(MidiMessage::Start));
        assert_eq!(MidiMessage::from_bytes(&[0xFB]), Some(MidiMessage::Continue));
        assert_eq!(MidiMessage::from_bytes(&[0xFC]), Some(MidiMessage::Stop));
        assert!(MidiMessage::Clock.is_transport());
        assert_eq!(MidiMessage::Clock.channel(), None);
    }

    #[test]
    fn test_from_bytes_song_position() {
        // 0x10 | (0x01 << 7) = 144 sixteenths
        let msg = MidiMessage::from_bytes(&[0xF2, 0x10, 0x01]);
        assert_eq!(msg, Some(MidiMessage::SongPosition { beats: 144 }));
    }

    #[test]
    fn test_from_bytes_incomplete_and_empty() {
        assert!(MidiMessage::from_bytes(&[]).is_none());
        assert!(MidiMessage::from_bytes(&[0x90, 60]).is_none());
        assert!(MidiMessage::from_bytes(&[0xF2, 0x10]).is_none());
        assert!(MidiMessage::from_bytes(&[0xF0, 0x7E]).is_none());
    }

    #[test]
    fn test_to_bytes_matches_parse() {
        let messages = [
            note_on(64),
            MidiMessage::PitchBend {
                channel: 3,
                value: -100,
            },
            MidiMessage::ProgramChange {
                channel: 2,
                program: 7,
            },
            MidiMessage::SongPosition { beats: 300 },
        ];
        for msg in messages {
            let (bytes, len) = msg.to_bytes();
            assert_eq!(MidiMessage::from_bytes(&bytes[..len]), Some(msg));
        }
    }

    #[test]
    fn test_buffer_keeps_time_order() {
        let mut buffer = MidiBuffer::with_capacity(8);
        buffer.push(MidiEvent::new(10, note_on(1)));
        buffer.push(MidiEvent::new(2, note_on(2)));
        buffer.push(MidiEvent::new(5, note_on(3)));

        let offsets: Vec<usize> = buffer.iter().map(|e| e.sample_offset).collect();
        assert_eq!(offsets, vec![2, 5, 10]);
    }

    #[test]
    fn test_buffer_ties_keep_insertion_order() {
        let mut first = MidiBuffer::with_capacity(4);
        first.push(MidiEvent::new(3, note_on(10)));
        let mut second = MidiBuffer::with_capacity(4);
        second.push(MidiEvent::new(3, note_on(20)));

        let mut merged = MidiBuffer::with_capacity(8);
        merged.merge_from(&first);
        merged.merge_from(&second);

        let notes: Vec<u8> = merged.iter().filter_map(|e| e.message.note()).collect();
        assert_eq!(notes, vec![10, 20]);
    }

    #[test]
    fn test_buffer_drops_past_capacity() {
        let mut buffer = MidiBuffer::with_capacity(2);
        assert!(buffer.push(MidiEvent::new(0, note_on(1))));
        assert!(buffer.push(MidiEvent::new(1, note_on(2))));
        assert!(!buffer.push(MidiEvent::new(2, note_on(3))));

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.take_dropped(), 1);
        assert_eq!(buffer.take_dropped(), 0);
    }

    #[test]
    fn test_merge_range_shifts_offsets() {
        let mut host = MidiBuffer::with_capacity(4);
        host.push(MidiEvent::new(1, note_on(1)));
        host.push(MidiEvent::new(5, note_on(2)));
        host.push(MidiEvent::new(9, note_on(3)));

        let mut block = MidiBuffer::with_capacity(4);
        block.merge_range_from(&host, 4, 4);
        assert_eq!(block.len(), 1);
        assert_eq!(block.events()[0].sample_offset, 1);
    }
}
