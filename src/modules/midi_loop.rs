//! MIDI loop recorder.
//!
//! Captures incoming MIDI into a sample-timed sequence and plays it back in
//! a loop, optionally overdubbing. Playback reads the *altered* sequence:
//! the recorded one with notes outside the enabled pitch classes removed.
//! Each time the content is finalized the key of the sequence is estimated.
//!
//! # Parameters
//!
//! - **C .. B** (0-11): pitch classes kept in the altered sequence.
//! - **Quantize** (12): cue record triggers to the next bar while the
//!   transport is rolling.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dsp::{
    context::ProcessContext,
    key::{estimate_key, pitch_class_histogram},
    midi::{MidiBuffer, MidiEvent, MidiMessage, DEFAULT_MIDI_BUFFER_CAPACITY},
    parameter::{is_on, ParameterDefinition},
    processor::{Processor, ProcessorError, ProcessorInfo, RenderFault},
    signal::AudioBuffer,
};

use super::loop_state::{LoopAction, LoopCore, LoopShared, LoopState, MasterLoop};

/// Default number of events a MIDI loop can hold.
pub const DEFAULT_LOOP_EVENT_CAPACITY: usize = 4096;

/// Parameter index of the start-quantize toggle.
pub const QUANTIZE_PARAM: usize = 12;

const INFO: ProcessorInfo = ProcessorInfo::new(
    "loop.midi",
    "MIDI Loop",
    "Records and loops MIDI with pitch-class filtering and key detection",
);

/// One recorded message at a position inside the loop.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoopEvent {
    /// Position in samples from the loop start.
    pub position: u64,
    pub message: MidiMessage,
}

/// Saved form of a MIDI loop.
#[derive(Serialize, Deserialize)]
struct MidiLoopSnapshot {
    /// Loop length, or the captured span while `recording` is set.
    length: u64,
    playing: bool,
    #[serde(default)]
    recording: bool,
    mask: [bool; 12],
    quantize: bool,
    events: Vec<LoopEvent>,
}

/// A MIDI loop recorder node.
pub struct MidiLoopProcessor {
    core: LoopCore,
    parameters: Vec<ParameterDefinition>,
    /// Recorded sequence, sorted by position.
    events: Vec<LoopEvent>,
    /// `events` filtered by `mask`.
    altered: Vec<LoopEvent>,
    /// Copy of the block's input, so output can be built in place.
    input: MidiBuffer,
    /// Event capacity of the block buffers this loop is fed from.
    midi_capacity: usize,
    mask: [bool; 12],
    capacity: usize,
    dropped: u64,
}

const PITCH_PARAMS: [(&str, &str); 12] = [
    ("pc_c", "C"),
    ("pc_cs", "C#"),
    ("pc_d", "D"),
    ("pc_ds", "D#"),
    ("pc_e", "E"),
    ("pc_f", "F"),
    ("pc_fs", "F#"),
    ("pc_g", "G"),
    ("pc_gs", "G#"),
    ("pc_a", "A"),
    ("pc_as", "A#"),
    ("pc_b", "B"),
];

impl MidiLoopProcessor {
    /// Creates a MIDI loop that holds at most `capacity` events and follows
    /// the given master loop for auto-closing cued recordings.
    pub fn new(capacity: usize, master: Arc<MasterLoop>) -> Self {
        let mut parameters: Vec<ParameterDefinition> = PITCH_PARAMS
            .iter()
            .map(|&(id, name)| ParameterDefinition::toggle(id, name, true))
            .collect();
        parameters.push(ParameterDefinition::toggle("quantize", "Quantize", false));

        Self {
            core: LoopCore::new(master),
            parameters,
            events: Vec::new(),
            altered: Vec::new(),
            input: MidiBuffer::with_capacity(0),
            midi_capacity: DEFAULT_MIDI_BUFFER_CAPACITY,
            mask: [true; 12],
            capacity,
            dropped: 0,
        }
    }

    /// Sizes the input copy to block buffers of `midi_capacity` events.
    pub fn with_midi_capacity(mut self, midi_capacity: usize) -> Self {
        self.midi_capacity = midi_capacity;
        self
    }

    /// Handle for observing the loop and posting triggers from other threads.
    pub fn shared(&self) -> Arc<LoopShared> {
        Arc::clone(self.core.shared())
    }

    pub fn state(&self) -> LoopState {
        self.core.state()
    }

    /// The recorded sequence.
    pub fn events(&self) -> &[LoopEvent] {
        &self.events
    }

    /// The sequence as played back.
    pub fn altered_events(&self) -> &[LoopEvent] {
        &self.altered
    }

    /// Replaces the content with `events` over `length` samples.
    ///
    /// Events at or past `length` are discarded. The loop starts playing if
    /// `playing` is set and the length is non-zero.
    pub fn set_sequence(&mut self, events: &[LoopEvent], length: u64, playing: bool) {
        self.events.clear();
        self.events
            .extend(events.iter().copied().filter(|e| e.position < length));
        self.events.sort_by_key(|e| e.position);
        self.ensure_capacity(self.events.len());
        self.core.load(length, playing);
        self.finalize();
        self.core.end_block();
    }

    /// Restores an unfinished recording that has captured `elapsed` samples.
    fn resume_recording(&mut self, events: &[LoopEvent], elapsed: u64) {
        self.events.clear();
        self.events.extend_from_slice(events);
        self.events.sort_by_key(|e| e.position);
        self.ensure_capacity(self.events.len());
        self.altered.clear();
        self.core.load_recording(elapsed);
        self.core.end_block();
    }

    fn ensure_capacity(&mut self, needed: usize) {
        let capacity = self.capacity.max(needed);
        self.events.reserve(capacity.saturating_sub(self.events.len()));
        self.altered.reserve(capacity.saturating_sub(self.altered.len()));
        self.capacity = capacity;
    }

    fn passes_mask(&self, message: &MidiMessage) -> bool {
        message
            .note()
            .map_or(true, |note| self.mask[(note % 12) as usize])
    }

    fn regenerate_altered(&mut self) {
        let mask = self.mask;
        self.altered.clear();
        self.altered.extend(self.events.iter().copied().filter(|e| {
            e.message
                .note()
                .map_or(true, |note| mask[(note % 12) as usize])
        }));
    }

    /// Rebuilds the altered sequence and re-estimates the key.
    ///
    /// With no note onsets the previous key estimate is kept.
    fn finalize(&mut self) {
        self.regenerate_altered();
        let onsets = self.events.iter().filter_map(|e| match e.message {
            MidiMessage::NoteOn { note, .. } => Some(note),
            _ => None,
        });
        if let Some(estimate) = estimate_key(&pitch_class_histogram(onsets)) {
            self.core.shared().publish_key(estimate.best, estimate.second);
        }
    }

    fn apply(&mut self, action: LoopAction) {
        match action {
            LoopAction::BeginRecording | LoopAction::Clear => {
                self.events.clear();
                self.altered.clear();
            }
            LoopAction::FinishRecording | LoopAction::FinishOverdub => self.finalize(),
        }
    }

    fn insert_event(&mut self, event: LoopEvent) {
        if self.events.len() >= self.capacity {
            self.dropped += 1;
            return;
        }
        let index = self.events.partition_point(|e| e.position <= event.position);
        self.events.insert(index, event);

        if self.passes_mask(&event.message) {
            let index = self.altered.partition_point(|e| e.position <= event.position);
            self.altered.insert(index, event);
        }
    }

    /// Appends input events in `[0, frames)` at the recording cursor.
    fn record_block(&mut self, frames: usize) {
        let start = self.core.elapsed();
        for i in 0..self.input.len() {
            let event = self.input.events()[i];
            if event.sample_offset >= frames {
                continue;
            }
            if event.message.is_transport() {
                continue;
            }
            if self.events.len() >= self.capacity {
                self.dropped += 1;
                continue;
            }
            self.events.push(LoopEvent {
                position: start + event.sample_offset as u64,
                message: event.message,
            });
        }
    }

    /// Emits altered events in the window `[scrub, scrub + frames)`, wrapping
    /// at the loop length.
    fn emit_block(&self, output: &mut MidiBuffer, frames: usize) {
        let length = self.core.length();
        if length == 0 {
            return;
        }
        let mut cursor = self.core.scrub();
        let mut out = 0;
        let mut remaining = frames as u64;

        while remaining > 0 {
            let chunk = remaining.min(length - cursor);
            let end = cursor + chunk;
            let first = self.altered.partition_point(|e| e.position < cursor);
            for event in self.altered[first..].iter().take_while(|e| e.position < end) {
                output.push(MidiEvent::new(
                    out + (event.position - cursor) as usize,
                    event.message,
                ));
            }
            out += chunk as usize;
            remaining -= chunk;
            cursor = end % length;
        }
    }

    /// Merges input notes into the loop at the playback cursor.
    fn overdub_block(&mut self, frames: usize) {
        let length = self.core.length();
        let scrub = self.core.scrub();
        for i in 0..self.input.len() {
            let event = self.input.events()[i];
            if event.sample_offset >= frames || event.message.is_transport() {
                continue;
            }
            let position = (scrub + event.sample_offset as u64) % length;
            self.insert_event(LoopEvent {
                position,
                message: event.message,
            });
        }
    }
}

impl Default for MidiLoopProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_LOOP_EVENT_CAPACITY, Arc::new(MasterLoop::new()))
    }
}

impl Processor for MidiLoopProcessor {
    fn info(&self) -> &ProcessorInfo {
        &INFO
    }

    fn num_input_channels(&self) -> usize {
        0
    }

    fn num_output_channels(&self) -> usize {
        0
    }

    fn accepts_midi(&self) -> bool {
        true
    }

    fn produces_midi(&self) -> bool {
        true
    }

    fn parameters(&self) -> &[ParameterDefinition] {
        &self.parameters
    }

    fn get_parameter(&self, index: usize) -> f32 {
        match index {
            0..=11 => self.mask[index] as u8 as f32,
            QUANTIZE_PARAM => self.core.quantize() as u8 as f32,
            _ => 0.0,
        }
    }

    fn set_parameter(&mut self, index: usize, value: f32) {
        match index {
            0..=11 => {
                let on = is_on(value);
                if self.mask[index] != on {
                    self.mask[index] = on;
                    self.regenerate_altered();
                }
            }
            QUANTIZE_PARAM => self.core.set_quantize(is_on(value)),
            _ => {}
        }
    }

    fn prepare(&mut self, sample_rate: f64, max_block_size: usize) -> Result<(), ProcessorError> {
        if sample_rate <= 0.0 {
            return Err(ProcessorError::PrepareFailed {
                sample_rate,
                block_size: max_block_size,
                reason: "sample rate must be positive".into(),
            });
        }
        self.ensure_capacity(self.events.len());
        if self.input.capacity() != self.midi_capacity {
            self.input = MidiBuffer::with_capacity(self.midi_capacity);
        }
        self.core.set_sample_rate(sample_rate);
        Ok(())
    }

    fn release_resources(&mut self) {
        self.events.shrink_to_fit();
        self.altered.shrink_to_fit();
    }

    fn process_block(
        &mut self,
        _audio: &mut AudioBuffer,
        midi: &mut MidiBuffer,
        context: &ProcessContext,
    ) -> Result<(), RenderFault> {
        if let Some(action) = self.core.begin_block(&context.position) {
            self.apply(action);
        }

        // Input passes through in every state
        self.input.clear();
        self.input.merge_from(midi);

        let n = context.block_size;
        match self.core.state() {
            LoopState::Recording => self.record_block(self.core.capture_len(n)),
            LoopState::Playing => self.emit_block(midi, n),
            LoopState::Overdubbing => {
                self.emit_block(midi, n);
                self.overdub_block(n);
            }
            LoopState::Paused => {}
        }
        self.core.advance(n);

        let dropped = std::mem::take(&mut self.dropped)
            + self.input.take_dropped() as u64
            + midi.take_dropped() as u64;
        self.core.shared().add_dropped(dropped);
        self.core.end_block();
        Ok(())
    }

    fn reset(&mut self) {
        self.input.clear();
    }

    fn get_state(&self) -> Option<Vec<u8>> {
        let snapshot = MidiLoopSnapshot {
            length: self.core.content_len(),
            playing: self.core.state().is_emitting(),
            recording: self.core.state() == LoopState::Recording,
            mask: self.mask,
            quantize: self.core.quantize(),
            events: self.events.clone(),
        };
        serde_json::to_vec(&snapshot).ok()
    }

    fn set_state(&mut self, data: &[u8]) -> Result<(), ProcessorError> {
        let snapshot: MidiLoopSnapshot = serde_json::from_slice(data)
            .map_err(|e| ProcessorError::InvalidState(e.to_string()))?;
        self.mask = snapshot.mask;
        self.core.set_quantize(snapshot.quantize);
        if snapshot.recording {
            self.resume_recording(&snapshot.events, snapshot.length);
        } else {
            self.set_sequence(&snapshot.events, snapshot.length, snapshot.playing);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::context::PositionInfo;
    use crate::dsp::key::{Key, Mode};
    use crate::modules::loop_state::LoopTrigger;

    fn note_on(note: u8) -> MidiMessage {
        MidiMessage::NoteOn {
            channel: 0,
            note,
            velocity: 100,
        }
    }

    fn prepared() -> MidiLoopProcessor {
        let mut processor = MidiLoopProcessor::default();
        processor.prepare(48000.0, 100).unwrap();
        processor
    }

    fn run_block(processor: &mut MidiLoopProcessor, input: &[MidiEvent], n: usize) -> Vec<MidiEvent> {
        let mut audio = AudioBuffer::new(0, 0);
        let mut midi = MidiBuffer::with_capacity(64);
        for event in input {
            midi.push(*event);
        }
        let ctx = ProcessContext::new(48000.0, n);
        processor.process_block(&mut audio, &mut midi, &ctx).unwrap();
        midi.events().to_vec()
    }

    #[test]
    fn test_three_notes_three_cycles() {
        let mut processor = prepared();
        let sequence: Vec<LoopEvent> = [0, 100, 200]
            .iter()
            .map(|&position| LoopEvent {
                position,
                message: note_on(60),
            })
            .collect();
        processor.set_sequence(&sequence, 300, true);

        let mut emitted = 0;
        for _ in 0..9 {
            let out = run_block(&mut processor, &[], 100);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].sample_offset, 0);
            emitted += out.len();
        }
        assert_eq!(emitted, 9);
        let shared = processor.shared();
        assert_eq!(shared.scrub_position(), 0);
        assert_eq!(shared.cycles(), 3);
    }

    #[test]
    fn test_recorded_notes_replay_each_cycle() {
        let mut processor = prepared();
        processor.shared().request(LoopTrigger::Record);
        for _ in 0..3 {
            run_block(&mut processor, &[MidiEvent::new(0, note_on(60))], 100);
        }
        processor.shared().request(LoopTrigger::Stop);

        let mut emitted = Vec::new();
        for _ in 0..9 {
            emitted.extend(run_block(&mut processor, &[], 100));
        }
        let positions: Vec<u64> = processor.events().iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![0, 100, 200]);
        assert_eq!(emitted.len(), 9);
        assert!(emitted.iter().all(|e| e.sample_offset == 0));
        assert_eq!(processor.shared().length(), 300);
        assert_eq!(processor.shared().cycles(), 3);
    }

    #[test]
    fn test_window_wraps_inside_block() {
        let mut processor = prepared();
        let sequence = [
            LoopEvent {
                position: 10,
                message: note_on(60),
            },
            LoopEvent {
                position: 250,
                message: note_on(62),
            },
        ];
        processor.set_sequence(&sequence, 300, true);

        // Advance to scrub 200
        run_block(&mut processor, &[], 100);
        run_block(&mut processor, &[], 100);

        let out = run_block(&mut processor, &[], 150);
        let offsets: Vec<usize> = out.iter().map(|e| e.sample_offset).collect();
        // 250 -> offset 50, wrap at 100, 10 -> offset 110
        assert_eq!(offsets, vec![50, 110]);
        assert_eq!(processor.shared().scrub_position(), 50);
    }

    #[test]
    fn test_record_appends_relative_to_start() {
        let mut processor = prepared();
        processor.shared().request(LoopTrigger::Record);
        let out = run_block(&mut processor, &[MidiEvent::new(5, note_on(60))], 100);
        // Passthrough while recording
        assert_eq!(out.len(), 1);
        run_block(&mut processor, &[MidiEvent::new(20, note_on(64))], 100);
        run_block(&mut processor, &[MidiEvent::new(0, note_on(67))], 100);

        processor.shared().request(LoopTrigger::Stop);
        run_block(&mut processor, &[], 100);

        let positions: Vec<u64> = processor.events().iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![5, 120, 200]);
        let shared = processor.shared();
        assert_eq!(shared.length(), 300);
        assert_eq!(shared.state(), LoopState::Playing);
        assert_eq!(shared.key(), Key::new(0, Mode::Major));
        assert_eq!(shared.second_key(), Key::new(4, Mode::Minor));
    }

    #[test]
    fn test_overdub_merges_at_cursor() {
        let mut processor = prepared();
        processor.set_sequence(
            &[LoopEvent {
                position: 0,
                message: note_on(60),
            }],
            300,
            true,
        );
        run_block(&mut processor, &[], 100);

        processor.shared().request(LoopTrigger::Overdub);
        run_block(&mut processor, &[MidiEvent::new(30, note_on(67))], 100);
        processor.shared().request(LoopTrigger::Stop);
        run_block(&mut processor, &[], 100);

        let positions: Vec<u64> = processor.events().iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![0, 130]);
        assert_eq!(processor.altered_events().len(), 2);
        assert_eq!(processor.state(), LoopState::Playing);
    }

    #[test]
    fn test_mask_filters_altered_sequence() {
        let mut processor = prepared();
        let sequence = [
            LoopEvent {
                position: 0,
                message: note_on(60),
            },
            LoopEvent {
                position: 10,
                message: note_on(61),
            },
            LoopEvent {
                position: 20,
                message: MidiMessage::ControlChange {
                    channel: 0,
                    controller: 1,
                    value: 3,
                },
            },
        ];
        processor.set_sequence(&sequence, 100, true);

        processor.set_parameter(1, 0.0);
        assert_eq!(processor.get_parameter(1), 0.0);
        assert_eq!(processor.altered_events().len(), 2);
        assert_eq!(processor.events().len(), 3);

        let out = run_block(&mut processor, &[], 100);
        assert!(out.iter().all(|e| e.message.note() != Some(61)));
    }

    #[test]
    fn test_zero_onsets_keep_prior_key() {
        let mut processor = prepared();
        processor.set_sequence(
            &[
                LoopEvent {
                    position: 0,
                    message: note_on(67),
                },
                LoopEvent {
                    position: 1,
                    message: note_on(71),
                },
                LoopEvent {
                    position: 2,
                    message: note_on(74),
                },
            ],
            100,
            true,
        );
        assert_eq!(processor.shared().key(), Key::new(7, Mode::Major));

        let cc_only = [LoopEvent {
            position: 0,
            message: MidiMessage::ControlChange {
                channel: 0,
                controller: 7,
                value: 100,
            },
        }];
        processor.set_sequence(&cc_only, 100, true);
        assert_eq!(processor.shared().key(), Key::new(7, Mode::Major));
    }

    #[test]
    fn test_clear_empties_loop() {
        let mut processor = prepared();
        processor.set_sequence(
            &[LoopEvent {
                position: 0,
                message: note_on(60),
            }],
            100,
            true,
        );
        processor.shared().request(LoopTrigger::Clear);
        let out = run_block(&mut processor, &[], 100);
        assert!(out.is_empty());
        assert!(processor.events().is_empty());
        assert_eq!(processor.shared().length(), 0);
        assert_eq!(processor.shared().state(), LoopState::Paused);
    }

    #[test]
    fn test_capacity_drops_events() {
        let mut processor = MidiLoopProcessor::new(2, Arc::new(MasterLoop::new()));
        processor.prepare(48000.0, 100).unwrap();
        processor.shared().request(LoopTrigger::Record);
        let input: Vec<MidiEvent> = (0..4).map(|i| MidiEvent::new(i, note_on(60))).collect();
        run_block(&mut processor, &input, 100);
        assert_eq!(processor.events().len(), 2);
        assert_eq!(processor.shared().dropped_events(), 2);
    }

    #[test]
    fn test_quantized_record_waits_for_bar() {
        let mut processor = prepared();
        processor.set_parameter(QUANTIZE_PARAM, 1.0);

        let mut audio = AudioBuffer::new(0, 0);
        let mut midi = MidiBuffer::with_capacity(8);
        let mut pos = PositionInfo::playing_at(120.0);
        pos.ppq_position = 1.0;
        let ctx = ProcessContext::with_position(48000.0, 100, pos);
        processor.process_block(&mut audio, &mut midi, &ctx).unwrap();

        processor.shared().request(LoopTrigger::Record);
        processor.process_block(&mut audio, &mut midi, &ctx).unwrap();
        assert_eq!(processor.state(), LoopState::Paused);
        assert!(processor.shared().is_cued());

        pos.ppq_position = 4.0;
        pos.ppq_position_of_last_bar_start = 4.0;
        let ctx = ProcessContext::with_position(48000.0, 100, pos);
        processor.process_block(&mut audio, &mut midi, &ctx).unwrap();
        assert_eq!(processor.state(), LoopState::Recording);
    }

    #[test]
    fn test_state_round_trip() {
        let mut processor = prepared();
        processor.set_sequence(
            &[LoopEvent {
                position: 42,
                message: note_on(64),
            }],
            480,
            true,
        );
        processor.set_parameter(4, 0.0);
        let state = processor.get_state().unwrap();

        let mut restored = prepared();
        restored.set_state(&state).unwrap();
        assert_eq!(restored.events(), processor.events());
        assert_eq!(restored.shared().length(), 480);
        assert_eq!(restored.get_parameter(4), 0.0);
        assert!(restored.altered_events().is_empty());
        assert_eq!(restored.state(), LoopState::Playing);
    }

    #[test]
    fn test_recording_survives_state_round_trip() {
        let mut processor = prepared();
        processor.shared().request(LoopTrigger::Record);
        run_block(&mut processor, &[MidiEvent::new(10, note_on(60))], 100);
        run_block(&mut processor, &[MidiEvent::new(50, note_on(64))], 100);
        let state = processor.get_state().unwrap();

        let mut restored = prepared();
        restored.set_state(&state).unwrap();
        assert_eq!(restored.state(), LoopState::Recording);
        assert_eq!(restored.events().len(), 2);

        run_block(&mut restored, &[MidiEvent::new(0, note_on(67))], 100);
        restored.shared().request(LoopTrigger::Stop);
        run_block(&mut restored, &[], 100);

        let positions: Vec<u64> = restored.events().iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![10, 150, 200]);
        assert_eq!(restored.shared().length(), 300);
        assert_eq!(restored.state(), LoopState::Playing);
    }

    #[test]
    fn test_input_copy_follows_midi_capacity() {
        let mut processor = MidiLoopProcessor::default().with_midi_capacity(2);
        processor.prepare(48000.0, 100).unwrap();
        processor.shared().request(LoopTrigger::Record);
        let input: Vec<MidiEvent> = (0..5).map(|i| MidiEvent::new(i, note_on(60))).collect();
        run_block(&mut processor, &input, 100);
        assert_eq!(processor.events().len(), 2);
        assert_eq!(processor.shared().dropped_events(), 3);
    }

    #[test]
    fn test_invalid_state_rejected() {
        let mut processor = prepared();
        assert!(matches!(
            processor.set_state(b"not json"),
            Err(ProcessorError::InvalidState(_))
        ));
    }
}
