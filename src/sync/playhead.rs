//! Sync playhead.
//!
//! Produces the transport position for every block from one of two sources:
//!
//! - **Master loop**: when a master loop with content is registered, its
//!   length defines one bar and its scrub cursor the position within it.
//! - **MIDI clock**: otherwise, 24 pulses per quarter note received from an
//!   external device drive the tempo and position, and Start, Continue,
//!   Stop and Song Position Pointer messages drive the transport.
//!
//! The two sources are never combined. Clock state is written on the MIDI
//! thread and published as an immutable snapshot, so the audio thread reads
//! it without locking.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dsp::context::{PlayHead, PositionInfo};
use crate::dsp::midi::{MidiMessage, TimestampedMidiMessage};
use crate::engine::dispatcher::{MidiListener, MidiSource};
use crate::modules::loop_state::{LoopState, MasterLoop};

/// MIDI clock resolution.
pub const PULSES_PER_QUARTER: u64 = 24;

/// Tempo assumed before any clock has been received.
pub const DEFAULT_BPM: f64 = 120.0;

/// Playhead settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Clock tempos below this are treated as a stalled clock.
    pub clock_floor_bpm: f64,
    /// Beats in one master loop.
    pub beats_per_bar: u32,
    pub time_sig_numerator: u8,
    pub time_sig_denominator: u8,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            clock_floor_bpm: 10.0,
            beats_per_bar: 4,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
        }
    }
}

/// The clock's tempo estimate fell below the floor.
///
/// Recovered from by resetting the clock position.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("MIDI clock stalled ({bpm:.2} bpm)")]
pub struct ClockStalled {
    pub bpm: f64,
}

/// Published clock state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSnapshot {
    pub bpm: f64,
    pub ppq_position: f64,
    pub ppq_position_of_last_bar_start: f64,
    pub is_playing: bool,
}

impl Default for ClockSnapshot {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            ppq_position: 0.0,
            ppq_position_of_last_bar_start: 0.0,
            is_playing: false,
        }
    }
}

#[derive(Debug)]
struct ClockState {
    pulses: u64,
    last_pulse_us: Option<u64>,
    bpm: f64,
    playing: bool,
}

impl ClockState {
    fn new() -> Self {
        Self {
            pulses: 0,
            last_pulse_us: None,
            bpm: DEFAULT_BPM,
            playing: false,
        }
    }

    /// Counts a clock pulse received at `timestamp_us`.
    ///
    /// The first pulse only marks the time; each later pulse re-estimates
    /// the tempo from the interval since the previous one.
    fn pulse(&mut self, timestamp_us: u64, floor_bpm: f64) -> Result<(), ClockStalled> {
        let Some(last) = self.last_pulse_us.replace(timestamp_us) else {
            return Ok(());
        };

        let interval = timestamp_us.saturating_sub(last) as f64 / 1_000_000.0;
        if interval > 0.0 {
            let bpm = 60.0 / (interval * PULSES_PER_QUARTER as f64);
            if bpm < floor_bpm {
                self.pulses = 0;
                return Err(ClockStalled { bpm });
            }
            self.bpm = bpm;
        }
        self.pulses += 1;
        Ok(())
    }

    fn start(&mut self) {
        self.pulses = 0;
        self.last_pulse_us = None;
        self.playing = true;
    }

    fn snapshot(&self, numerator: u8) -> ClockSnapshot {
        let pulses_per_bar = PULSES_PER_QUARTER * u64::from(numerator.max(1));
        ClockSnapshot {
            bpm: self.bpm,
            ppq_position: self.pulses as f64 / PULSES_PER_QUARTER as f64,
            ppq_position_of_last_bar_start: ((self.pulses / pulses_per_bar) * u64::from(numerator.max(1)))
                as f64,
            is_playing: self.playing,
        }
    }
}

/// Playhead following the master loop or an external MIDI clock.
pub struct SyncPlayHead {
    options: SyncOptions,
    master: Arc<MasterLoop>,
    clock: Mutex<ClockState>,
    snapshot: ArcSwap<ClockSnapshot>,
}

impl SyncPlayHead {
    pub fn new(options: SyncOptions, master: Arc<MasterLoop>) -> Self {
        Self {
            options,
            master,
            clock: Mutex::new(ClockState::new()),
            snapshot: ArcSwap::from_pointee(ClockSnapshot::default()),
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// The latest published clock state.
    pub fn clock(&self) -> ClockSnapshot {
        **self.snapshot.load()
    }

    /// Applies one incoming MIDI message to the clock.
    pub fn handle_message(&self, message: &TimestampedMidiMessage) {
        let mut clock = self.clock.lock();
        match message.message {
            MidiMessage::Clock => {
                if let Err(stalled) = clock.pulse(message.timestamp_us, self.options.clock_floor_bpm) {
                    tracing::debug!(%stalled, "clock position reset");
                }
            }
            MidiMessage::Start => clock.start(),
            MidiMessage::Continue => clock.playing = true,
            MidiMessage::Stop => clock.playing = false,
            MidiMessage::SongPosition { beats } => {
                clock.pulses = u64::from(beats) * (PULSES_PER_QUARTER / 4);
            }
            _ => return,
        }
        self.snapshot
            .store(Arc::new(clock.snapshot(self.options.time_sig_numerator)));
    }

    fn master_position(&self) -> Option<PositionInfo> {
        let master = self.master.get()?;
        let length = master.length();
        if length == 0 {
            return None;
        }

        let beats = f64::from(self.options.beats_per_bar.max(1));
        let length_seconds = master.length_seconds();
        let scrub = master.scrub_position();
        Some(PositionInfo {
            bpm: 60.0 / (length_seconds / beats),
            ppq_position: scrub as f64 / length as f64 * beats,
            ppq_position_of_last_bar_start: 0.0,
            time_in_seconds: scrub as f64 / master.sample_rate(),
            is_playing: matches!(master.state(), LoopState::Playing | LoopState::Overdubbing),
            time_sig_numerator: self.options.time_sig_numerator,
            time_sig_denominator: self.options.time_sig_denominator,
        })
    }

    fn clock_position(&self) -> PositionInfo {
        let clock = self.clock();
        PositionInfo {
            bpm: clock.bpm,
            ppq_position: clock.ppq_position,
            ppq_position_of_last_bar_start: clock.ppq_position_of_last_bar_start,
            time_in_seconds: clock.ppq_position * 60.0 / clock.bpm,
            is_playing: clock.is_playing,
            time_sig_numerator: self.options.time_sig_numerator,
            time_sig_denominator: self.options.time_sig_denominator,
        }
    }
}

impl PlayHead for SyncPlayHead {
    fn current_position(&self) -> PositionInfo {
        self.master_position()
            .unwrap_or_else(|| self.clock_position())
    }
}

impl MidiListener for SyncPlayHead {
    fn handle_incoming_midi_message(&self, _source: &MidiSource, message: &TimestampedMidiMessage) {
        self.handle_message(message);
    }
}
