//! Processing context for graph nodes.
//!
//! Provides the transport position and block geometry every process step
//! receives, and the [`PlayHead`] trait that produces that position.

/// Transport position for one processing block.
///
/// Produced once per block by a [`PlayHead`] and shared by every node in
/// the graph, so all nodes see the same musical time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PositionInfo {
    /// Current tempo in beats per minute.
    pub bpm: f64,
    /// Position in quarter notes since the transport started.
    pub ppq_position: f64,
    /// Position in quarter notes of the start of the current bar.
    pub ppq_position_of_last_bar_start: f64,
    /// Position in seconds.
    pub time_in_seconds: f64,
    /// Whether the transport is rolling.
    pub is_playing: bool,
    /// Time signature numerator (beats per bar).
    pub time_sig_numerator: u8,
    /// Time signature denominator (beat unit).
    pub time_sig_denominator: u8,
}

impl PositionInfo {
    /// Creates a stopped position at zero, 120 BPM, 4/4.
    pub fn new() -> Self {
        Self {
            bpm: 120.0,
            ppq_position: 0.0,
            ppq_position_of_last_bar_start: 0.0,
            time_in_seconds: 0.0,
            is_playing: false,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
        }
    }

    /// Creates a rolling position at zero with the given tempo.
    pub fn playing_at(bpm: f64) -> Self {
        Self {
            bpm,
            is_playing: true,
            ..Self::new()
        }
    }

    /// Returns the index of the bar containing the current bar start.
    pub fn bar_index(&self) -> i64 {
        let beats_per_bar = self.time_sig_numerator.max(1) as f64;
        (self.ppq_position_of_last_bar_start / beats_per_bar).floor() as i64
    }

    /// Returns the duration of one beat in samples at the given rate.
    pub fn samples_per_beat(&self, sample_rate: f64) -> Option<f64> {
        (self.bpm > 0.0).then(|| sample_rate * 60.0 / self.bpm)
    }
}

impl Default for PositionInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of the transport position for each processing block.
///
/// Implementations must be callable from the audio thread: no allocation,
/// no blocking.
pub trait PlayHead: Send + Sync {
    /// Returns the position for the block about to be rendered.
    fn current_position(&self) -> PositionInfo;
}

/// A playhead that always reports a fixed position.
///
/// Used when no sync source is attached, and in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedPlayHead(pub PositionInfo);

impl PlayHead for FixedPlayHead {
    fn current_position(&self) -> PositionInfo {
        self.0
    }
}

/// Context provided to processors during audio processing.
#[derive(Clone, Copy, Debug)]
pub struct ProcessContext {
    /// The audio sample rate in Hz (e.g., 44100, 48000).
    pub sample_rate: f64,
    /// The number of samples in the current processing block.
    pub block_size: usize,
    /// Transport position for this block.
    pub position: PositionInfo,
}

impl ProcessContext {
    /// Creates a new process context with a stopped transport.
    pub fn new(sample_rate: f64, block_size: usize) -> Self {
        Self {
            sample_rate,
            block_size,
            position: PositionInfo::new(),
        }
    }

    /// Creates a process context with transport information.
    pub fn with_position(sample_rate: f64, block_size: usize, position: PositionInfo) -> Self {
        Self {
            sample_rate,
            block_size,
            position,
        }
    }

    /// Returns the duration of the current block in seconds.
    pub fn block_duration(&self) -> f64 {
        self.block_size as f64 / self.sample_rate
    }

    /// Converts a duration in seconds to samples.
    pub fn seconds_to_samples(&self, seconds: f64) -> usize {
        (seconds * self.sample_rate).round() as usize
    }
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new(44100.0, 256)
    }
}
