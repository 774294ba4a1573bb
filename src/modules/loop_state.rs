//! Loop recorder state machine and its lock-free shared handle.
//!
//! Both loop variants (MIDI and audio) run the same transport: this module
//! holds that state machine ([`LoopCore`]) and the atomics it publishes
//! through ([`LoopShared`]), so any thread can observe a loop and request
//! triggers without locking the node.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::dsp::context::PositionInfo;
use crate::dsp::key::Key;

/// Transport state of a loop.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoopState {
    Paused = 0,
    Playing = 1,
    Recording = 2,
    Overdubbing = 3,
}

impl LoopState {
    /// Whether the loop emits its content in this state.
    pub fn is_emitting(self) -> bool {
        matches!(self, LoopState::Playing | LoopState::Overdubbing)
    }

    pub fn name(self) -> &'static str {
        match self {
            LoopState::Paused => "Paused",
            LoopState::Playing => "Playing",
            LoopState::Recording => "Recording",
            LoopState::Overdubbing => "Overdubbing",
        }
    }
}

impl From<u8> for LoopState {
    fn from(val: u8) -> Self {
        match val {
            1 => LoopState::Playing,
            2 => LoopState::Recording,
            3 => LoopState::Overdubbing,
            _ => LoopState::Paused,
        }
    }
}

/// A transport request for a loop.
///
/// Triggers are applied at the start of the next block the loop renders.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoopTrigger {
    /// Start recording from scratch (or cue it for the next bar).
    Record = 1,
    /// Close a recording or overdub. Pauses a playing loop.
    Stop = 2,
    /// Start merging input into a playing loop.
    Overdub = 3,
    /// Resume a paused loop that has content.
    Play = 4,
    /// Pause, keeping content.
    Pause = 5,
    /// Discard content and return to Paused.
    Clear = 6,
}

impl LoopTrigger {
    fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(LoopTrigger::Record),
            2 => Some(LoopTrigger::Stop),
            3 => Some(LoopTrigger::Overdub),
            4 => Some(LoopTrigger::Play),
            5 => Some(LoopTrigger::Pause),
            6 => Some(LoopTrigger::Clear),
            _ => None,
        }
    }
}

impl std::str::FromStr for LoopTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "record" | "r" => Ok(LoopTrigger::Record),
            "stop" | "s" => Ok(LoopTrigger::Stop),
            "overdub" | "o" => Ok(LoopTrigger::Overdub),
            "play" | "p" => Ok(LoopTrigger::Play),
            "pause" | "z" => Ok(LoopTrigger::Pause),
            "clear" | "c" => Ok(LoopTrigger::Clear),
            other => Err(format!("unknown loop trigger '{other}'")),
        }
    }
}

/// State of a loop shared between the audio thread and everything else.
///
/// The audio thread is the only writer of the published fields; any thread
/// may read them or post a trigger. Each field is a single atomic, so reads
/// are never torn.
#[derive(Debug)]
pub struct LoopShared {
    state: AtomicU8,
    length: AtomicU64,
    scrub: AtomicU64,
    sample_rate_bits: AtomicU64,
    cycles: AtomicU64,
    dropped: AtomicU64,
    key: AtomicU8,
    second_key: AtomicU8,
    cued: AtomicBool,
    pending: AtomicU8,
}

impl LoopShared {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LoopState::Paused as u8),
            length: AtomicU64::new(0),
            scrub: AtomicU64::new(0),
            sample_rate_bits: AtomicU64::new(44100.0_f64.to_bits()),
            cycles: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            key: AtomicU8::new(Key::UNKNOWN.to_bits()),
            second_key: AtomicU8::new(Key::UNKNOWN.to_bits()),
            cued: AtomicBool::new(false),
            pending: AtomicU8::new(0),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Loop length in samples; 0 while empty or recording.
    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    /// Playback cursor in samples, always below the length once it is set.
    pub fn scrub_position(&self) -> u64 {
        self.scrub.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> f64 {
        f64::from_bits(self.sample_rate_bits.load(Ordering::Acquire))
    }

    pub fn length_seconds(&self) -> f64 {
        self.length() as f64 / self.sample_rate()
    }

    /// Number of times playback wrapped around since the loop was recorded.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Events or samples discarded because storage was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Best key estimate (MIDI loops only).
    pub fn key(&self) -> Key {
        Key::from_bits(self.key.load(Ordering::Relaxed))
    }

    /// Second-best key estimate (MIDI loops only).
    pub fn second_key(&self) -> Key {
        Key::from_bits(self.second_key.load(Ordering::Relaxed))
    }

    /// Whether a record trigger is waiting for the next bar.
    pub fn is_cued(&self) -> bool {
        self.cued.load(Ordering::Relaxed)
    }

    /// Posts a trigger for the next block. A newer request replaces an
    /// older one that has not been consumed yet.
    pub fn request(&self, trigger: LoopTrigger) {
        self.pending.store(trigger as u8, Ordering::Release);
    }

    pub(crate) fn take_request(&self) -> Option<LoopTrigger> {
        LoopTrigger::from_u8(self.pending.swap(0, Ordering::AcqRel))
    }

    pub(crate) fn publish_key(&self, best: Key, second: Key) {
        self.key.store(best.to_bits(), Ordering::Relaxed);
        self.second_key.store(second.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn add_dropped(&self, count: u64) {
        if count > 0 {
            self.dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    fn publish(&self, core: &LoopCore) {
        self.sample_rate_bits
            .store(core.sample_rate.to_bits(), Ordering::Release);
        self.length.store(core.length, Ordering::Release);
        self.scrub.store(core.scrub, Ordering::Release);
        self.cycles.store(core.cycles, Ordering::Relaxed);
        self.cued.store(core.cued, Ordering::Relaxed);
        self.state.store(core.state as u8, Ordering::Release);
    }
}

impl Default for LoopShared {
    fn default() -> Self {
        Self::new()
    }
}

/// The slot holding the session's master loop.
///
/// Readers on the audio thread load it without locking; the control thread
/// replaces it.
#[derive(Debug, Default)]
pub struct MasterLoop {
    slot: ArcSwapOption<LoopShared>,
}

impl MasterLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, shared: Option<Arc<LoopShared>>) {
        self.slot.store(shared);
    }

    pub fn get(&self) -> Option<Arc<LoopShared>> {
        self.slot.load_full()
    }

    /// Returns true if `shared` is the current master.
    pub fn is(&self, shared: &Arc<LoopShared>) -> bool {
        self.slot
            .load()
            .as_ref()
            .is_some_and(|master| Arc::ptr_eq(master, shared))
    }

    /// Length of the master loop in samples, if one is set and recorded.
    pub fn length(&self) -> Option<u64> {
        self.slot
            .load()
            .as_ref()
            .map(|master| master.length())
            .filter(|&len| len > 0)
    }
}

/// Content change a loop variant must carry out after a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LoopAction {
    /// Discard content and start capturing from sample 0.
    BeginRecording,
    /// Capture ended; the length is now fixed.
    FinishRecording,
    /// Overdub ended; derived data must be rebuilt.
    FinishOverdub,
    /// Content was discarded.
    Clear,
}

/// The transport shared by both loop variants.
///
/// Owned by the processor and only touched on the audio thread (or the
/// control thread while the node is locked).
#[derive(Debug)]
pub(crate) struct LoopCore {
    shared: Arc<LoopShared>,
    master: Arc<MasterLoop>,
    state: LoopState,
    length: u64,
    scrub: u64,
    elapsed: u64,
    /// Frames that arrived after capture hit its limit, before the
    /// recording could close at the next block.
    overrun: u64,
    cycles: u64,
    cued: bool,
    quantize: bool,
    auto_close_at: Option<u64>,
    /// Most samples a recording may capture.
    capacity: u64,
    last_bar: Option<(i64, f64)>,
    sample_rate: f64,
}

impl LoopCore {
    pub fn new(master: Arc<MasterLoop>) -> Self {
        Self {
            shared: Arc::new(LoopShared::new()),
            master,
            state: LoopState::Paused,
            length: 0,
            scrub: 0,
            elapsed: 0,
            overrun: 0,
            cycles: 0,
            cued: false,
            quantize: false,
            auto_close_at: None,
            capacity: u64::MAX,
            last_bar: None,
            sample_rate: 44100.0,
        }
    }

    pub fn shared(&self) -> &Arc<LoopShared> {
        &self.shared
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn scrub(&self) -> u64 {
        self.scrub
    }

    /// Samples captured so far in the current recording.
    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    pub fn quantize(&self) -> bool {
        self.quantize
    }

    pub fn set_quantize(&mut self, on: bool) {
        self.quantize = on;
        if !on {
            self.cued = false;
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.shared.publish(self);
    }

    /// Sets the recording limit in samples.
    ///
    /// A recording already past the new limit is cut to it and closes at
    /// the next block; finished content that no longer fits is discarded.
    pub fn set_capacity(&mut self, capacity: u64) {
        self.capacity = capacity;
        self.elapsed = self.elapsed.min(capacity);
        if self.length > capacity {
            self.load(0, false);
        }
    }

    /// Samples of content: the captured part while recording, else the length.
    pub fn content_len(&self) -> u64 {
        if self.state == LoopState::Recording {
            self.elapsed
        } else {
            self.length
        }
    }

    /// Installs recorded content of `length` samples, e.g. from saved state.
    pub fn load(&mut self, length: u64, playing: bool) {
        self.length = length;
        self.scrub = 0;
        self.elapsed = 0;
        self.overrun = 0;
        self.cycles = 0;
        self.cued = false;
        self.auto_close_at = None;
        self.state = if playing && length > 0 {
            LoopState::Playing
        } else {
            LoopState::Paused
        };
        self.shared.publish(self);
    }

    /// Resumes a recording that had captured `elapsed` samples.
    pub fn load_recording(&mut self, elapsed: u64) {
        self.load(0, false);
        self.state = LoopState::Recording;
        self.elapsed = elapsed.min(self.capacity);
        self.shared.publish(self);
    }

    /// Applies a pending trigger and the bar-boundary cue.
    ///
    /// Called once at the start of every block.
    pub fn begin_block(&mut self, position: &PositionInfo) -> Option<LoopAction> {
        let boundary = self.crossed_bar(position);

        let action = match self.shared.take_request() {
            Some(trigger) => self.apply(trigger, position),
            None => None,
        };
        if action.is_some() {
            return action;
        }

        if self.state == LoopState::Recording && self.elapsed >= self.record_limit() {
            return Some(self.finish_recording());
        }

        if self.cued && boundary {
            self.cued = false;
            self.auto_close_at = self
                .master
                .length()
                .filter(|_| !self.master.is(&self.shared));
            return Some(self.begin_recording());
        }
        None
    }

    fn crossed_bar(&mut self, position: &PositionInfo) -> bool {
        let current = (position.bar_index(), position.ppq_position);
        let crossed = match self.last_bar {
            Some((bar, ppq)) => current.0 != bar || current.1 < ppq,
            None => false,
        };
        self.last_bar = Some(current);
        crossed && position.is_playing
    }

    fn apply(&mut self, trigger: LoopTrigger, position: &PositionInfo) -> Option<LoopAction> {
        match (trigger, self.state) {
            (LoopTrigger::Record, LoopState::Paused) => {
                if self.quantize && position.is_playing {
                    self.cued = true;
                    None
                } else {
                    self.auto_close_at = None;
                    Some(self.begin_recording())
                }
            }
            (LoopTrigger::Stop, LoopState::Recording) => Some(self.finish_recording()),
            (LoopTrigger::Stop, LoopState::Overdubbing) => {
                self.state = LoopState::Playing;
                Some(LoopAction::FinishOverdub)
            }
            (LoopTrigger::Stop, LoopState::Playing) | (LoopTrigger::Pause, LoopState::Playing) => {
                self.state = LoopState::Paused;
                None
            }
            (LoopTrigger::Stop, LoopState::Paused) => {
                self.cued = false;
                None
            }
            (LoopTrigger::Pause, LoopState::Overdubbing) => {
                self.state = LoopState::Paused;
                Some(LoopAction::FinishOverdub)
            }
            (LoopTrigger::Overdub, LoopState::Playing) => {
                self.state = LoopState::Overdubbing;
                None
            }
            (LoopTrigger::Play, LoopState::Paused) if self.length > 0 => {
                self.state = LoopState::Playing;
                None
            }
            (LoopTrigger::Clear, _) => {
                self.state = LoopState::Paused;
                self.length = 0;
                self.scrub = 0;
                self.elapsed = 0;
                self.overrun = 0;
                self.cycles = 0;
                self.cued = false;
                self.auto_close_at = None;
                Some(LoopAction::Clear)
            }
            _ => None,
        }
    }

    fn begin_recording(&mut self) -> LoopAction {
        self.cued = false;
        self.state = LoopState::Recording;
        self.length = 0;
        self.scrub = 0;
        self.elapsed = 0;
        self.overrun = 0;
        self.cycles = 0;
        LoopAction::BeginRecording
    }

    /// Fixes the length at the captured samples. Frames that passed after
    /// the capture limit count as already played, so a loop closed by the
    /// master length stays aligned with it.
    fn finish_recording(&mut self) -> LoopAction {
        self.length = self.elapsed;
        self.scrub = if self.length > 0 {
            self.overrun % self.length
        } else {
            0
        };
        self.cycles = if self.length > 0 {
            self.overrun / self.length
        } else {
            0
        };
        self.overrun = 0;
        self.auto_close_at = None;
        self.state = if self.length > 0 {
            LoopState::Playing
        } else {
            LoopState::Paused
        };
        LoopAction::FinishRecording
    }

    /// The auto-close point or the capacity, whichever comes first.
    fn record_limit(&self) -> u64 {
        self.auto_close_at.unwrap_or(u64::MAX).min(self.capacity)
    }

    /// Number of the block's `frames` a recording may still capture.
    pub fn capture_len(&self, frames: usize) -> usize {
        let remaining = self.record_limit().saturating_sub(self.elapsed);
        (frames as u64).min(remaining) as usize
    }

    /// Advances the cursors past a rendered block.
    ///
    /// A recording stops capturing at its limit but stays in Recording
    /// until the next [`begin_block`](Self::begin_block) closes it.
    pub fn advance(&mut self, frames: usize) {
        match self.state {
            LoopState::Recording => {
                let captured = self.capture_len(frames);
                self.elapsed += captured as u64;
                self.overrun += (frames - captured) as u64;
            }
            LoopState::Playing | LoopState::Overdubbing if self.length > 0 => {
                let next = self.scrub + frames as u64;
                self.cycles += next / self.length;
                self.scrub = next % self.length;
            }
            _ => {}
        }
    }

    /// Publishes the transport to the shared handle.
    pub fn end_block(&self) {
        self.shared.publish(self);
    }
}
