//! Audio loop recorder.
//!
//! Same transport as the MIDI loop, over a sample buffer allocated up front
//! for a maximum loop duration. Input is always monitored; the loop is added
//! on top while playing, and overdubbing sums the input into the loop.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dsp::{
    context::ProcessContext,
    midi::MidiBuffer,
    processor::{Processor, ProcessorError, ProcessorInfo, RenderFault},
    signal::AudioBuffer,
};

use super::loop_state::{LoopAction, LoopCore, LoopShared, LoopState, MasterLoop};

/// Default maximum loop duration in seconds.
pub const DEFAULT_MAX_LOOP_SECONDS: f64 = 60.0;

const INFO: ProcessorInfo = ProcessorInfo::new(
    "loop.audio",
    "Audio Loop",
    "Records and loops audio with overdub",
);

#[derive(Serialize, Deserialize)]
struct AudioLoopSnapshot {
    /// Loop length, or the captured frames of a recording in progress.
    length: u64,
    playing: bool,
    #[serde(default)]
    recording: bool,
    channels: Vec<Vec<f32>>,
}

/// An audio loop recorder node.
pub struct AudioLoopProcessor {
    core: LoopCore,
    num_channels: usize,
    max_seconds: f64,
    /// Loop storage, one vector per channel, `capacity` frames each.
    buffer: Vec<Vec<f32>>,
    capacity: u64,
}

impl AudioLoopProcessor {
    pub fn new(num_channels: usize, max_seconds: f64, master: Arc<MasterLoop>) -> Self {
        Self {
            core: LoopCore::new(master),
            num_channels,
            max_seconds,
            buffer: vec![Vec::new(); num_channels],
            capacity: 0,
        }
    }

    pub fn shared(&self) -> Arc<LoopShared> {
        Arc::clone(self.core.shared())
    }

    pub fn state(&self) -> LoopState {
        self.core.state()
    }

    /// Maximum loop length in frames at the prepared sample rate.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Recorded samples of one channel.
    pub fn channel(&self, channel: usize) -> &[f32] {
        self.content(channel, self.core.length())
    }

    fn content(&self, channel: usize, frames: u64) -> &[f32] {
        let frames = frames as usize;
        self.buffer
            .get(channel)
            .map(|c| &c[..frames.min(c.len())])
            .unwrap_or(&[])
    }

    /// Captures the first `frames` frames of the block at the recording cursor.
    fn record_block(&mut self, audio: &AudioBuffer, frames: usize) {
        let start = self.core.elapsed() as usize;
        for (ch, dest) in self.buffer.iter_mut().enumerate() {
            if ch >= audio.num_channels() {
                break;
            }
            dest[start..start + frames].copy_from_slice(&audio.channel(ch)[..frames]);
        }
    }

    fn play_block(&mut self, audio: &mut AudioBuffer, frames: usize, overdub: bool) {
        let length = self.core.length() as usize;
        if length == 0 {
            return;
        }
        let scrub = self.core.scrub() as usize;
        for (ch, stored) in self.buffer.iter_mut().enumerate() {
            if ch >= audio.num_channels() {
                break;
            }
            let out = &mut audio.channel_mut(ch)[..frames];
            let mut cursor = scrub;
            for sample in out.iter_mut() {
                let input = *sample;
                *sample = input + stored[cursor];
                if overdub {
                    stored[cursor] += input;
                }
                cursor += 1;
                if cursor == length {
                    cursor = 0;
                }
            }
        }
    }

    fn apply(&mut self, action: LoopAction) {
        match action {
            LoopAction::BeginRecording | LoopAction::Clear => {
                for channel in &mut self.buffer {
                    channel.fill(0.0);
                }
            }
            LoopAction::FinishRecording | LoopAction::FinishOverdub => {}
        }
    }
}

impl Default for AudioLoopProcessor {
    fn default() -> Self {
        Self::new(2, DEFAULT_MAX_LOOP_SECONDS, Arc::new(MasterLoop::new()))
    }
}

impl Processor for AudioLoopProcessor {
    fn info(&self) -> &ProcessorInfo {
        &INFO
    }

    fn num_input_channels(&self) -> usize {
        self.num_channels
    }

    fn num_output_channels(&self) -> usize {
        self.num_channels
    }

    fn prepare(&mut self, sample_rate: f64, max_block_size: usize) -> Result<(), ProcessorError> {
        if sample_rate <= 0.0 || self.max_seconds <= 0.0 {
            return Err(ProcessorError::PrepareFailed {
                sample_rate,
                block_size: max_block_size,
                reason: "loop duration and sample rate must be positive".into(),
            });
        }
        let frames = (self.max_seconds * sample_rate).ceil() as usize;
        for channel in &mut self.buffer {
            channel.resize(frames, 0.0);
        }
        self.capacity = frames as u64;
        self.core.set_capacity(self.capacity);
        self.core.set_sample_rate(sample_rate);
        Ok(())
    }

    fn release_resources(&mut self) {
        for channel in &mut self.buffer {
            *channel = Vec::new();
        }
        self.capacity = 0;
        self.core.load(0, false);
        self.core.set_capacity(0);
    }

    fn process_block(
        &mut self,
        audio: &mut AudioBuffer,
        _midi: &mut MidiBuffer,
        context: &ProcessContext,
    ) -> Result<(), RenderFault> {
        if let Some(action) = self.core.begin_block(&context.position) {
            self.apply(action);
        }

        let n = context.block_size.min(audio.len());
        match self.core.state() {
            LoopState::Recording => {
                let frames = self.core.capture_len(n);
                self.record_block(audio, frames);
            }
            LoopState::Playing => self.play_block(audio, n, false),
            LoopState::Overdubbing => self.play_block(audio, n, true),
            LoopState::Paused => {}
        }
        self.core.advance(n);
        self.core.end_block();
        Ok(())
    }

    fn get_state(&self) -> Option<Vec<u8>> {
        let length = self.core.content_len();
        let snapshot = AudioLoopSnapshot {
            length,
            playing: self.core.state().is_emitting(),
            recording: self.core.state() == LoopState::Recording,
            channels: (0..self.num_channels)
                .map(|ch| self.content(ch, length).to_vec())
                .collect(),
        };
        serde_json::to_vec(&snapshot).ok()
    }

    fn set_state(&mut self, data: &[u8]) -> Result<(), ProcessorError> {
        let snapshot: AudioLoopSnapshot = serde_json::from_slice(data)
            .map_err(|e| ProcessorError::InvalidState(e.to_string()))?;
        if snapshot.length > self.capacity {
            return Err(ProcessorError::InvalidState(format!(
                "loop of {} frames exceeds capacity {}",
                snapshot.length, self.capacity
            )));
        }
        let length = snapshot.length as usize;
        for (ch, dest) in self.buffer.iter_mut().enumerate() {
            dest.fill(0.0);
            if let Some(src) = snapshot.channels.get(ch) {
                let frames = src.len().min(length);
                dest[..frames].copy_from_slice(&src[..frames]);
            }
        }
        if snapshot.recording {
            self.core.load_recording(snapshot.length);
        } else {
            self.core.load(snapshot.length, snapshot.playing);
        }
        Ok(())
    }
}
