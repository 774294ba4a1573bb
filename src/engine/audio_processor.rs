//! Audio Processor
//!
//! Runs in the audio callback: pulls incoming MIDI off the input queue,
//! asks the playhead for the block's position, renders the graph and
//! writes the result to the device buffer.

use std::sync::Arc;
use std::time::Instant;

use rtrb::Consumer;

use crate::dsp::{
    context::PlayHead,
    midi::{MidiBuffer, MidiEvent, TimestampedMidiMessage},
    signal::AudioBuffer,
};

use super::commands::EngineEvent;
use super::render::GraphRenderer;

/// Audio processor that runs in the audio callback.
///
/// This struct is moved into the audio callback closure. All buffers are
/// allocated up front; `process` never allocates.
pub struct AudioProcessor {
    renderer: GraphRenderer,
    playhead: Arc<dyn PlayHead>,
    midi_input: Consumer<TimestampedMidiMessage>,
    /// Deinterleaved block handed to the renderer.
    audio: AudioBuffer,
    midi: MidiBuffer,
    /// Frame counter for throttling CPU load events.
    frame_counter: u32,
    /// Running average of CPU load (0.0-100.0).
    cpu_load_avg: f32,
}

impl AudioProcessor {
    /// How often to send CPU load events (in audio callbacks).
    const CPU_REPORT_INTERVAL: u32 = 8;

    /// Smoothing factor for CPU load averaging (0-1, higher = more responsive).
    const CPU_SMOOTHING: f32 = 0.3;

    /// Creates a processor rendering `num_channels` channels in chunks of at
    /// most `max_frames` frames.
    pub fn new(
        renderer: GraphRenderer,
        playhead: Arc<dyn PlayHead>,
        midi_input: Consumer<TimestampedMidiMessage>,
        num_channels: usize,
        max_frames: usize,
        midi_capacity: usize,
    ) -> Self {
        Self {
            renderer,
            playhead,
            midi_input,
            audio: AudioBuffer::new(num_channels.max(1), max_frames.max(1)),
            midi: MidiBuffer::with_capacity(midi_capacity),
            frame_counter: 0,
            cpu_load_avg: 0.0,
        }
    }

    /// Returns whether the renderer is currently producing audio.
    pub fn is_playing(&self) -> bool {
        self.renderer.is_playing()
    }

    /// Processes one interleaved device buffer.
    ///
    /// Called from the cpal audio callback. Device channels beyond the
    /// graph's are silent, except that a mono graph feeds every channel.
    pub fn process(&mut self, output: &mut [f32], channels: usize) {
        if channels == 0 {
            return;
        }
        let start_time = Instant::now();
        let total_frames = output.len() / channels;
        let chunk_frames = self.audio.capacity();

        for chunk in output.chunks_mut(chunk_frames * channels) {
            let frames = chunk.len() / channels;
            self.audio.set_len(frames);
            self.audio.clear();
            self.render_block();
            self.write_interleaved(chunk, channels, frames);
        }

        if self.renderer.is_playing() {
            self.update_cpu_load(start_time, total_frames);
        } else {
            self.cpu_load_avg = 0.0;
        }
    }

    /// Renders `audio` in place, with pending MIDI input at offset 0.
    fn render_block(&mut self) {
        self.midi.clear();
        while let Ok(message) = self.midi_input.pop() {
            if !self.midi.push(MidiEvent::new(0, message.message)) {
                break;
            }
        }

        let position = self.playhead.current_position();
        self.renderer.process(&mut self.audio, &mut self.midi, &position);
    }

    fn write_interleaved(&self, output: &mut [f32], channels: usize, frames: usize) {
        let graph_channels = self.audio.num_channels();
        for channel in 0..channels {
            let source = if graph_channels == 1 { 0 } else { channel };
            let samples = (source < graph_channels).then(|| self.audio.channel(source));
            for (i, frame) in output.chunks_mut(channels).take(frames).enumerate() {
                frame[channel] = samples.map_or(0.0, |s| s[i]);
            }
        }
    }

    fn update_cpu_load(&mut self, start_time: Instant, num_frames: usize) {
        let elapsed = start_time.elapsed();
        let available_time = num_frames as f64 / self.renderer.sample_rate();
        let cpu_percent = (elapsed.as_secs_f64() / available_time * 100.0) as f32;

        self.cpu_load_avg =
            Self::CPU_SMOOTHING * cpu_percent + (1.0 - Self::CPU_SMOOTHING) * self.cpu_load_avg;

        self.frame_counter += 1;
        if self.frame_counter >= Self::CPU_REPORT_INTERVAL {
            self.frame_counter = 0;
            self.renderer.report(EngineEvent::CpuLoad(self.cpu_load_avg));
        }
    }
}
