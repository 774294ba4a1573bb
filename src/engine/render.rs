//! Render side of the processing graph.
//!
//! The control thread compiles the graph into an immutable [`RenderSequence`]
//! and hands it to the [`GraphRenderer`] through the command queue. The
//! renderer walks the sequence once per block:
//!
//! 1. Gather: sum upstream audio, merge upstream MIDI by timestamp (ties go
//!    to the lower source id)
//! 2. Inject host input into graph input nodes
//! 3. Process the node in place
//! 4. Collect graph output nodes into the host output
//!
//! Nothing here allocates or blocks. Node cells are only `try_lock`ed; a
//! node the control thread is holding renders as silence for that block.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::dsp::{
    context::{PositionInfo, ProcessContext},
    midi::MidiBuffer,
    processor::{IoRole, RenderFault},
    signal::AudioBuffer,
};

use super::channels::EngineHandle;
use super::commands::{ChannelIndex, EngineCommand, EngineEvent, Garbage, NodeId};
use super::node::{NodeCell, SharedNode};

/// Number of parameter changes that can wait for a busy node.
const DEFERRED_PARAMETER_CAPACITY: usize = 256;

/// One audio edge into a step, resolved to the source's position in the sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioInput {
    pub source_step: usize,
    pub source_channel: ChannelIndex,
    pub dest_channel: ChannelIndex,
}

/// One node's entry in a render sequence.
pub struct RenderStep {
    node_id: NodeId,
    cell: SharedNode,
    audio_inputs: Vec<AudioInput>,
    /// Source steps in ascending node id order.
    midi_inputs: Vec<usize>,
    io_role: Option<IoRole>,
    is_feedback_delay: bool,
    /// Set once the step has produced output in the current pass.
    rendered: AtomicBool,
}

impl RenderStep {
    pub fn new(
        node_id: NodeId,
        cell: SharedNode,
        audio_inputs: Vec<AudioInput>,
        midi_inputs: Vec<usize>,
        io_role: Option<IoRole>,
        is_feedback_delay: bool,
    ) -> Self {
        Self {
            node_id,
            cell,
            audio_inputs,
            midi_inputs,
            io_role,
            is_feedback_delay,
            rendered: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn audio_inputs(&self) -> &[AudioInput] {
        &self.audio_inputs
    }

    pub fn midi_inputs(&self) -> &[usize] {
        &self.midi_inputs
    }

    fn is_rendered(&self) -> bool {
        self.rendered.load(Ordering::Relaxed)
    }
}

/// A compiled, immutable execution order for one graph topology.
pub struct RenderSequence {
    steps: Vec<RenderStep>,
}

impl RenderSequence {
    pub fn new(steps: Vec<RenderStep>) -> Self {
        Self { steps }
    }

    pub fn empty() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[RenderStep] {
        &self.steps
    }

    /// Node ids in execution order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.steps.iter().map(|s| s.node_id)
    }

    fn step(&self, node_id: NodeId) -> Option<&RenderStep> {
        self.steps.iter().find(|s| s.node_id == node_id)
    }
}

impl fmt::Debug for RenderSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.node_ids()).finish()
    }
}

#[derive(Clone, Copy, Debug)]
struct DeferredParameter {
    node_id: NodeId,
    param_index: usize,
    value: f32,
}

/// Host-side scratch the renderer needs for one block size.
///
/// Built on the control thread and swapped in with
/// [`EngineCommand::Reconfigure`].
pub struct RenderBuffers {
    sample_rate: f64,
    block_size: usize,
    input: AudioBuffer,
    output: AudioBuffer,
    host_midi: MidiBuffer,
    midi_in: MidiBuffer,
    midi_out: MidiBuffer,
    deferred: Vec<DeferredParameter>,
}

impl RenderBuffers {
    pub fn new(sample_rate: f64, num_channels: usize, block_size: usize, midi_capacity: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            sample_rate,
            block_size,
            input: AudioBuffer::new(num_channels, block_size),
            output: AudioBuffer::new(num_channels, block_size),
            host_midi: MidiBuffer::with_capacity(midi_capacity),
            midi_in: MidiBuffer::with_capacity(midi_capacity),
            midi_out: MidiBuffer::with_capacity(midi_capacity),
            deferred: Vec::with_capacity(DEFERRED_PARAMETER_CAPACITY),
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Moves pending parameter changes over from the buffers being replaced.
    fn adopt_deferred(&mut self, previous: &mut RenderBuffers) {
        let room = self.deferred.capacity() - self.deferred.len();
        let count = previous.deferred.len().min(room);
        self.deferred.extend(previous.deferred.drain(..count));
    }

    fn take_dropped(&mut self) -> usize {
        self.host_midi.take_dropped() + self.midi_in.take_dropped() + self.midi_out.take_dropped()
    }
}

/// Renders the current sequence on the audio thread.
pub struct GraphRenderer {
    engine: EngineHandle,
    sequence: Arc<RenderSequence>,
    buffers: Box<RenderBuffers>,
    playing: bool,
}

impl GraphRenderer {
    pub fn new(engine: EngineHandle, buffers: RenderBuffers) -> Self {
        Self {
            engine,
            sequence: Arc::new(RenderSequence::empty()),
            buffers: Box::new(buffers),
            playing: true,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn sample_rate(&self) -> f64 {
        self.buffers.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.buffers.block_size
    }

    /// The sequence currently being rendered.
    pub fn sequence(&self) -> &RenderSequence {
        &self.sequence
    }

    /// Sends an event to the control thread, dropping it if the queue is full.
    pub fn report(&mut self, event: EngineEvent) {
        self.engine.send_event_lossy(event);
    }

    /// Applies every queued command. Called at the start of each block.
    pub fn apply_commands(&mut self) {
        while let Some(command) = self.engine.recv_command() {
            match command {
                EngineCommand::SwapSequence(sequence) => {
                    let old = std::mem::replace(&mut self.sequence, sequence);
                    // A full garbage queue frees here rather than leaking.
                    let _ = self.engine.retire(Garbage::Sequence(old));
                }
                EngineCommand::Reconfigure(mut buffers) => {
                    buffers.adopt_deferred(&mut self.buffers);
                    let old = std::mem::replace(&mut self.buffers, buffers);
                    let _ = self.engine.retire(Garbage::Buffers(old));
                }
                EngineCommand::SetParameter {
                    node_id,
                    param_index,
                    value,
                } => self.set_parameter(node_id, param_index, value),
                EngineCommand::SetPlaying(playing) => {
                    if playing != self.playing {
                        self.playing = playing;
                        let event = if playing {
                            EngineEvent::Started
                        } else {
                            EngineEvent::Stopped
                        };
                        self.engine.send_event_lossy(event);
                    }
                }
            }
        }
    }

    fn set_parameter(&mut self, node_id: NodeId, param_index: usize, value: f32) {
        // A newer value supersedes one still waiting.
        self.buffers
            .deferred
            .retain(|d| d.node_id != node_id || d.param_index != param_index);
        if !apply_parameter(&self.sequence, node_id, param_index, value)
            && self.buffers.deferred.len() < self.buffers.deferred.capacity()
        {
            self.buffers.deferred.push(DeferredParameter {
                node_id,
                param_index,
                value,
            });
        }
    }

    fn retry_deferred(&mut self) {
        let sequence = &self.sequence;
        self.buffers
            .deferred
            .retain(|d| !apply_parameter(sequence, d.node_id, d.param_index, d.value));
    }

    /// Renders one host block in place.
    ///
    /// `audio` carries the host input on entry and the graph output on
    /// return; `midi` likewise. Blocks longer than the prepared block size
    /// are rendered in consecutive sub-blocks with the position advanced
    /// between them.
    pub fn process(&mut self, audio: &mut AudioBuffer, midi: &mut MidiBuffer, position: &PositionInfo) {
        self.retry_deferred();
        self.apply_commands();

        if !self.playing {
            audio.clear();
            midi.clear();
            return;
        }

        let Self {
            engine,
            sequence,
            buffers,
            ..
        } = self;
        let buffers = &mut **buffers;

        buffers.host_midi.clear();
        buffers.host_midi.merge_from(midi);
        midi.clear();

        let total = audio.len();
        let mut position = *position;
        let mut dropped = 0;
        let mut start = 0;
        while start < total {
            let frames = (total - start).min(buffers.block_size);
            buffers.input.copy_range_from(audio, start, frames);
            buffers.output.set_len(frames);
            buffers.output.clear();
            buffers.midi_in.clear();
            buffers.midi_in.merge_range_from(&buffers.host_midi, start, frames);
            buffers.midi_out.clear();

            let context = ProcessContext::with_position(buffers.sample_rate, frames, position);
            dropped += render_pass(sequence, buffers, &context, engine);

            buffers.output.write_range_into(audio, start);
            buffers.midi_out.merge_into_shifted(midi, start);
            advance_position(&mut position, frames, buffers.sample_rate);
            start += frames;
        }

        dropped += buffers.take_dropped() + midi.take_dropped();
        if dropped > 0 {
            engine.send_event_lossy(EngineEvent::MidiDropped {
                count: dropped.min(u32::MAX as usize) as u32,
            });
        }

        let left = audio.peak(0);
        let right = if audio.num_channels() > 1 {
            audio.peak(1)
        } else {
            left
        };
        engine.send_event_lossy(EngineEvent::OutputLevel { left, right });
    }
}

/// Sets a parameter if the node is free. Returns false if it should be retried.
fn apply_parameter(sequence: &RenderSequence, node_id: NodeId, param_index: usize, value: f32) -> bool {
    let Some(step) = sequence.step(node_id) else {
        return true;
    };
    match step.cell.try_lock() {
        Some(mut cell) => {
            cell.processor
                .as_processor_mut()
                .set_parameter(param_index, value);
            true
        }
        None => false,
    }
}

/// Renders every step once. Returns the number of MIDI events dropped.
fn render_pass(
    sequence: &RenderSequence,
    buffers: &mut RenderBuffers,
    context: &ProcessContext,
    engine: &mut EngineHandle,
) -> usize {
    let frames = context.block_size;
    let mut dropped = 0;

    for step in &sequence.steps {
        step.rendered.store(false, Ordering::Relaxed);
    }

    for step in &sequence.steps {
        let Some(mut cell) = step.cell.try_lock() else {
            continue;
        };
        if cell.audio.capacity() < frames {
            // Re-prepared for a smaller block; silent until the new buffers land.
            continue;
        }

        cell.audio.set_len(frames);
        cell.audio.clear();
        if !step.is_feedback_delay {
            cell.midi.clear();
        }
        gather(sequence, step, &mut cell);

        match step.io_role {
            Some(IoRole::AudioIn) => {
                for ch in 0..cell.audio.num_channels() {
                    cell.audio.copy_from(ch, &buffers.input, ch);
                }
            }
            Some(IoRole::MidiIn) => cell.midi.merge_from(&buffers.midi_in),
            _ => {}
        }

        let fault = match catch_unwind(AssertUnwindSafe(|| cell.process(context))) {
            Ok(Ok(())) => None,
            Ok(Err(fault)) => Some(fault),
            Err(_) => Some(RenderFault::Panicked),
        };
        if let Some(fault) = fault {
            cell.silence();
            engine.send_event_lossy(EngineEvent::RenderFault {
                node_id: step.node_id,
                fault,
            });
        }
        dropped += cell.midi.take_dropped();

        match step.io_role {
            Some(IoRole::AudioOut) => {
                for ch in 0..cell.audio.num_channels() {
                    buffers.output.add_from(ch, &cell.audio, ch);
                }
            }
            Some(IoRole::MidiOut) => buffers.midi_out.merge_from(&cell.midi),
            _ => {}
        }

        step.rendered.store(true, Ordering::Relaxed);
    }

    // Delay nodes pick up this pass's MIDI for the next one.
    for step in sequence.steps.iter().filter(|s| s.is_feedback_delay) {
        let Some(mut cell) = step.cell.try_lock() else {
            continue;
        };
        cell.midi.clear();
        merge_midi_inputs(sequence, step, &mut cell);
        dropped += cell.midi.take_dropped();
    }

    dropped
}

fn gather(sequence: &RenderSequence, step: &RenderStep, cell: &mut NodeCell) {
    for input in &step.audio_inputs {
        let source = &sequence.steps[input.source_step];
        if !source.is_rendered() {
            continue;
        }
        if let Some(src) = source.cell.try_lock() {
            cell.audio
                .add_from(input.dest_channel, &src.audio, input.source_channel);
        }
    }
    if !step.is_feedback_delay {
        merge_midi_inputs(sequence, step, cell);
    }
}

fn merge_midi_inputs(sequence: &RenderSequence, step: &RenderStep, cell: &mut NodeCell) {
    for &source_step in &step.midi_inputs {
        let source = &sequence.steps[source_step];
        if !source.is_rendered() {
            continue;
        }
        if let Some(src) = source.cell.try_lock() {
            cell.midi.merge_from(&src.midi);
        }
    }
}

/// Moves a position forward by `frames` samples.
fn advance_position(position: &mut PositionInfo, frames: usize, sample_rate: f64) {
    let seconds = frames as f64 / sample_rate;
    position.time_in_seconds += seconds;
    if position.is_playing {
        position.ppq_position += seconds * position.bpm / 60.0;
        let bar = position.time_sig_numerator.max(1) as f64;
        while position.ppq_position >= position.ppq_position_of_last_bar_start + bar {
            position.ppq_position_of_last_bar_start += bar;
        }
    }
}
