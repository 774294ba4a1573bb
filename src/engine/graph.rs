//! Processing graph for managing nodes and their connections.
//!
//! The [`ProcessingGraph`] lives on the control thread. It owns the nodes,
//! validates every edit, and after each edit compiles a fresh
//! [`RenderSequence`] that it hands to the [`GraphRenderer`] through the
//! command queue. The audio thread never sees a half-applied edit.
//!
//! Ordering follows Kahn's algorithm with ties broken by ascending node id,
//! so the same topology always renders in the same order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::dsp::{
    processor::{capture_parameters, IoRole, Processor, ProcessorError},
    registry::ProcessorRegistry,
};
use crate::modules::loop_state::{LoopShared, LoopTrigger};
use crate::persistence::project::{ConnectionRecord, GraphSection, NodeRecord};

use super::channels::{ControlHandle, EngineChannels, DEFAULT_COMMAND_BUFFER_SIZE, DEFAULT_EVENT_BUFFER_SIZE};
use super::commands::{ChannelIndex, EngineCommand, EngineEvent, NodeId};
use super::node::{NodeCell, NodeProcessor, SharedNode};
use super::render::{AudioInput, GraphRenderer, RenderBuffers, RenderSequence, RenderStep};

/// Errors from graph edits. The graph is unchanged whenever one is returned.
#[derive(Error, Debug)]
pub enum GraphError {
    /// The processor could not be prepared or restored.
    #[error("invalid processor: {0}")]
    InvalidProcessor(#[from] ProcessorError),

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("node {0} already exists")]
    DuplicateNode(NodeId),

    #[error("unknown processor type '{0}'")]
    UnknownProcessorType(String),

    #[error("channel {channel} out of range on node {node} ({available} available)")]
    ChannelOutOfRange {
        node: NodeId,
        channel: ChannelIndex,
        available: usize,
    },

    #[error("connecting {from} to {to} would create a cycle")]
    WouldCreateCycle { from: NodeId, to: NodeId },

    /// The source does not produce, or the destination does not accept, MIDI.
    #[error("node {0} does not support this MIDI connection")]
    MidiNotSupported(NodeId),

    #[error("parameter {index} out of range on node {node}")]
    ParameterOutOfRange { node: NodeId, index: usize },

    #[error("node {0} is not a loop")]
    NotALoop(NodeId),

    #[error("engine command queue is full")]
    QueueFull,
}

/// An audio connection between two node channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Connection {
    pub source: NodeId,
    pub source_channel: ChannelIndex,
    pub dest: NodeId,
    pub dest_channel: ChannelIndex,
}

impl Connection {
    pub fn new(source: NodeId, source_channel: ChannelIndex, dest: NodeId, dest_channel: ChannelIndex) -> Self {
        Self {
            source,
            source_channel,
            dest,
            dest_channel,
        }
    }
}

/// A MIDI connection between two nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MidiConnection {
    pub source: NodeId,
    pub dest: NodeId,
}

/// Rendering geometry and queue sizes for a graph.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GraphConfig {
    pub sample_rate: f64,
    pub block_size: usize,
    /// Host audio channels handed to `process`.
    pub num_channels: usize,
    /// Events each node's MIDI buffer can hold per block.
    pub midi_capacity: usize,
    pub command_capacity: usize,
    pub event_capacity: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            block_size: 256,
            num_channels: 2,
            midi_capacity: crate::dsp::midi::DEFAULT_MIDI_BUFFER_CAPACITY,
            command_capacity: DEFAULT_COMMAND_BUFFER_SIZE,
            event_capacity: DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

/// Control-side record of a node.
#[derive(Clone)]
struct GraphNode {
    cell: SharedNode,
    type_id: &'static str,
    num_inputs: usize,
    num_outputs: usize,
    num_parameters: usize,
    accepts_midi: bool,
    produces_midi: bool,
    is_feedback_delay: bool,
    io_role: Option<IoRole>,
    loop_handle: Option<Arc<LoopShared>>,
}

impl GraphNode {
    fn new(cell: NodeCell) -> Self {
        let loop_handle = cell.processor.loop_handle();
        let p = cell.processor.as_processor();
        let type_id = p.info().type_id;
        let num_inputs = p.num_input_channels();
        let num_outputs = p.num_output_channels();
        let num_parameters = p.num_parameters();
        let accepts_midi = p.accepts_midi();
        let produces_midi = p.produces_midi();
        let is_feedback_delay = p.is_feedback_delay();
        let io_role = p.io_role();
        Self {
            cell: Arc::new(Mutex::new(cell)),
            type_id,
            num_inputs,
            num_outputs,
            num_parameters,
            accepts_midi,
            produces_midi,
            is_feedback_delay,
            io_role,
            loop_handle,
        }
    }
}

/// The processing graph.
///
/// The graph maintains:
/// - The nodes, keyed by id
/// - Audio and MIDI connections
/// - The render order of the last rebuild
pub struct ProcessingGraph {
    nodes: BTreeMap<NodeId, GraphNode>,
    connections: BTreeSet<Connection>,
    midi_connections: BTreeSet<MidiConnection>,
    next_id: NodeId,
    config: GraphConfig,
    control: ControlHandle,
    order: Vec<NodeId>,
    /// A sequence the command queue had no room for.
    pending: Option<Arc<RenderSequence>>,
}

impl ProcessingGraph {
    /// Creates an empty graph and the renderer that plays it.
    pub fn new(config: GraphConfig) -> (Self, GraphRenderer) {
        let (control, engine) =
            EngineChannels::new(config.command_capacity, config.event_capacity).split();
        let renderer = GraphRenderer::new(engine, render_buffers(&config));
        let graph = Self {
            nodes: BTreeMap::new(),
            connections: BTreeSet::new(),
            midi_connections: BTreeSet::new(),
            next_id: 1,
            config,
            control,
            order: Vec::new(),
            pending: None,
        };
        (graph, renderer)
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> f64 {
        self.config.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    /// Node ids in render order, as of the last rebuild.
    pub fn render_order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Type id of a node's processor.
    pub fn node_type(&self, node_id: NodeId) -> Option<&'static str> {
        self.nodes.get(&node_id).map(|n| n.type_id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.connections.iter()
    }

    pub fn midi_connections(&self) -> impl Iterator<Item = &MidiConnection> + '_ {
        self.midi_connections.iter()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len() + self.midi_connections.len()
    }

    /// The shared handle of a loop node.
    pub fn loop_handle(&self, node_id: NodeId) -> Option<Arc<LoopShared>> {
        self.nodes.get(&node_id).and_then(|n| n.loop_handle.clone())
    }

    /// Every loop node and its shared handle.
    pub fn loop_handles(&self) -> impl Iterator<Item = (NodeId, Arc<LoopShared>)> + '_ {
        self.nodes
            .iter()
            .filter_map(|(&id, n)| n.loop_handle.clone().map(|h| (id, h)))
    }

    /// Runs `f` with a node's processor locked.
    ///
    /// The node renders silence while the lock is held.
    pub fn with_processor<R>(
        &self,
        node_id: NodeId,
        f: impl FnOnce(&mut dyn Processor) -> R,
    ) -> Result<R, GraphError> {
        let node = self.node(node_id)?;
        let mut cell = node.cell.lock();
        Ok(f(cell.processor.as_processor_mut()))
    }

    // ========================================================================
    // Edits
    // ========================================================================

    /// Adds a node, preparing it for the current sample rate and block size.
    pub fn add_node(&mut self, processor: impl Into<NodeProcessor>) -> Result<NodeId, GraphError> {
        let id = self.next_id;
        self.insert_node(id, processor.into())?;
        self.rebuild();
        Ok(id)
    }

    /// Adds a node under a caller-chosen id.
    pub fn add_node_with_id(
        &mut self,
        node_id: NodeId,
        processor: impl Into<NodeProcessor>,
    ) -> Result<(), GraphError> {
        self.insert_node(node_id, processor.into())?;
        self.rebuild();
        Ok(())
    }

    fn insert_node(&mut self, node_id: NodeId, processor: NodeProcessor) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node_id) {
            return Err(GraphError::DuplicateNode(node_id));
        }
        let mut cell = NodeCell::new(processor, self.config.block_size, self.config.midi_capacity);
        cell.prepare(
            self.config.sample_rate,
            self.config.block_size,
            self.config.midi_capacity,
        )?;
        let node = GraphNode::new(cell);
        debug!(node_id, type_id = node.type_id, "node added");
        self.nodes.insert(node_id, node);
        self.next_id = self.next_id.max(node_id + 1);
        Ok(())
    }

    /// Removes a node and every connection touching it.
    pub fn remove_node(&mut self, node_id: NodeId) -> Result<(), GraphError> {
        if self.nodes.remove(&node_id).is_none() {
            return Err(GraphError::NodeNotFound(node_id));
        }
        self.connections
            .retain(|c| c.source != node_id && c.dest != node_id);
        self.midi_connections
            .retain(|c| c.source != node_id && c.dest != node_id);
        debug!(node_id, "node removed");
        self.rebuild();
        Ok(())
    }

    /// Removes every node and connection. Ids are not reused afterwards.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.connections.clear();
        self.midi_connections.clear();
        self.rebuild();
    }

    /// Connects an output channel of `source` to an input channel of `dest`.
    ///
    /// Connecting an existing edge again is a no-op.
    pub fn connect(
        &mut self,
        source: NodeId,
        source_channel: ChannelIndex,
        dest: NodeId,
        dest_channel: ChannelIndex,
    ) -> Result<(), GraphError> {
        if self.insert_connection(Connection::new(source, source_channel, dest, dest_channel))? {
            debug!(source, source_channel, dest, dest_channel, "audio connected");
            self.rebuild();
        }
        Ok(())
    }

    fn insert_connection(&mut self, connection: Connection) -> Result<bool, GraphError> {
        let source = self.node(connection.source)?;
        let dest = self.node(connection.dest)?;
        if connection.source_channel >= source.num_outputs {
            return Err(GraphError::ChannelOutOfRange {
                node: connection.source,
                channel: connection.source_channel,
                available: source.num_outputs,
            });
        }
        if connection.dest_channel >= dest.num_inputs {
            return Err(GraphError::ChannelOutOfRange {
                node: connection.dest,
                channel: connection.dest_channel,
                available: dest.num_inputs,
            });
        }
        if self.connections.contains(&connection) {
            return Ok(false);
        }
        if connection.source == connection.dest || self.reaches(connection.dest, connection.source) {
            return Err(GraphError::WouldCreateCycle {
                from: connection.source,
                to: connection.dest,
            });
        }
        self.connections.insert(connection);
        Ok(true)
    }

    /// Removes an audio connection. Returns false if it did not exist.
    pub fn disconnect(
        &mut self,
        source: NodeId,
        source_channel: ChannelIndex,
        dest: NodeId,
        dest_channel: ChannelIndex,
    ) -> bool {
        let removed = self
            .connections
            .remove(&Connection::new(source, source_channel, dest, dest_channel));
        if removed {
            debug!(source, source_channel, dest, dest_channel, "audio disconnected");
            self.rebuild();
        }
        removed
    }

    /// Routes the MIDI output of `source` into `dest`.
    ///
    /// A MIDI edge may close a cycle only if `dest` is a feedback delay.
    pub fn connect_midi(&mut self, source: NodeId, dest: NodeId) -> Result<(), GraphError> {
        if self.insert_midi_connection(MidiConnection { source, dest })? {
            debug!(source, dest, "midi connected");
            self.rebuild();
        }
        Ok(())
    }

    fn insert_midi_connection(&mut self, connection: MidiConnection) -> Result<bool, GraphError> {
        let source = self.node(connection.source)?;
        let dest = self.node(connection.dest)?;
        if !source.produces_midi {
            return Err(GraphError::MidiNotSupported(connection.source));
        }
        if !dest.accepts_midi {
            return Err(GraphError::MidiNotSupported(connection.dest));
        }
        if self.midi_connections.contains(&connection) {
            return Ok(false);
        }
        let closes_cycle = connection.source == connection.dest
            || (!dest.is_feedback_delay && self.reaches(connection.dest, connection.source));
        if closes_cycle {
            return Err(GraphError::WouldCreateCycle {
                from: connection.source,
                to: connection.dest,
            });
        }
        self.midi_connections.insert(connection);
        Ok(true)
    }

    /// Removes a MIDI connection. Returns false if it did not exist.
    pub fn disconnect_midi(&mut self, source: NodeId, dest: NodeId) -> bool {
        let removed = self.midi_connections.remove(&MidiConnection { source, dest });
        if removed {
            debug!(source, dest, "midi disconnected");
            self.rebuild();
        }
        removed
    }

    // ========================================================================
    // Render-side control
    // ========================================================================

    /// Queues a normalized parameter change, applied at the next block boundary.
    pub fn set_parameter(&mut self, node_id: NodeId, param_index: usize, value: f32) -> Result<(), GraphError> {
        let node = self.node(node_id)?;
        if param_index >= node.num_parameters {
            return Err(GraphError::ParameterOutOfRange {
                node: node_id,
                index: param_index,
            });
        }
        self.send(EngineCommand::SetParameter {
            node_id,
            param_index,
            value: value.clamp(0.0, 1.0),
        })
    }

    /// Posts a trigger to a loop node. It takes effect at the loop's next block.
    pub fn trigger_loop(&self, node_id: NodeId, trigger: LoopTrigger) -> Result<(), GraphError> {
        let handle = self
            .node(node_id)?
            .loop_handle
            .as_ref()
            .ok_or(GraphError::NotALoop(node_id))?;
        debug!(node_id, ?trigger, "loop triggered");
        handle.request(trigger);
        Ok(())
    }

    /// Starts or stops rendering. A stopped graph outputs silence.
    pub fn set_playing(&mut self, playing: bool) -> Result<(), GraphError> {
        self.send(EngineCommand::SetPlaying(playing))
    }

    /// Re-prepares every node for a new sample rate and block size.
    ///
    /// Every node is attempted; the first failure is returned.
    pub fn prepare(&mut self, sample_rate: f64, block_size: usize) -> Result<(), GraphError> {
        self.config.sample_rate = sample_rate;
        self.config.block_size = block_size;

        let mut first_error = None;
        for (&node_id, node) in &self.nodes {
            let mut cell = node.cell.lock();
            if let Err(e) = cell.prepare(sample_rate, block_size, self.config.midi_capacity) {
                warn!(node_id, error = %e, "node failed to prepare");
                first_error.get_or_insert(e);
            }
        }

        self.send(EngineCommand::Reconfigure(Box::new(render_buffers(&self.config))))?;
        debug!(sample_rate, block_size, "graph prepared");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Collects events from the renderer, logging faults.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.flush_pending();
        self.control.collect_garbage();
        let events: Vec<EngineEvent> = self.control.drain_events().collect();
        for event in &events {
            match event {
                EngineEvent::RenderFault { node_id, fault } => {
                    warn!(node_id, %fault, "node silenced");
                }
                EngineEvent::MidiDropped { count } => {
                    warn!(count, "midi events dropped");
                }
                _ => {}
            }
        }
        events
    }

    fn send(&mut self, command: EngineCommand) -> Result<(), GraphError> {
        self.flush_pending();
        self.control.send_command(command).map_err(|_| {
            warn!("engine command queue full");
            GraphError::QueueFull
        })
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Captures topology, parameters and processor state.
    ///
    /// Each node is locked briefly while its state is read.
    pub fn to_document(&self) -> GraphSection {
        let nodes = self
            .nodes
            .iter()
            .map(|(&id, node)| {
                let cell = node.cell.lock();
                let processor = cell.processor.as_processor();
                NodeRecord {
                    id,
                    type_id: node.type_id.to_string(),
                    parameters: capture_parameters(processor),
                    state: processor.get_state(),
                }
            })
            .collect();

        let connections = self
            .connections
            .iter()
            .map(|c| ConnectionRecord::Audio {
                source: c.source,
                source_channel: c.source_channel,
                dest: c.dest,
                dest_channel: c.dest_channel,
            })
            .chain(self.midi_connections.iter().map(|c| ConnectionRecord::Midi {
                source: c.source,
                dest: c.dest,
            }))
            .collect();

        GraphSection { nodes, connections }
    }

    /// Replaces the graph with the contents of a document.
    ///
    /// On failure the previous graph is put back.
    pub fn restore(&mut self, section: &GraphSection, registry: &ProcessorRegistry) -> Result<(), GraphError> {
        let previous = (
            std::mem::take(&mut self.nodes),
            std::mem::take(&mut self.connections),
            std::mem::take(&mut self.midi_connections),
            self.next_id,
        );

        let result = self.apply_section(section, registry);
        if result.is_err() {
            (self.nodes, self.connections, self.midi_connections, self.next_id) = previous;
        }
        self.rebuild();
        result
    }

    fn apply_section(&mut self, section: &GraphSection, registry: &ProcessorRegistry) -> Result<(), GraphError> {
        for record in &section.nodes {
            if self.nodes.contains_key(&record.id) {
                return Err(GraphError::DuplicateNode(record.id));
            }
            let processor = registry
                .create(&record.type_id)
                .ok_or_else(|| GraphError::UnknownProcessorType(record.type_id.clone()))?;
            self.insert_node(record.id, processor)?;

            let node = self.node(record.id)?;
            let mut cell = node.cell.lock();
            let processor = cell.processor.as_processor_mut();
            for (index, &value) in record.parameters.iter().enumerate() {
                processor.set_parameter(index, value);
            }
            if let Some(state) = &record.state {
                processor.set_state(state)?;
            }
        }

        for record in &section.connections {
            match *record {
                ConnectionRecord::Audio {
                    source,
                    source_channel,
                    dest,
                    dest_channel,
                } => {
                    self.insert_connection(Connection::new(source, source_channel, dest, dest_channel))?;
                }
                ConnectionRecord::Midi { source, dest } => {
                    self.insert_midi_connection(MidiConnection { source, dest })?;
                }
            }
        }
        debug!(
            nodes = section.nodes.len(),
            connections = section.connections.len(),
            "graph restored"
        );
        Ok(())
    }

    // ========================================================================
    // Topological Sort
    // ========================================================================

    fn node(&self, node_id: NodeId) -> Result<&GraphNode, GraphError> {
        self.nodes
            .get(&node_id)
            .ok_or(GraphError::NodeNotFound(node_id))
    }

    /// Edges that constrain render order. MIDI edges into feedback delays
    /// are read after the pass and don't count.
    fn ordering_edges(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        let audio = self.connections.iter().map(|c| (c.source, c.dest));
        let midi = self
            .midi_connections
            .iter()
            .filter(|c| !self.nodes.get(&c.dest).is_some_and(|n| n.is_feedback_delay))
            .map(|c| (c.source, c.dest));
        audio.chain(midi)
    }

    /// Whether `target` can be reached from `from` along ordering edges.
    fn reaches(&self, from: NodeId, target: NodeId) -> bool {
        let mut stack = vec![from];
        let mut visited = BTreeSet::new();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            stack.extend(
                self.ordering_edges()
                    .filter(|&(source, _)| source == node)
                    .map(|(_, dest)| dest),
            );
        }
        false
    }

    /// Computes the render order using Kahn's algorithm.
    fn compute_order(&self) -> Vec<NodeId> {
        let mut in_degree: BTreeMap<NodeId, usize> = self.nodes.keys().map(|&id| (id, 0)).collect();
        let mut successors: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for (source, dest) in self.ordering_edges() {
            if let Some(degree) = in_degree.get_mut(&dest) {
                *degree += 1;
            }
            successors.entry(source).or_default().push(dest);
        }

        // Min-heap: among ready nodes the lowest id goes first
        let mut ready: BinaryHeap<Reverse<NodeId>> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&id, _)| Reverse(id))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for dest in successors.get(&node).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dest) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(*dest));
                    }
                }
            }
        }
        order
    }

    /// Recompiles the render sequence from scratch and publishes it.
    fn rebuild(&mut self) {
        let order = self.compute_order();
        let position: BTreeMap<NodeId, usize> =
            order.iter().enumerate().map(|(i, &id)| (id, i)).collect();

        let steps = order
            .iter()
            .map(|&id| {
                let node = &self.nodes[&id];
                let audio_inputs = self
                    .connections
                    .iter()
                    .filter(|c| c.dest == id)
                    .map(|c| AudioInput {
                        source_step: position[&c.source],
                        source_channel: c.source_channel,
                        dest_channel: c.dest_channel,
                    })
                    .collect();
                // BTreeSet order puts lower source ids first
                let midi_inputs = self
                    .midi_connections
                    .iter()
                    .filter(|c| c.dest == id)
                    .map(|c| position[&c.source])
                    .collect();
                RenderStep::new(
                    id,
                    Arc::clone(&node.cell),
                    audio_inputs,
                    midi_inputs,
                    node.io_role,
                    node.is_feedback_delay,
                )
            })
            .collect();

        self.order = order;
        self.publish(Arc::new(RenderSequence::new(steps)));
    }

    fn publish(&mut self, sequence: Arc<RenderSequence>) {
        match self.control.send_command(EngineCommand::SwapSequence(sequence)) {
            Ok(()) => self.pending = None,
            Err(command) => {
                warn!("engine command queue full, render sequence update deferred");
                if let EngineCommand::SwapSequence(sequence) = command {
                    self.pending = Some(sequence);
                }
            }
        }
    }

    fn flush_pending(&mut self) {
        if let Some(sequence) = self.pending.take() {
            self.publish(sequence);
        }
    }
}

fn render_buffers(config: &GraphConfig) -> RenderBuffers {
    RenderBuffers::new(
        config.sample_rate,
        config.num_channels,
        config.block_size,
        config.midi_capacity,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::{
        context::{PositionInfo, ProcessContext},
        midi::{MidiBuffer, MidiEvent, MidiMessage},
        processor::{ProcessorInfo, RenderFault},
        registry::BuiltinOptions,
        signal::AudioBuffer,
    };
    use crate::modules::{
        feedback_delay::MidiFeedbackDelay,
        gain::Gain,
        io::GraphIoProcessor,
        loop_state::{LoopState, MasterLoop},
        midi_loop::MidiLoopProcessor,
    };

    const TEST_INFO: ProcessorInfo = ProcessorInfo::new("test.node", "Test", "Test processor");

    /// Fills its outputs with a constant.
    struct Constant {
        value: f32,
        channels: usize,
    }

    impl Processor for Constant {
        fn info(&self) -> &ProcessorInfo {
            &TEST_INFO
        }
        fn num_input_channels(&self) -> usize {
            0
        }
        fn num_output_channels(&self) -> usize {
            self.channels
        }
        fn prepare(&mut self, _: f64, _: usize) -> Result<(), ProcessorError> {
            Ok(())
        }
        fn process_block(
            &mut self,
            audio: &mut AudioBuffer,
            _midi: &mut MidiBuffer,
            _context: &ProcessContext,
        ) -> Result<(), RenderFault> {
            for ch in 0..self.channels {
                audio.channel_mut(ch).fill(self.value);
            }
            Ok(())
        }
    }

    /// One-in, one-out passthrough that also forwards MIDI.
    struct Through;

    impl Processor for Through {
        fn info(&self) -> &ProcessorInfo {
            &TEST_INFO
        }
        fn num_input_channels(&self) -> usize {
            1
        }
        fn num_output_channels(&self) -> usize {
            1
        }
        fn accepts_midi(&self) -> bool {
            true
        }
        fn produces_midi(&self) -> bool {
            true
        }
        fn prepare(&mut self, _: f64, _: usize) -> Result<(), ProcessorError> {
            Ok(())
        }
        fn process_block(
            &mut self,
            _audio: &mut AudioBuffer,
            _midi: &mut MidiBuffer,
            _context: &ProcessContext,
        ) -> Result<(), RenderFault> {
            Ok(())
        }
    }

    /// Emits fixed notes every block.
    struct Notes(Vec<(usize, u8)>);

    impl Processor for Notes {
        fn info(&self) -> &ProcessorInfo {
            &TEST_INFO
        }
        fn num_input_channels(&self) -> usize {
            0
        }
        fn num_output_channels(&self) -> usize {
            0
        }
        fn produces_midi(&self) -> bool {
            true
        }
        fn prepare(&mut self, _: f64, _: usize) -> Result<(), ProcessorError> {
            Ok(())
        }
        fn process_block(
            &mut self,
            _audio: &mut AudioBuffer,
            midi: &mut MidiBuffer,
            _context: &ProcessContext,
        ) -> Result<(), RenderFault> {
            for &(offset, note) in &self.0 {
                midi.push(MidiEvent::new(offset, note_on(note)));
            }
            Ok(())
        }
    }

    /// Fails every block, by panicking or by returning an error.
    struct Faulty {
        panic: bool,
    }

    impl Processor for Faulty {
        fn info(&self) -> &ProcessorInfo {
            &TEST_INFO
        }
        fn num_input_channels(&self) -> usize {
            1
        }
        fn num_output_channels(&self) -> usize {
            1
        }
        fn prepare(&mut self, _: f64, _: usize) -> Result<(), ProcessorError> {
            Ok(())
        }
        fn process_block(
            &mut self,
            audio: &mut AudioBuffer,
            _midi: &mut MidiBuffer,
            _context: &ProcessContext,
        ) -> Result<(), RenderFault> {
            audio.channel_mut(0).fill(9.0);
            if self.panic {
                panic!("processor blew up");
            }
            Err(RenderFault::Failed)
        }
    }

    struct Unpreparable;

    impl Processor for Unpreparable {
        fn info(&self) -> &ProcessorInfo {
            &TEST_INFO
        }
        fn num_input_channels(&self) -> usize {
            0
        }
        fn num_output_channels(&self) -> usize {
            0
        }
        fn prepare(&mut self, sample_rate: f64, block_size: usize) -> Result<(), ProcessorError> {
            Err(ProcessorError::PrepareFailed {
                sample_rate,
                block_size,
                reason: "unsupported".into(),
            })
        }
        fn process_block(
            &mut self,
            _audio: &mut AudioBuffer,
            _midi: &mut MidiBuffer,
            _context: &ProcessContext,
        ) -> Result<(), RenderFault> {
            Ok(())
        }
    }

    fn note_on(note: u8) -> MidiMessage {
        MidiMessage::NoteOn {
            channel: 0,
            note,
            velocity: 100,
        }
    }

    fn plugin(p: impl Processor) -> NodeProcessor {
        NodeProcessor::Plugin(Box::new(p))
    }

    fn graph_with_block(block_size: usize) -> (ProcessingGraph, GraphRenderer) {
        ProcessingGraph::new(GraphConfig {
            block_size,
            ..GraphConfig::default()
        })
    }

    fn graph() -> (ProcessingGraph, GraphRenderer) {
        graph_with_block(64)
    }

    fn render(renderer: &mut GraphRenderer, frames: usize, input: f32) -> (AudioBuffer, MidiBuffer) {
        let mut audio = AudioBuffer::from_channels(vec![vec![input; frames], vec![input; frames]]);
        let mut midi = MidiBuffer::with_capacity(64);
        renderer.process(&mut audio, &mut midi, &PositionInfo::new());
        (audio, midi)
    }

    fn render_midi(renderer: &mut GraphRenderer, frames: usize, events: &[MidiEvent]) -> MidiBuffer {
        let mut audio = AudioBuffer::new(2, frames);
        let mut midi = MidiBuffer::with_capacity(64);
        for &event in events {
            midi.push(event);
        }
        renderer.process(&mut audio, &mut midi, &PositionInfo::new());
        midi
    }

    fn notes(midi: &MidiBuffer) -> Vec<(usize, u8)> {
        midi.iter()
            .filter_map(|e| e.message.note().map(|n| (e.sample_offset, n)))
            .collect()
    }

    #[test]
    fn test_ids_allocated_monotonically() {
        let (mut graph, _renderer) = graph();
        let a = graph.add_node(plugin(Through)).unwrap();
        let b = graph.add_node(plugin(Through)).unwrap();
        graph.remove_node(b).unwrap();
        let c = graph.add_node(plugin(Through)).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn test_unpreparable_node_rejected() {
        let (mut graph, _renderer) = graph();
        let result = graph.add_node(plugin(Unpreparable));
        assert!(matches!(result, Err(GraphError::InvalidProcessor(_))));
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn test_remove_missing_node() {
        let (mut graph, _renderer) = graph();
        assert!(matches!(graph.remove_node(7), Err(GraphError::NodeNotFound(7))));
    }

    #[test]
    fn test_cycle_rejected_graph_unchanged() {
        let (mut graph, _renderer) = graph();
        let a = graph.add_node(plugin(Through)).unwrap();
        let b = graph.add_node(plugin(Through)).unwrap();
        let c = graph.add_node(plugin(Through)).unwrap();
        graph.connect(a, 0, b, 0).unwrap();
        graph.connect(b, 0, c, 0).unwrap();

        let order_before = graph.render_order().to_vec();
        let result = graph.connect(c, 0, a, 0);
        assert!(matches!(
            result,
            Err(GraphError::WouldCreateCycle { from, to }) if from == c && to == a
        ));
        assert_eq!(graph.connection_count(), 2);
        assert_eq!(graph.render_order(), order_before.as_slice());
    }

    #[test]
    fn test_self_connection_rejected() {
        let (mut graph, _renderer) = graph();
        let a = graph.add_node(plugin(Through)).unwrap();
        assert!(matches!(
            graph.connect(a, 0, a, 0),
            Err(GraphError::WouldCreateCycle { .. })
        ));
    }

    #[test]
    fn test_channel_out_of_range() {
        let (mut graph, _renderer) = graph();
        let a = graph.add_node(plugin(Through)).unwrap();
        let b = graph.add_node(plugin(Through)).unwrap();
        assert!(matches!(
            graph.connect(a, 1, b, 0),
            Err(GraphError::ChannelOutOfRange { node, channel: 1, available: 1 }) if node == a
        ));
        assert!(matches!(
            graph.connect(a, 0, b, 3),
            Err(GraphError::ChannelOutOfRange { node, channel: 3, .. }) if node == b
        ));
        assert_eq!(graph.connection_count(), 0);
    }

    #[test]
    fn test_duplicate_connect_is_noop() {
        let (mut graph, _renderer) = graph();
        let a = graph.add_node(plugin(Through)).unwrap();
        let b = graph.add_node(plugin(Through)).unwrap();
        graph.connect(a, 0, b, 0).unwrap();
        graph.connect(a, 0, b, 0).unwrap();
        assert_eq!(graph.connection_count(), 1);
    }

    #[test]
    fn test_disconnect_missing_edge_is_noop() {
        let (mut graph, _renderer) = graph();
        let a = graph.add_node(plugin(Through)).unwrap();
        let b = graph.add_node(plugin(Through)).unwrap();
        assert!(!graph.disconnect(a, 0, b, 0));
        assert!(!graph.disconnect(40, 0, 41, 0));
        assert!(!graph.disconnect_midi(a, b));
        assert_eq!(graph.connection_count(), 0);
    }

    #[test]
    fn test_remove_node_removes_connections() {
        let (mut graph, mut renderer) = graph();
        let a = graph.add_node(plugin(Through)).unwrap();
        let b = graph.add_node(plugin(Through)).unwrap();
        let c = graph.add_node(plugin(Through)).unwrap();
        graph.connect(a, 0, b, 0).unwrap();
        graph.connect(b, 0, c, 0).unwrap();
        graph.connect_midi(a, b).unwrap();

        graph.remove_node(b).unwrap();
        assert_eq!(graph.connection_count(), 0);
        assert!(!graph.render_order().contains(&b));

        render(&mut renderer, 64, 0.0);
        assert!(renderer.sequence().node_ids().all(|id| id != b));
        assert_eq!(renderer.sequence().len(), 2);
    }

    #[test]
    fn test_order_ties_broken_by_id() {
        let (mut graph, _renderer) = graph();
        let a = graph.add_node(plugin(Through)).unwrap();
        let b = graph.add_node(plugin(Through)).unwrap();
        let c = graph.add_node(plugin(Through)).unwrap();
        assert_eq!(graph.render_order(), &[a, b, c]);

        graph.connect(c, 0, a, 0).unwrap();
        assert_eq!(graph.render_order(), &[b, c, a]);
    }

    #[test]
    fn test_audio_passthrough() {
        let (mut graph, mut renderer) = graph();
        let input = graph.add_node(plugin(GraphIoProcessor::audio_input(2))).unwrap();
        let gain = graph.add_node(plugin(Gain::new(2))).unwrap();
        let output = graph.add_node(plugin(GraphIoProcessor::audio_output(2))).unwrap();
        for ch in 0..2 {
            graph.connect(input, ch, gain, ch).unwrap();
            graph.connect(gain, ch, output, ch).unwrap();
        }

        let (audio, _) = render(&mut renderer, 64, 0.5);
        for ch in 0..2 {
            assert!(audio.channel(ch).iter().all(|&s| (s - 0.5).abs() < 1e-4));
        }
    }

    #[test]
    fn test_fan_in_accumulates() {
        let (mut graph, mut renderer) = graph();
        let a = graph.add_node(plugin(Constant { value: 0.25, channels: 1 })).unwrap();
        let b = graph.add_node(plugin(Constant { value: 0.5, channels: 1 })).unwrap();
        let output = graph.add_node(plugin(GraphIoProcessor::audio_output(2))).unwrap();
        graph.connect(a, 0, output, 0).unwrap();
        graph.connect(b, 0, output, 0).unwrap();
        graph.connect(b, 0, output, 1).unwrap();

        let (audio, _) = render(&mut renderer, 64, 0.0);
        assert!(audio.channel(0).iter().all(|&s| (s - 0.75).abs() < 1e-6));
        assert!(audio.channel(1).iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_midi_merge_ties_by_source_id() {
        let (mut graph, mut renderer) = graph();
        let first = graph.add_node(plugin(Notes(vec![(5, 60)]))).unwrap();
        let second = graph.add_node(plugin(Notes(vec![(0, 62), (5, 61)]))).unwrap();
        let output = graph.add_node(plugin(GraphIoProcessor::midi_output())).unwrap();
        graph.connect_midi(second, output).unwrap();
        graph.connect_midi(first, output).unwrap();

        let midi = render_midi(&mut renderer, 64, &[]);
        assert_eq!(notes(&midi), vec![(0, 62), (5, 60), (5, 61)]);
    }

    #[test]
    fn test_midi_connection_requires_support() {
        let (mut graph, _renderer) = graph();
        let gain = graph.add_node(plugin(Gain::default())).unwrap();
        let through = graph.add_node(plugin(Through)).unwrap();
        assert!(matches!(
            graph.connect_midi(gain, through),
            Err(GraphError::MidiNotSupported(id)) if id == gain
        ));
        assert!(matches!(
            graph.connect_midi(through, gain),
            Err(GraphError::MidiNotSupported(id)) if id == gain
        ));
    }

    #[test]
    fn test_midi_cycle_needs_feedback_delay() {
        let (mut graph, _renderer) = graph();
        let a = graph.add_node(plugin(Through)).unwrap();
        let b = graph.add_node(plugin(Through)).unwrap();
        graph.connect_midi(a, b).unwrap();
        assert!(matches!(
            graph.connect_midi(b, a),
            Err(GraphError::WouldCreateCycle { .. })
        ));

        let delay = graph.add_node(plugin(MidiFeedbackDelay)).unwrap();
        graph.connect_midi(b, delay).unwrap();
        graph.connect_midi(delay, a).unwrap();
        assert_eq!(graph.render_order(), &[delay, a, b]);
    }

    #[test]
    fn test_feedback_delay_is_one_block() {
        let (mut graph, mut renderer) = graph();
        let input = graph.add_node(plugin(GraphIoProcessor::midi_input())).unwrap();
        let delay = graph.add_node(plugin(MidiFeedbackDelay)).unwrap();
        let output = graph.add_node(plugin(GraphIoProcessor::midi_output())).unwrap();
        graph.connect_midi(input, delay).unwrap();
        graph.connect_midi(delay, output).unwrap();

        let first = render_midi(&mut renderer, 64, &[MidiEvent::new(9, note_on(64))]);
        assert!(first.is_empty());
        let second = render_midi(&mut renderer, 64, &[]);
        assert_eq!(notes(&second), vec![(9, 64)]);
        let third = render_midi(&mut renderer, 64, &[]);
        assert!(third.is_empty());
    }

    #[test]
    fn test_panicking_node_silenced_and_reported() {
        let (mut graph, mut renderer) = graph();
        let source = graph.add_node(plugin(Constant { value: 1.0, channels: 1 })).unwrap();
        let faulty = graph.add_node(plugin(Faulty { panic: true })).unwrap();
        let output = graph.add_node(plugin(GraphIoProcessor::audio_output(2))).unwrap();
        graph.connect(source, 0, faulty, 0).unwrap();
        graph.connect(faulty, 0, output, 0).unwrap();
        graph.connect(source, 0, output, 1).unwrap();

        let (audio, _) = render(&mut renderer, 64, 0.0);
        assert!(audio.channel(0).iter().all(|&s| s == 0.0));
        assert!(audio.channel(1).iter().all(|&s| s == 1.0));

        let events = graph.drain_events();
        assert!(events.contains(&EngineEvent::RenderFault {
            node_id: faulty,
            fault: RenderFault::Panicked,
        }));
    }

    #[test]
    fn test_failing_node_reports_failure() {
        let (mut graph, mut renderer) = graph();
        let faulty = graph.add_node(plugin(Faulty { panic: false })).unwrap();
        let output = graph.add_node(plugin(GraphIoProcessor::audio_output(2))).unwrap();
        graph.connect(faulty, 0, output, 0).unwrap();

        let (audio, _) = render(&mut renderer, 64, 0.0);
        assert!(audio.channel(0).iter().all(|&s| s == 0.0));
        assert!(graph.drain_events().contains(&EngineEvent::RenderFault {
            node_id: faulty,
            fault: RenderFault::Failed,
        }));
    }

    #[test]
    fn test_oversized_block_rendered_in_sub_blocks() {
        let (mut graph, mut renderer) = graph_with_block(64);
        let audio_in = graph.add_node(plugin(GraphIoProcessor::audio_input(2))).unwrap();
        let audio_out = graph.add_node(plugin(GraphIoProcessor::audio_output(2))).unwrap();
        let midi_in = graph.add_node(plugin(GraphIoProcessor::midi_input())).unwrap();
        let midi_out = graph.add_node(plugin(GraphIoProcessor::midi_output())).unwrap();
        graph.connect(audio_in, 0, audio_out, 0).unwrap();
        graph.connect_midi(midi_in, midi_out).unwrap();

        let ramp: Vec<f32> = (0..150).map(|i| i as f32).collect();
        let mut audio = AudioBuffer::from_channels(vec![ramp.clone(), ramp.clone()]);
        let mut midi = MidiBuffer::with_capacity(8);
        midi.push(MidiEvent::new(100, note_on(70)));
        renderer.process(&mut audio, &mut midi, &PositionInfo::new());

        assert_eq!(audio.channel(0), ramp.as_slice());
        assert!(audio.channel(1).iter().all(|&s| s == 0.0));
        assert_eq!(notes(&midi), vec![(100, 70)]);
    }

    #[test]
    fn test_set_parameter_applied_at_block_boundary() {
        let (mut graph, mut renderer) = graph();
        let gain = graph.add_node(plugin(Gain::default())).unwrap();
        assert!(matches!(
            graph.set_parameter(gain, 5, 0.5),
            Err(GraphError::ParameterOutOfRange { index: 5, .. })
        ));

        graph.set_parameter(gain, 0, 0.25).unwrap();
        let before = graph.with_processor(gain, |p| p.get_parameter(0)).unwrap();
        assert_ne!(before, 0.25);

        render(&mut renderer, 64, 0.0);
        let after = graph.with_processor(gain, |p| p.get_parameter(0)).unwrap();
        assert_eq!(after, 0.25);
    }

    #[test]
    fn test_trigger_loop() {
        let (mut graph, mut renderer) = graph();
        let gain = graph.add_node(plugin(Gain::default())).unwrap();
        assert!(matches!(
            graph.trigger_loop(gain, LoopTrigger::Record),
            Err(GraphError::NotALoop(_))
        ));

        let looper = graph
            .add_node(MidiLoopProcessor::new(64, Arc::new(MasterLoop::new())))
            .unwrap();
        graph.trigger_loop(looper, LoopTrigger::Record).unwrap();
        render(&mut renderer, 64, 0.0);
        let handle = graph.loop_handle(looper).unwrap();
        assert_eq!(handle.state(), LoopState::Recording);
        assert_eq!(graph.loop_handles().count(), 1);
    }

    #[test]
    fn test_stopped_graph_outputs_silence() {
        let (mut graph, mut renderer) = graph();
        let source = graph.add_node(plugin(Constant { value: 1.0, channels: 1 })).unwrap();
        let output = graph.add_node(plugin(GraphIoProcessor::audio_output(2))).unwrap();
        graph.connect(source, 0, output, 0).unwrap();

        graph.set_playing(false).unwrap();
        let (audio, _) = render(&mut renderer, 64, 0.0);
        assert!(audio.channel(0).iter().all(|&s| s == 0.0));
        assert!(graph.drain_events().contains(&EngineEvent::Stopped));

        graph.set_playing(true).unwrap();
        let (audio, _) = render(&mut renderer, 64, 0.0);
        assert!(audio.channel(0).iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_prepare_reconfigures_renderer() {
        let (mut graph, mut renderer) = graph_with_block(64);
        let source = graph.add_node(plugin(Constant { value: 1.0, channels: 1 })).unwrap();
        let output = graph.add_node(plugin(GraphIoProcessor::audio_output(2))).unwrap();
        graph.connect(source, 0, output, 0).unwrap();

        graph.prepare(44100.0, 32).unwrap();
        let (audio, _) = render(&mut renderer, 100, 0.0);
        assert_eq!(renderer.block_size(), 32);
        assert!(audio.channel(0).iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_document_round_trip() {
        let registry =
            ProcessorRegistry::with_builtins(BuiltinOptions::default(), Arc::new(MasterLoop::new()));
        let (mut graph, _renderer) = graph();
        let input = graph.add_node(registry.create("io.audio_in").unwrap()).unwrap();
        let gain = graph.add_node(registry.create("util.gain").unwrap()).unwrap();
        let midi_in = graph.add_node(registry.create("io.midi_in").unwrap()).unwrap();
        let looper = graph.add_node(registry.create("loop.midi").unwrap()).unwrap();
        graph.connect(input, 0, gain, 1).unwrap();
        graph.connect_midi(midi_in, looper).unwrap();
        graph.with_processor(gain, |p| p.set_parameter(0, 0.4)).unwrap();

        let document = graph.to_document();
        let (mut restored, _renderer) = graph_with_block(64);
        restored.restore(&document, &registry).unwrap();

        assert_eq!(restored.to_document(), document);
        assert_eq!(restored.render_order(), graph.render_order());
        assert!(restored.loop_handle(looper).is_some());
        let next = restored.add_node(registry.create("util.gain").unwrap()).unwrap();
        assert_eq!(next, looper + 1);
    }

    #[test]
    fn test_restore_failure_keeps_graph() {
        let registry =
            ProcessorRegistry::with_builtins(BuiltinOptions::default(), Arc::new(MasterLoop::new()));
        let (mut graph, _renderer) = graph();
        let kept = graph.add_node(registry.create("util.gain").unwrap()).unwrap();

        let mut document = graph.to_document();
        document.nodes.push(NodeRecord {
            id: 9,
            type_id: "vst.missing".into(),
            parameters: Vec::new(),
            state: None,
        });
        let result = graph.restore(&document, &registry);
        assert!(matches!(result, Err(GraphError::UnknownProcessorType(ref t)) if t == "vst.missing"));
        assert_eq!(graph.node_ids().collect::<Vec<_>>(), vec![kept]);

        let mut duplicate = graph.to_document();
        duplicate.nodes.push(duplicate.nodes[0].clone());
        assert!(matches!(
            graph.restore(&duplicate, &registry),
            Err(GraphError::DuplicateNode(id)) if id == kept
        ));
        assert_eq!(graph.node_count(), 1);
    }
}
