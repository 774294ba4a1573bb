//! The session.
//!
//! Owns every long-lived component and wires them together in a fixed
//! order: master slot, processor registry, graph, loop manager, playhead,
//! control surface, MIDI dispatcher. MIDI listeners are registered with the
//! dispatcher in that order too, so clock messages reach the playhead before
//! anything else sees them.

use std::path::Path;
use std::sync::Arc;

use rtrb::Consumer;

use crate::config::EngineConfig;
use crate::control::action::ControlTarget;
use crate::control::surface::ControlSurface;
use crate::dsp::context::PlayHead;
use crate::dsp::midi::TimestampedMidiMessage;
use crate::dsp::registry::ProcessorRegistry;
use crate::engine::audio_processor::AudioProcessor;
use crate::engine::commands::{EngineEvent, NodeId};
use crate::engine::dispatcher::{ListenerId, MidiDispatcher, MidiInputQueue, MidiListener};
use crate::engine::graph::{GraphError, ProcessingGraph};
use crate::engine::node::NodeProcessor;
use crate::engine::render::GraphRenderer;
use crate::modules::loop_state::{LoopTrigger, MasterLoop};
use crate::persistence::project::{self, ControlSurfaceSection, ProjectDocument, ProjectError};
use crate::sync::{LoopManager, SyncPlayHead};

/// Rounds of parameter-driven control actions applied per update pass.
/// Changes still queued after the last round wait for the next pass.
const MAX_PROPAGATION_ROUNDS: usize = 8;

/// A running loopgraph session.
pub struct Session {
    config: EngineConfig,
    registry: ProcessorRegistry,
    graph: ProcessingGraph,
    loops: LoopManager,
    playhead: Arc<SyncPlayHead>,
    surface: Arc<ControlSurface>,
    dispatcher: Arc<MidiDispatcher>,
    midi_queue: Arc<MidiInputQueue>,
    listeners: Vec<ListenerId>,
    /// Render side, until an audio processor takes it.
    render_side: Option<(GraphRenderer, Consumer<TimestampedMidiMessage>)>,
}

impl Session {
    pub fn new(config: EngineConfig) -> Self {
        let master = Arc::new(MasterLoop::new());
        let registry = ProcessorRegistry::with_builtins(config.builtin_options(), Arc::clone(&master));
        let (graph, renderer) = ProcessingGraph::new(config.graph_config());
        let loops = LoopManager::new(Arc::clone(&master));
        let playhead = Arc::new(SyncPlayHead::new(config.sync, master));
        let surface = Arc::new(ControlSurface::new());
        let dispatcher = Arc::new(MidiDispatcher::new());
        let (midi_queue, midi_input) = MidiInputQueue::new(config.midi.input_queue_size);

        let listeners = vec![
            dispatcher.add_listener(Arc::clone(&playhead) as Arc<dyn MidiListener>),
            dispatcher.add_listener(Arc::clone(&surface) as Arc<dyn MidiListener>),
            dispatcher.add_listener(Arc::clone(&midi_queue) as Arc<dyn MidiListener>),
        ];

        tracing::debug!(
            sample_rate = config.sample_rate,
            block_size = config.block_size,
            "session created"
        );

        Self {
            config,
            registry,
            graph,
            loops,
            playhead,
            surface,
            dispatcher,
            midi_queue,
            listeners,
            render_side: Some((renderer, midi_input)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn graph(&self) -> &ProcessingGraph {
        &self.graph
    }

    /// The graph, for connection edits and parameter changes.
    ///
    /// Add and remove nodes through the session so loops stay registered.
    pub fn graph_mut(&mut self) -> &mut ProcessingGraph {
        &mut self.graph
    }

    pub fn loops(&self) -> &LoopManager {
        &self.loops
    }

    pub fn playhead(&self) -> &Arc<SyncPlayHead> {
        &self.playhead
    }

    pub fn surface(&self) -> &Arc<ControlSurface> {
        &self.surface
    }

    /// The dispatcher a MIDI engine should feed.
    pub fn dispatcher(&self) -> &Arc<MidiDispatcher> {
        &self.dispatcher
    }

    /// Incoming messages dropped because the audio thread fell behind.
    pub fn midi_input_dropped(&self) -> u64 {
        self.midi_queue.dropped()
    }

    /// Hands the render side to an audio processor. Returns `None` after
    /// the first call.
    pub fn take_audio_processor(&mut self) -> Option<AudioProcessor> {
        let (renderer, midi_input) = self.render_side.take()?;
        let playhead: Arc<dyn PlayHead> = Arc::clone(&self.playhead) as Arc<dyn PlayHead>;
        Some(AudioProcessor::new(
            renderer,
            playhead,
            midi_input,
            self.config.num_channels,
            self.graph.block_size(),
            self.config.midi_capacity,
        ))
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Adds a node. Loop nodes are registered with the loop manager.
    pub fn add_node(&mut self, processor: impl Into<NodeProcessor>) -> Result<NodeId, GraphError> {
        let id = self.graph.add_node(processor)?;
        if let Some(handle) = self.graph.loop_handle(id) {
            self.loops.register(id, handle);
        }
        Ok(id)
    }

    /// Creates a node from a registered processor type.
    pub fn create_node(&mut self, type_id: &str) -> Result<NodeId, GraphError> {
        let processor = self
            .registry
            .create(type_id)
            .ok_or_else(|| GraphError::UnknownProcessorType(type_id.to_string()))?;
        self.add_node(processor)
    }

    /// Removes a node, its loop registration and the control actions
    /// referencing it.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), GraphError> {
        self.graph.remove_node(id)?;
        self.loops.unregister(id);
        let pruned = self.surface.prune_node(id);
        if pruned > 0 {
            tracing::debug!(node = id, pruned, "control actions pruned");
        }
        Ok(())
    }

    pub fn set_master(&mut self, id: Option<NodeId>) -> Result<(), GraphError> {
        self.loops.set_master(id)
    }

    pub fn trigger_loop(&self, id: NodeId, trigger: LoopTrigger) -> Result<(), GraphError> {
        self.graph.trigger_loop(id, trigger)
    }

    /// Posts `trigger` to every loop in the session.
    pub fn trigger_all_loops(&self, trigger: LoopTrigger) {
        self.loops.trigger_all(trigger);
    }

    /// Sets a normalized parameter and fires the control actions sourced
    /// from it. Their changes are applied by the next [`update`](Self::update).
    pub fn set_parameter(&mut self, node: NodeId, index: usize, value: f32) -> Result<(), GraphError> {
        self.graph.set_parameter(node, index, value)?;
        self.surface
            .handle_parameter_change(node, index, value.clamp(0.0, 1.0));
        Ok(())
    }

    /// Removes every control action driving `target`. Returns how many were removed.
    pub fn unbind(&self, target: ControlTarget) -> usize {
        let removed = self.surface.remove_actions_for_target(target);
        if removed > 0 {
            tracing::debug!(node = target.node, parameter = target.parameter, removed, "control actions removed");
        }
        removed
    }

    /// Re-prepares the graph, e.g. for the device's actual sample rate.
    pub fn prepare(&mut self, sample_rate: f64, block_size: usize) -> Result<(), GraphError> {
        self.graph.prepare(sample_rate, block_size)
    }

    // ========================================================================
    // Update pass
    // ========================================================================

    /// Runs one control-thread update: applies queued control-surface
    /// changes to the graph and collects render-side events.
    ///
    /// A change can fire actions sourced from the parameter it sets; those
    /// are applied in further rounds of the same pass.
    pub fn update(&mut self) -> Vec<EngineEvent> {
        for _ in 0..MAX_PROPAGATION_ROUNDS {
            let changes = self.surface.drain_changes();
            if changes.is_empty() {
                break;
            }
            for change in changes {
                if let Err(e) = self.set_parameter(change.node, change.parameter, change.value) {
                    tracing::warn!(node = change.node, parameter = change.parameter, error = %e, "control change dropped");
                }
            }
        }
        self.graph.drain_events()
    }

    // ========================================================================
    // Projects
    // ========================================================================

    /// Captures the session as a project document.
    pub fn to_project(&self, name: &str) -> ProjectDocument {
        let mut document = ProjectDocument::new(name);
        document.graph = self.graph.to_document();
        document.control_surface = ControlSurfaceSection {
            actions: self.surface.actions(),
        };
        document.master_loop = self.loops.master_id();
        document
    }

    /// Replaces the session contents with a project document.
    ///
    /// The document is checked before the graph is touched. On failure the
    /// session is left as it was, live loop content included.
    pub fn apply_project(&mut self, document: &ProjectDocument) -> Result<(), ProjectError> {
        if !document.is_compatible() {
            return Err(ProjectError::IncompatibleVersion {
                found: document.version,
                expected: project::PROJECT_VERSION,
            });
        }
        if let Some(master) = document.master_loop {
            let is_loop = document
                .graph
                .nodes
                .iter()
                .find(|node| node.id == master)
                .is_some_and(|node| self.registry.is_loop_type(&node.type_id));
            if !is_loop {
                return Err(ProjectError::InvalidMasterLoop(master));
            }
        }

        self.graph.restore(&document.graph, &self.registry)?;
        self.register_loops();
        self.loops.set_master(document.master_loop)?;
        self.surface
            .set_actions(document.control_surface.actions.clone());
        tracing::info!(
            name = %document.name,
            nodes = self.graph.node_count(),
            "project loaded"
        );
        Ok(())
    }

    /// Rebuilds loop registrations from the graph. Clears the master.
    fn register_loops(&mut self) {
        self.loops.clear();
        let handles: Vec<_> = self.graph.loop_handles().collect();
        for (id, handle) in handles {
            self.loops.register(id, handle);
        }
    }

    pub fn save_project(&self, path: &Path, name: &str) -> Result<(), ProjectError> {
        project::save_to_file(&self.to_project(name), path)?;
        tracing::info!(path = %path.display(), "project saved");
        Ok(())
    }

    pub fn load_project(&mut self, path: &Path) -> Result<(), ProjectError> {
        let document = project::load_from_file(path)?;
        self.apply_project(&document)
    }

    /// Stops rendering and detaches every MIDI listener. Idempotent.
    pub fn shutdown(&mut self) {
        for id in self.listeners.drain(..).rev() {
            self.dispatcher.remove_listener(id);
        }
        if let Err(e) = self.graph.set_playing(false) {
            tracing::warn!(error = %e, "could not stop renderer");
        }
        self.loops.set_master(None).ok();
        self.graph.drain_events();
        tracing::debug!("session shut down");
    }
}
