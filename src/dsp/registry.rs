//! Processor registry.
//!
//! A central catalog of processor types, keyed by type id. Project documents
//! store only the type id of each node; restoring a project asks the
//! registry to build a fresh processor for each id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::dsp::midi::DEFAULT_MIDI_BUFFER_CAPACITY;
use crate::engine::node::NodeProcessor;
use crate::modules::{
    audio_loop::{AudioLoopProcessor, DEFAULT_MAX_LOOP_SECONDS},
    feedback_delay::MidiFeedbackDelay,
    gain::Gain,
    io::GraphIoProcessor,
    loop_state::MasterLoop,
    midi_loop::{MidiLoopProcessor, DEFAULT_LOOP_EVENT_CAPACITY},
};

use super::processor::{Processor, ProcessorInfo};

/// Factory producing a fresh processor instance.
pub type ProcessorFactory = Box<dyn Fn() -> NodeProcessor + Send + Sync>;

/// Settings the built-in processors are constructed with.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BuiltinOptions {
    /// Channel count of graph audio I/O nodes, gains and audio loops.
    pub num_channels: usize,
    /// Event capacity of MIDI loops.
    pub loop_event_capacity: usize,
    /// Per-block MIDI buffer capacity of the graph the loops run in.
    pub midi_capacity: usize,
    /// Maximum audio loop duration in seconds.
    pub max_loop_seconds: f64,
}

impl Default for BuiltinOptions {
    fn default() -> Self {
        Self {
            num_channels: 2,
            loop_event_capacity: DEFAULT_LOOP_EVENT_CAPACITY,
            midi_capacity: DEFAULT_MIDI_BUFFER_CAPACITY,
            max_loop_seconds: DEFAULT_MAX_LOOP_SECONDS,
        }
    }
}

/// Central registry of available processor types.
///
/// # Example
///
/// ```ignore
/// let mut registry = ProcessorRegistry::new();
/// registry.register::<Gain>();
///
/// if let Some(gain) = registry.create("util.gain") {
///     graph.add_node(gain)?;
/// }
/// ```
pub struct ProcessorRegistry {
    factories: HashMap<&'static str, ProcessorFactory>,
    infos: Vec<ProcessorInfo>,
    /// Type ids whose instances are loop recorders.
    loop_types: HashSet<&'static str>,
}

impl ProcessorRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            infos: Vec::new(),
            loop_types: HashSet::new(),
        }
    }

    /// Creates a registry holding every built-in processor.
    ///
    /// Loop recorders created through it follow `master` for auto-closing
    /// cued recordings.
    pub fn with_builtins(options: BuiltinOptions, master: Arc<MasterLoop>) -> Self {
        let mut registry = Self::new();
        let channels = options.num_channels;

        registry.register_with(move || boxed(Gain::new(channels)));
        registry.register_with(move || boxed(GraphIoProcessor::audio_input(channels)));
        registry.register_with(move || boxed(GraphIoProcessor::audio_output(channels)));
        registry.register_with(|| boxed(GraphIoProcessor::midi_input()));
        registry.register_with(|| boxed(GraphIoProcessor::midi_output()));
        registry.register::<MidiFeedbackDelay>();

        let midi_master = Arc::clone(&master);
        registry.register_with(move || {
            MidiLoopProcessor::new(options.loop_event_capacity, Arc::clone(&midi_master))
                .with_midi_capacity(options.midi_capacity)
                .into()
        });
        registry.register_with(move || {
            AudioLoopProcessor::new(channels, options.max_loop_seconds, Arc::clone(&master)).into()
        });

        registry
    }

    /// Registers a processor type built with `Default`.
    ///
    /// # Panics
    ///
    /// Panics if a processor with the same type id is already registered.
    pub fn register<P: Processor + Default>(&mut self) {
        self.register_with(|| boxed(P::default()));
    }

    /// Registers a processor type built by `factory`.
    ///
    /// The factory is called once to read the type's info and whether it
    /// builds a loop recorder.
    ///
    /// # Panics
    ///
    /// Panics if a processor with the same type id is already registered.
    pub fn register_with<F>(&mut self, factory: F)
    where
        F: Fn() -> NodeProcessor + Send + Sync + 'static,
    {
        let sample = factory();
        let info = sample.as_processor().info().clone();
        let id = info.type_id;

        if self.factories.contains_key(id) {
            panic!("Processor '{}' is already registered", id);
        }
        if sample.loop_handle().is_some() {
            self.loop_types.insert(id);
        }

        self.factories.insert(id, Box::new(factory));
        self.infos.push(info);
    }

    /// Creates a new instance of a processor by its type id.
    ///
    /// Returns `None` if no processor with the given id is registered.
    pub fn create(&self, type_id: &str) -> Option<NodeProcessor> {
        self.factories.get(type_id).map(|factory| factory())
    }

    /// Returns every registered processor type, in registration order.
    pub fn list(&self) -> &[ProcessorInfo] {
        &self.infos
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.factories.contains_key(type_id)
    }

    /// Returns true if processors of this type are loop recorders.
    pub fn is_loop_type(&self, type_id: &str) -> bool {
        self.loop_types.contains(type_id)
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn boxed<P: Processor>(processor: P) -> NodeProcessor {
    NodeProcessor::Plugin(Box::new(processor))
}
