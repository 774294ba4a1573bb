//! Project document serialization.
//!
//! A project captures everything needed to rebuild a session: the graph
//! (nodes with their processor type, parameters and opaque state, plus
//! connections), the control surface actions, and which loop is the master.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::action::ControlAction;
use crate::engine::{commands::ChannelIndex, commands::NodeId, graph::GraphError};

/// Current project format version.
/// Increment this when making breaking changes to the format.
pub const PROJECT_VERSION: u32 = 1;

/// A complete project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDocument {
    /// Human-readable name for the project.
    pub name: String,
    /// Format version for future compatibility.
    pub version: u32,
    pub graph: GraphSection,
    #[serde(default)]
    pub control_surface: ControlSurfaceSection,
    /// Node id of the master loop, if one is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_loop: Option<NodeId>,
}

impl ProjectDocument {
    /// Create a new empty project with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: PROJECT_VERSION,
            graph: GraphSection::default(),
            control_surface: ControlSurfaceSection::default(),
            master_loop: None,
        }
    }

    /// Check if this document version is compatible with the current format.
    pub fn is_compatible(&self) -> bool {
        self.version <= PROJECT_VERSION
    }
}

impl Default for ProjectDocument {
    fn default() -> Self {
        Self::new("Untitled")
    }
}

/// Nodes and connections of a graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSection {
    pub nodes: Vec<NodeRecord>,
    pub connections: Vec<ConnectionRecord>,
}

/// One node of a saved graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    /// Processor type id; must match a registered processor.
    pub type_id: String,
    /// Normalized parameter values, by index.
    #[serde(default)]
    pub parameters: Vec<f32>,
    /// Opaque processor state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Vec<u8>>,
}

/// One connection of a saved graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionRecord {
    Audio {
        source: NodeId,
        source_channel: ChannelIndex,
        dest: NodeId,
        dest_channel: ChannelIndex,
    },
    Midi {
        source: NodeId,
        dest: NodeId,
    },
}

/// Saved control surface mappings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlSurfaceSection {
    pub actions: Vec<ControlAction>,
}

/// Error type for project operations.
#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("incompatible project version: found {found}, expected <= {expected}")]
    IncompatibleVersion { found: u32, expected: u32 },

    #[error("master loop {0} is not a loop in the project")]
    InvalidMasterLoop(NodeId),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Save a project to a JSON file.
pub fn save_to_file(document: &ProjectDocument, path: &Path) -> Result<(), ProjectError> {
    let json = serde_json::to_string_pretty(document)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Load a project from a JSON file.
pub fn load_from_file(path: &Path) -> Result<ProjectDocument, ProjectError> {
    let json = std::fs::read_to_string(path)?;
    let document: ProjectDocument = serde_json::from_str(&json)?;

    if !document.is_compatible() {
        return Err(ProjectError::IncompatibleVersion {
            found: document.version,
            expected: PROJECT_VERSION,
        });
    }

    Ok(document)
}
