//! Persistence module
//!
//! Project save/load using serde and JSON.

pub mod project;

pub use project::{
    load_from_file, save_to_file, ConnectionRecord, ControlSurfaceSection, GraphSection, NodeRecord,
    ProjectDocument, ProjectError, PROJECT_VERSION,
};
