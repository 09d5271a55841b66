//! Project-wide module dependency graph.

pub mod store;
pub mod types;

pub use store::{GraphStore, MergeOutcome, MergeRequest};
pub use types::{
    ArtifactRef, GraphStats, ModuleFailure, ModuleId, ModuleKey, ModuleNode, ModuleOrigin,
    ModuleState,
};
