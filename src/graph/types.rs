//! Graph data types: module ids, keys, states and nodes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use crate::cache::EntryKey;
use crate::hash::{ContentHash, ContextHash, TuId};
use crate::session::SessionId;

/// Index of a module in the graph's flat node table. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u32);

impl ModuleId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Module identity: logical name plus the compile context it was built in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleKey {
    pub name: String,
    pub context: ContextHash,
}

impl ModuleKey {
    pub fn new(name: impl Into<String>, context: ContextHash) -> Self {
        Self {
            name: name.into(),
            context,
        }
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.context)
    }
}

/// Build state of a module.
///
/// `Built` and `Failed` are terminal. Session revalidation can move a
/// terminal module back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// Waiting for at least one dependency to be built.
    Pending,
    /// All dependencies built; queued for a worker.
    Ready,
    /// Dispatched to exactly one worker.
    Building,
    Built,
    Failed,
}

impl ModuleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ModuleState::Built | ModuleState::Failed)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Pending => "pending",
            ModuleState::Ready => "ready",
            ModuleState::Building => "building",
            ModuleState::Built => "built",
            ModuleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where a module's interface lives and the command template used to build it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleOrigin {
    pub source: PathBuf,
    pub working_directory: PathBuf,
    pub command: Vec<String>,
}

/// The artifact a built module currently resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub path: PathBuf,
    /// Cache entry backing the artifact, `None` when it was not indexed.
    pub entry: Option<EntryKey>,
}

/// Why a module failed. `root` is the first failing module on its path,
/// which is the module itself for a compile failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFailure {
    pub root: ModuleId,
    pub message: String,
}

/// A module node. Edges are id lists into the same table.
#[derive(Debug, Clone)]
pub struct ModuleNode {
    pub key: ModuleKey,
    /// Direct dependencies.
    pub deps: Vec<ModuleId>,
    /// Reverse edges of `deps`.
    pub dependents: Vec<ModuleId>,
    /// Translation units that require this module directly or transitively.
    pub requesters: HashSet<TuId>,
    /// Longest path to a leaf, counted in nodes (a leaf has depth 1).
    pub depth: u32,
    /// Registration order of the first translation unit that requested it.
    pub rank: u64,
    pub state: ModuleState,
    /// A rebuild is required even if a cache entry matches.
    pub stale: bool,
    /// Discard the in-flight build result and queue again.
    pub requeue: bool,
    pub origin: ModuleOrigin,
    /// Hash of the module's interface source.
    pub content_hash: ContentHash,
    /// Cache key of the last dispatch: source, context and dependency keys.
    pub build_hash: Option<ContentHash>,
    pub artifact: Option<ArtifactRef>,
    pub failure: Option<ModuleFailure>,
    /// Session that most recently validated the module.
    pub session: Option<SessionId>,
}

impl ModuleNode {
    pub(crate) fn new(key: ModuleKey, rank: u64, origin: ModuleOrigin, content_hash: ContentHash) -> Self {
        Self {
            key,
            deps: Vec::new(),
            dependents: Vec::new(),
            requesters: HashSet::new(),
            depth: 1,
            rank,
            state: ModuleState::Pending,
            stale: false,
            requeue: false,
            origin,
            content_hash,
            build_hash: None,
            artifact: None,
            failure: None,
            session: None,
        }
    }

    /// Number of distinct translation units depending on this module.
    pub fn fan_in(&self) -> usize {
        self.requesters.len()
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }
}

/// Summary counts over the whole graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub modules: usize,
    pub edges: usize,
    pub pending: usize,
    pub ready: usize,
    pub building: usize,
    pub built: usize,
    pub failed: usize,
}
