//! Build sessions and per-session module validation.
//!
//! A session groups the compiler invocations of one build. The first time a
//! session asks for a module, the module's reported source hash is compared
//! with what the graph last saw; later requests in the same session trust
//! the earlier answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::daemon::connection::ConnectionId;
use crate::graph::{GraphStore, ModuleId, ModuleNode, ModuleState};
use crate::hash::ContentHash;

/// Identity of a build session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The external build-session marker, when the client sent one.
    pub fn from_marker(marker: Option<&str>) -> Option<Self> {
        marker
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(|m| Self(m.to_string()))
    }

    /// A single-use session for a registration without a marker. Every
    /// invocation validates its sources afresh.
    pub fn for_connection(conn: ConnectionId) -> Self {
        Self(format!("conn-{conn}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct BuildSession {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    validated: HashSet<ModuleId>,
}

impl BuildSession {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            validated: HashSet::new(),
        }
    }

    pub fn is_validated(&self, id: ModuleId) -> bool {
        self.validated.contains(&id)
    }

    pub fn validated_count(&self) -> usize {
        self.validated.len()
    }
}

/// What validation decided. The coordinator applies it to the scheduler
/// and the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Revalidation {
    /// Terminal modules whose source changed: rebuild without the cache.
    pub changed: Vec<ModuleId>,
    /// Modules that failed in an earlier session: try again.
    pub retry: Vec<ModuleId>,
    /// Built modules whose artifact is no longer available.
    pub missing: Vec<ModuleId>,
    /// Modules being built from a source that has since changed.
    pub requeue: Vec<ModuleId>,
    /// Modules whose cache entries describe an outdated source.
    pub invalidate: Vec<ModuleId>,
}

impl Revalidation {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
            && self.retry.is_empty()
            && self.missing.is_empty()
            && self.requeue.is_empty()
            && self.invalidate.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, BuildSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, id: &SessionId) -> &mut BuildSession {
        self.sessions
            .entry(id.clone())
            .or_insert_with(|| BuildSession::new(id.clone()))
    }

    pub fn get(&self, id: &SessionId) -> Option<&BuildSession> {
        self.sessions.get(id)
    }

    /// Forget a session. Returns whether it existed.
    pub fn invalidate(&mut self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Validate the modules a registration reported against the graph.
    ///
    /// Records the reported hashes on the nodes and marks each module
    /// validated for `session`. `artifact_live` tells whether a built
    /// module's artifact can still be used.
    pub fn validate(
        &mut self,
        session: &SessionId,
        graph: &mut GraphStore,
        reported: &[(ModuleId, ContentHash)],
        artifact_live: impl Fn(&ModuleNode) -> bool,
    ) -> Revalidation {
        let entry = self.get_or_create(session);
        let mut out = Revalidation::default();

        for &(id, hash) in reported {
            if !entry.validated.insert(id) {
                continue;
            }
            let node = graph.get_mut(id);
            node.session = Some(session.clone());

            if node.content_hash != hash {
                node.content_hash = hash;
                out.invalidate.push(id);
                match node.state {
                    ModuleState::Built | ModuleState::Failed => out.changed.push(id),
                    ModuleState::Building => out.requeue.push(id),
                    ModuleState::Pending | ModuleState::Ready => node.stale = true,
                }
                continue;
            }

            match node.state {
                ModuleState::Failed => {
                    let own = node.failure.as_ref().map_or(true, |f| f.root == id);
                    if own {
                        out.retry.push(id);
                    }
                }
                ModuleState::Built if !artifact_live(node) => out.missing.push(id),
                _ => {}
            }
        }
        out
    }
}
