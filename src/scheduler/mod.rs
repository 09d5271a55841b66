//! Build scheduling.
//!
//! The scheduler tracks, for every unfinished module, how many of its
//! dependencies are not yet built. A module whose count reaches zero enters
//! the ready queue; [`Scheduler::dequeue_next`] pops the best ready module
//! and marks it `Building` in one step. Callers hold the coordinator lock
//! around every method, which makes that step the single point where a
//! module is handed to a worker.

pub mod queue;

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

pub use queue::{PriorityKey, ReadyQueue};

use crate::config::SchedulingPolicy;
use crate::graph::{GraphStore, MergeOutcome, ModuleFailure, ModuleId, ModuleState};

#[derive(Debug)]
pub struct Scheduler {
    policy: SchedulingPolicy,
    ready: ReadyQueue,
    /// Unbuilt dependency count of every `Pending` module.
    waiting: HashMap<ModuleId, usize>,
    /// Non-terminal modules by rank.
    open: BTreeSet<(u64, ModuleId)>,
}

impl Scheduler {
    pub fn new(policy: SchedulingPolicy) -> Self {
        Self {
            policy,
            ready: ReadyQueue::new(),
            waiting: HashMap::new(),
            open: BTreeSet::new(),
        }
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Ready modules in dispatch order.
    pub fn ready_order(&self) -> Vec<ModuleId> {
        self.ready.ids()
    }

    /// Number of modules not yet `Built` or `Failed`.
    pub fn open_len(&self) -> usize {
        self.open.len()
    }

    fn key(&self, graph: &GraphStore, id: ModuleId) -> PriorityKey {
        let node = graph.get(id);
        PriorityKey {
            rank: match self.policy {
                SchedulingPolicy::FanIn => 0,
                SchedulingPolicy::TuAtATime => node.rank,
            },
            fan_in: Reverse(node.fan_in()),
            name: node.key.name.clone(),
            context: node.key.context,
            id,
        }
    }

    /// Take in the result of a merge: start tracking new modules, recount
    /// modules that gained dependencies and re-key fan-in changes.
    pub fn admit(&mut self, graph: &mut GraphStore, outcome: &MergeOutcome) {
        let mut touched = outcome.created.clone();
        touched.extend(outcome.rewired.iter().copied());
        self.propagate_rank(graph, &touched);

        let created: HashSet<ModuleId> = outcome.created.iter().copied().collect();
        for id in graph.closure(&outcome.created) {
            if created.contains(&id) {
                self.open.insert((graph.get(id).rank, id));
                self.settle(graph, id);
            }
        }
        for &id in &outcome.rewired {
            self.rewire(graph, id);
        }
        for &id in &outcome.fan_in_changed {
            self.reprioritize(graph, id);
        }
    }

    /// A module's rank never exceeds the rank of anything depending on it,
    /// so a translation unit's subgraph never waits on a later unit.
    fn propagate_rank(&mut self, graph: &mut GraphStore, starts: &[ModuleId]) {
        let mut stack = starts.to_vec();
        while let Some(id) = stack.pop() {
            let rank = graph.get(id).rank;
            let deps = graph.get(id).deps.clone();
            for dep in deps {
                let old = graph.get(dep).rank;
                if old <= rank {
                    continue;
                }
                graph.get_mut(dep).rank = rank;
                if self.open.remove(&(old, dep)) {
                    self.open.insert((rank, dep));
                }
                self.reprioritize(graph, dep);
                stack.push(dep);
            }
        }
    }

    fn rewire(&mut self, graph: &mut GraphStore, id: ModuleId) {
        let unbuilt = graph
            .get(id)
            .deps
            .iter()
            .any(|d| graph.get(*d).state != ModuleState::Built);
        match graph.get(id).state {
            ModuleState::Pending | ModuleState::Ready => self.settle(graph, id),
            ModuleState::Building if unbuilt => graph.get_mut(id).requeue = true,
            ModuleState::Built if unbuilt => {
                self.reset(graph, &[id], true);
            }
            _ => {}
        }
    }

    /// Re-key a queued module after its fan-in or rank changed.
    pub fn reprioritize(&mut self, graph: &GraphStore, id: ModuleId) {
        if self.ready.contains(id) {
            let key = self.key(graph, id);
            self.ready.insert(key);
        }
    }

    /// Recompute the readiness of a module that is neither terminal nor
    /// being built.
    fn settle(&mut self, graph: &mut GraphStore, id: ModuleId) {
        let node = graph.get(id);
        let mut unbuilt = 0;
        let mut failed = None;
        for &dep in &node.deps {
            let dep_node = graph.get(dep);
            match dep_node.state {
                ModuleState::Built => {}
                ModuleState::Failed => {
                    failed = Some(dep_node.failure.clone().unwrap_or(ModuleFailure {
                        root: dep,
                        message: format!("module {} failed", dep_node.name()),
                    }));
                    break;
                }
                _ => unbuilt += 1,
            }
        }

        if let Some(failure) = failed {
            self.fail_tree(graph, id, failure);
            return;
        }
        if unbuilt == 0 {
            self.waiting.remove(&id);
            graph.get_mut(id).state = ModuleState::Ready;
            let key = self.key(graph, id);
            self.ready.insert(key);
        } else {
            self.waiting.insert(id, unbuilt);
            graph.get_mut(id).state = ModuleState::Pending;
            self.ready.remove(id);
        }
    }

    /// Pop the highest-priority ready module and mark it `Building`.
    ///
    /// Under the one-unit-at-a-time policy nothing is dispatched while an
    /// earlier unit still has unfinished modules.
    pub fn dequeue_next(&mut self, graph: &mut GraphStore) -> Option<ModuleId> {
        let head = self.ready.peek()?;
        if self.policy == SchedulingPolicy::TuAtATime {
            let lowest = self.open.first().map(|(rank, _)| *rank)?;
            if head.rank > lowest {
                return None;
            }
        }
        let key = self.ready.pop()?;
        graph.get_mut(key.id).state = ModuleState::Building;
        debug!(module = %key.name, fan_in = key.fan_in.0, "dispatching");
        Some(key.id)
    }

    /// Mark a module built and promote dependents whose last unbuilt
    /// dependency it was. When the artifact was rebuilt rather than reused,
    /// every dependent must be rebuilt too.
    pub fn complete(&mut self, graph: &mut GraphStore, id: ModuleId, rebuilt: bool) -> Vec<ModuleId> {
        let node = graph.get_mut(id);
        let rank = node.rank;
        node.state = ModuleState::Built;
        node.stale = false;
        node.requeue = false;
        node.failure = None;
        self.open.remove(&(rank, id));
        self.waiting.remove(&id);
        self.ready.remove(id);

        let mut promoted = Vec::new();
        for dependent in graph.get(id).dependents.clone() {
            if rebuilt {
                graph.get_mut(dependent).stale = true;
            }
            if graph.get(dependent).state != ModuleState::Pending {
                continue;
            }
            let remaining = match self.waiting.get_mut(&dependent) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => {
                    self.settle(graph, dependent);
                    continue;
                }
            };
            if remaining == 0 {
                self.waiting.remove(&dependent);
                graph.get_mut(dependent).state = ModuleState::Ready;
                let key = self.key(graph, dependent);
                self.ready.insert(key);
                promoted.push(dependent);
            }
        }
        promoted
    }

    /// Mark a module failed and fail everything that depends on it.
    /// Returns every module that became `Failed`.
    pub fn fail(&mut self, graph: &mut GraphStore, id: ModuleId, message: impl Into<String>) -> Vec<ModuleId> {
        let failure = ModuleFailure {
            root: id,
            message: message.into(),
        };
        self.fail_tree(graph, id, failure)
    }

    fn fail_tree(&mut self, graph: &mut GraphStore, id: ModuleId, failure: ModuleFailure) -> Vec<ModuleId> {
        let mut failed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = graph.get_mut(current);
            match node.state {
                ModuleState::Failed if current != id => continue,
                // Finishes first; the discarded result is settled again.
                ModuleState::Building if current != id => {
                    node.requeue = true;
                    continue;
                }
                _ => {}
            }
            node.state = ModuleState::Failed;
            node.failure = Some(failure.clone());
            let rank = node.rank;
            self.open.remove(&(rank, current));
            self.waiting.remove(&current);
            self.ready.remove(current);
            failed.push(current);
            stack.extend(graph.get(current).dependents.iter().copied());
        }
        debug!(
            root = %graph.get(failure.root).key,
            failed = failed.len(),
            "failure propagated"
        );
        failed
    }

    /// Send `roots` and everything depending on them back for building.
    /// Modules currently being built are flagged so their result is
    /// discarded. With `stale`, the roots skip the cache.
    pub fn reset(&mut self, graph: &mut GraphStore, roots: &[ModuleId], stale: bool) -> Vec<ModuleId> {
        let closure = graph.dependents_closure(roots);
        let mut reopened = Vec::new();
        for &id in &closure {
            let node = graph.get_mut(id);
            if stale && roots.contains(&id) {
                node.stale = true;
            }
            match node.state {
                ModuleState::Building => {
                    node.requeue = true;
                    continue;
                }
                ModuleState::Built | ModuleState::Failed => {
                    node.state = ModuleState::Pending;
                    node.failure = None;
                    let rank = node.rank;
                    self.open.insert((rank, id));
                }
                ModuleState::Pending | ModuleState::Ready => {}
            }
            reopened.push(id);
        }
        for &id in &reopened {
            if matches!(graph.get(id).state, ModuleState::Pending | ModuleState::Ready) {
                self.settle(graph, id);
            }
        }
        debug!(roots = roots.len(), reopened = reopened.len(), "modules reset");
        reopened
    }

    /// Put a `Building` module whose result was discarded back in line.
    pub fn requeue(&mut self, graph: &mut GraphStore, id: ModuleId) {
        let node = graph.get_mut(id);
        node.requeue = false;
        node.state = ModuleState::Pending;
        self.settle(graph, id);
    }
}
