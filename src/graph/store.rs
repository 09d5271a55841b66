//! Project-wide module dependency graph.
//!
//! Nodes live in a flat table indexed by [`ModuleId`]; edges are id lists.
//! The store itself is not synchronized: the coordinator owns it behind a
//! single lock, so a merge is one atomic step for every observer.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use tracing::debug;

use super::types::{GraphStats, ModuleId, ModuleKey, ModuleNode, ModuleOrigin, ModuleState};
use crate::error::{DaemonError, Result};
use crate::hash::{ContentHash, ContextHash, TuId};
use crate::toolchain::ScanResult;

/// Everything a merge needs from the registering translation unit.
#[derive(Debug, Clone, Copy)]
pub struct MergeRequest<'a> {
    pub tu: TuId,
    /// Registration order of the translation unit.
    pub rank: u64,
    pub context: ContextHash,
    pub working_directory: &'a Path,
    pub command: &'a [String],
    pub scan: &'a ScanResult,
}

/// What a merge changed.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// The translation unit's direct requirements, in request order.
    pub required: Vec<ModuleId>,
    /// Nodes created by this merge.
    pub created: Vec<ModuleId>,
    /// Pre-existing nodes that gained dependencies.
    pub rewired: Vec<ModuleId>,
    /// Nodes whose fan-in grew.
    pub fan_in_changed: Vec<ModuleId>,
    /// Source hashes reported by the scan.
    pub reported: Vec<(ModuleId, ContentHash)>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// The dependency graph store.
#[derive(Debug, Default)]
pub struct GraphStore {
    nodes: Vec<ModuleNode>,
    index: HashMap<ModuleKey, ModuleId>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// # Panics
    /// Ids are only handed out by this store, so an unknown id is a bug.
    pub fn get(&self, id: ModuleId) -> &ModuleNode {
        &self.nodes[id.index()]
    }

    pub fn get_mut(&mut self, id: ModuleId) -> &mut ModuleNode {
        &mut self.nodes[id.index()]
    }

    pub fn lookup(&self, key: &ModuleKey) -> Option<ModuleId> {
        self.index.get(key).copied()
    }

    /// All modules with the given logical name, in any context.
    pub fn find_by_name(&self, name: &str) -> Vec<ModuleId> {
        self.ids().filter(|id| self.get(*id).name() == name).collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = ModuleId> + '_ {
        (0..self.nodes.len() as u32).map(ModuleId)
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.deps.len()).sum()
    }

    /// Merge one translation unit's scan result.
    ///
    /// Either every edge of the scan is inserted or, when the scan is
    /// inconsistent or would close a cycle, nothing changes at all.
    pub fn merge(&mut self, req: MergeRequest<'_>) -> Result<MergeOutcome> {
        let scanned: BTreeMap<&str, _> = req
            .scan
            .modules
            .iter()
            .map(|m| (m.name.as_str(), m))
            .collect();

        let mentioned = req
            .scan
            .requires
            .iter()
            .chain(scanned.values().flat_map(|m| m.requires.iter()));
        for name in mentioned {
            if !scanned.contains_key(name.as_str())
                && self.lookup(&ModuleKey::new(name.as_str(), req.context)).is_none()
            {
                return Err(DaemonError::ScanFailure {
                    tu: req.tu.to_string(),
                    reason: format!("module '{name}' is required but no source provides it"),
                });
            }
        }

        // Edges not yet in the graph, keyed by the depending module's name.
        let mut staged: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for module in scanned.values() {
            let existing = self.dep_names(&ModuleKey::new(module.name.as_str(), req.context));
            for dep in &module.requires {
                if !existing.contains(dep.as_str()) {
                    let edges = staged.entry(module.name.clone()).or_default();
                    if !edges.contains(dep) {
                        edges.push(dep.clone());
                    }
                }
            }
        }

        if let Some(cycle) = self.find_cycle(req.context, &staged) {
            return Err(DaemonError::CycleDetected { cycle });
        }

        let mut outcome = MergeOutcome::default();
        for module in scanned.values() {
            let key = ModuleKey::new(module.name.as_str(), req.context);
            if self.lookup(&key).is_none() {
                let origin = ModuleOrigin {
                    source: module.source.clone(),
                    working_directory: req.working_directory.to_path_buf(),
                    command: req.command.to_vec(),
                };
                let id = self.insert_node(ModuleNode::new(key, req.rank, origin, module.content_hash));
                outcome.created.push(id);
            }
        }

        let created: HashSet<ModuleId> = outcome.created.iter().copied().collect();
        for (from, deps) in &staged {
            let from_id = self.require_id(from, req.context)?;
            for dep in deps {
                let dep_id = self.require_id(dep, req.context)?;
                self.nodes[from_id.index()].deps.push(dep_id);
                self.nodes[dep_id.index()].dependents.push(from_id);
            }
            if !created.contains(&from_id) {
                outcome.rewired.push(from_id);
            }
        }

        let mut touched = outcome.created.clone();
        touched.extend(outcome.rewired.iter().copied());
        self.recompute_depths(&touched);

        let mut required = Vec::new();
        for name in &req.scan.requires {
            let id = self.require_id(name, req.context)?;
            if !required.contains(&id) {
                required.push(id);
            }
        }

        let mut fan_in_changed = BTreeSet::new();
        self.add_requester(req.tu, &required, &mut fan_in_changed);
        for &id in &outcome.rewired {
            let requesters: Vec<TuId> = self.get(id).requesters.iter().copied().collect();
            let deps = self.get(id).deps.clone();
            for tu in requesters {
                self.add_requester(tu, &deps, &mut fan_in_changed);
            }
        }

        outcome.required = required;
        outcome.fan_in_changed = fan_in_changed.into_iter().collect();
        for module in scanned.values() {
            let id = self.require_id(&module.name, req.context)?;
            outcome.reported.push((id, module.content_hash));
        }

        debug!(
            tu = %req.tu,
            created = outcome.created.len(),
            rewired = outcome.rewired.len(),
            fan_in_changed = outcome.fan_in_changed.len(),
            "scan merged"
        );
        Ok(outcome)
    }

    /// Transitive dependencies of `roots`, roots included, dependencies
    /// before dependents.
    pub fn closure(&self, roots: &[ModuleId]) -> Vec<ModuleId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        for &root in roots {
            self.post_order(root, &mut seen, &mut order);
        }
        order
    }

    /// `root` plus every module that transitively depends on it.
    pub fn dependents_closure(&self, roots: &[ModuleId]) -> Vec<ModuleId> {
        let mut seen: HashSet<ModuleId> = HashSet::new();
        let mut order = Vec::new();
        let mut stack: Vec<ModuleId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);
            stack.extend(self.get(id).dependents.iter().copied());
        }
        order
    }

    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            modules: self.nodes.len(),
            edges: self.edge_count(),
            ..GraphStats::default()
        };
        for node in &self.nodes {
            match node.state {
                ModuleState::Pending => stats.pending += 1,
                ModuleState::Ready => stats.ready += 1,
                ModuleState::Building => stats.building += 1,
                ModuleState::Built => stats.built += 1,
                ModuleState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    fn insert_node(&mut self, node: ModuleNode) -> ModuleId {
        let id = ModuleId(self.nodes.len() as u32);
        self.index.insert(node.key.clone(), id);
        self.nodes.push(node);
        id
    }

    fn require_id(&self, name: &str, context: ContextHash) -> Result<ModuleId> {
        self.lookup(&ModuleKey::new(name, context))
            .ok_or_else(|| DaemonError::ScanFailure {
                tu: String::new(),
                reason: format!("module '{name}' vanished during merge"),
            })
    }

    fn dep_names(&self, key: &ModuleKey) -> HashSet<&str> {
        match self.lookup(key) {
            Some(id) => self
                .get(id)
                .deps
                .iter()
                .map(|d| self.get(*d).name())
                .collect(),
            None => HashSet::new(),
        }
    }

    fn successors(&self, name: &str, context: ContextHash, staged: &BTreeMap<String, Vec<String>>) -> Vec<String> {
        let mut out: Vec<String> = self
            .dep_names(&ModuleKey::new(name, context))
            .into_iter()
            .map(str::to_string)
            .collect();
        if let Some(extra) = staged.get(name) {
            out.extend(extra.iter().cloned());
        }
        out
    }

    /// Depth-first search over the existing graph plus the staged edges.
    /// The existing graph is acyclic, so any cycle runs through a staged
    /// edge and is reachable from a staged source.
    fn find_cycle(&self, context: ContextHash, staged: &BTreeMap<String, Vec<String>>) -> Option<Vec<String>> {
        let mut marks: HashMap<String, Mark> = HashMap::new();
        let mut path: Vec<String> = Vec::new();
        for start in staged.keys() {
            if let Some(cycle) = self.visit(start, context, staged, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit(
        &self,
        name: &str,
        context: ContextHash,
        staged: &BTreeMap<String, Vec<String>>,
        marks: &mut HashMap<String, Mark>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::InProgress) => {
                let start = path.iter().position(|n| n == name).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(name.to_string());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(name.to_string(), Mark::InProgress);
        path.push(name.to_string());
        for next in self.successors(name, context, staged) {
            if let Some(cycle) = self.visit(&next, context, staged, marks, path) {
                return Some(cycle);
            }
        }
        path.pop();
        marks.insert(name.to_string(), Mark::Done);
        None
    }

    /// Settle the depth of every touched node from its dependencies, then
    /// push increases up through dependents.
    fn recompute_depths(&mut self, touched: &[ModuleId]) {
        let dirty: HashSet<ModuleId> = touched.iter().copied().collect();
        let mut settled = HashSet::new();
        for &id in touched {
            self.settle_depth(id, &dirty, &mut settled);
        }

        let mut work: Vec<ModuleId> = touched.to_vec();
        while let Some(id) = work.pop() {
            let depth = self.get(id).depth;
            let dependents = self.get(id).dependents.clone();
            for parent in dependents {
                let node = self.get_mut(parent);
                if node.depth < depth + 1 {
                    node.depth = depth + 1;
                    work.push(parent);
                }
            }
        }
    }

    fn settle_depth(&mut self, id: ModuleId, dirty: &HashSet<ModuleId>, settled: &mut HashSet<ModuleId>) -> u32 {
        if !dirty.contains(&id) || !settled.insert(id) {
            return self.get(id).depth;
        }
        let deps = self.get(id).deps.clone();
        let mut depth = 1;
        for dep in deps {
            depth = depth.max(self.settle_depth(dep, dirty, settled) + 1);
        }
        self.get_mut(id).depth = depth;
        depth
    }

    /// Record `tu` as a requester of `starts` and everything below them.
    /// Requesters of a node are always a subset of its dependencies'
    /// requesters, so the walk stops at nodes that already know `tu`.
    fn add_requester(&mut self, tu: TuId, starts: &[ModuleId], changed: &mut BTreeSet<ModuleId>) {
        let mut stack: Vec<ModuleId> = starts.to_vec();
        while let Some(id) = stack.pop() {
            let node = self.get_mut(id);
            if node.requesters.insert(tu) {
                changed.insert(id);
                stack.extend(node.deps.iter().copied());
            }
        }
    }

    fn post_order(&self, id: ModuleId, seen: &mut HashSet<ModuleId>, order: &mut Vec<ModuleId>) {
        if !seen.insert(id) {
            return;
        }
        for &dep in &self.get(id).deps {
            self.post_order(dep, seen, order);
        }
        order.push(id);
    }
}
