//! Ordered set of ready modules.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use crate::graph::ModuleId;
use crate::hash::ContextHash;

/// Dispatch order of a ready module. Smaller keys go first: lower rank,
/// then higher fan-in, then the lexically smaller name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PriorityKey {
    pub rank: u64,
    pub fan_in: Reverse<usize>,
    pub name: String,
    pub context: ContextHash,
    pub id: ModuleId,
}

#[derive(Debug, Default)]
pub struct ReadyQueue {
    ordered: BTreeSet<PriorityKey>,
    keys: HashMap<ModuleId, PriorityKey>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or re-key a module.
    pub fn insert(&mut self, key: PriorityKey) {
        if let Some(old) = self.keys.insert(key.id, key.clone()) {
            self.ordered.remove(&old);
        }
        self.ordered.insert(key);
    }

    pub fn remove(&mut self, id: ModuleId) -> bool {
        match self.keys.remove(&id) {
            Some(key) => {
                self.ordered.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ModuleId) -> bool {
        self.keys.contains_key(&id)
    }

    pub fn peek(&self) -> Option<&PriorityKey> {
        self.ordered.first()
    }

    pub fn pop(&mut self) -> Option<PriorityKey> {
        let key = self.ordered.pop_first()?;
        self.keys.remove(&key.id);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Module ids in dispatch order.
    pub fn ids(&self) -> Vec<ModuleId> {
        self.ordered.iter().map(|k| k.id).collect()
    }
}
