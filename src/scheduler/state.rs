use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};

use crate::core::Key;
use crate::graph::TaskGraph;
use crate::value::Value;

/// Where a key is in its lifecycle during one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Waiting,
    Ready,
    Running,
    Done,
}

/// Bookkeeping of a single run, owned by the control loop.
///
/// Every key of the graph is in exactly one of `waiting`, `ready`, `running`
/// or the cache. Keys only move forward through these sets.
#[derive(Debug)]
pub struct ExecutionState {
    /// Waiting keys with the number of dependencies not yet in the cache.
    waiting: HashMap<Key, usize>,
    ready: BinaryHeap<Reverse<(usize, Key)>>,
    ready_keys: HashSet<Key>,
    running: HashSet<Key>,
    cache: HashMap<Key, Value>,
    dependencies: HashMap<Key, BTreeSet<Key>>,
    dependents: HashMap<Key, BTreeSet<Key>>,
    priority: HashMap<Key, usize>,
}

impl ExecutionState {
    /// `priority` ranks keys for dispatch, lower first. Keys without a rank go
    /// last.
    pub(crate) fn new(graph: &TaskGraph, priority: HashMap<Key, usize>) -> Self {
        let dependencies = graph.dependencies();
        let dependents = graph.dependents();

        let mut state = Self {
            waiting: HashMap::new(),
            ready: BinaryHeap::new(),
            ready_keys: HashSet::new(),
            running: HashSet::new(),
            cache: HashMap::with_capacity(graph.len()),
            dependencies,
            dependents,
            priority,
        };

        for key in graph.keys() {
            match state.dependencies[key].len() {
                0 => state.push_ready(key.clone()),
                n => {
                    state.waiting.insert(key.clone(), n);
                }
            }
        }

        state
    }

    fn push_ready(&mut self, key: Key) {
        let rank = self.priority.get(&key).copied().unwrap_or(usize::MAX);
        self.ready_keys.insert(key.clone());
        self.ready.push(Reverse((rank, key)));
    }

    /// Moves the highest priority ready key to `running`.
    pub(crate) fn pop_ready(&mut self) -> Option<Key> {
        let Reverse((_, key)) = self.ready.pop()?;
        self.ready_keys.remove(&key);
        self.running.insert(key.clone());
        Some(key)
    }

    /// Stores the value of a finished key and returns the keys that became
    /// ready because of it.
    pub(crate) fn finish(&mut self, key: Key, value: Value) -> Vec<Key> {
        self.running.remove(&key);
        debug_assert!(!self.cache.contains_key(&key), "cache entries are written once");
        self.cache.insert(key.clone(), value);

        let mut unlocked = Vec::new();
        for dependent in self.dependents.get(&key).into_iter().flatten() {
            if let Some(remaining) = self.waiting.get_mut(dependent) {
                *remaining -= 1;
                if *remaining == 0 {
                    unlocked.push(dependent.clone());
                }
            }
        }

        for key in &unlocked {
            self.waiting.remove(key);
            self.push_ready(key.clone());
        }

        unlocked
    }

    /// Values of the dependencies of `key`, all of which must be done.
    pub(crate) fn dependency_values(&self, key: &Key) -> BTreeMap<Key, Value> {
        self.dependencies
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|dependency| Some((dependency.clone(), self.cache.get(dependency)?.clone())))
            .collect()
    }

    pub fn state_of(&self, key: &Key) -> Option<KeyState> {
        if self.cache.contains_key(key) {
            Some(KeyState::Done)
        } else if self.running.contains(key) {
            Some(KeyState::Running)
        } else if self.ready_keys.contains(key) {
            Some(KeyState::Ready)
        } else if self.waiting.contains_key(key) {
            Some(KeyState::Waiting)
        } else {
            None
        }
    }

    pub fn waiting(&self) -> impl Iterator<Item = &Key> {
        self.waiting.keys()
    }

    pub fn ready(&self) -> impl Iterator<Item = &Key> {
        self.ready_keys.iter()
    }

    pub fn running(&self) -> impl Iterator<Item = &Key> {
        self.running.iter()
    }

    pub fn cache(&self) -> &HashMap<Key, Value> {
        &self.cache
    }

    pub fn ready_len(&self) -> usize {
        self.ready_keys.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Number of keys in the run.
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.waiting.is_empty() && self.ready_keys.is_empty() && self.running.is_empty()
    }

    /// Work remains but nothing can make progress.
    pub fn is_stalled(&self) -> bool {
        !self.waiting.is_empty() && self.ready_keys.is_empty() && self.running.is_empty()
    }

    /// Whether the four lifecycle sets split the key set with no overlap.
    pub fn is_partition(&self) -> bool {
        let sizes = self.waiting.len() + self.ready_keys.len() + self.running.len() + self.cache.len();

        sizes == self.len()
            && self.dependencies.keys().all(|key| {
                let memberships = [
                    self.waiting.contains_key(key),
                    self.ready_keys.contains(key),
                    self.running.contains(key),
                    self.cache.contains_key(key),
                ];
                memberships.into_iter().filter(|&member| member).count() == 1
            })
    }
}
