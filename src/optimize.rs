//! Graph rewrites applied before execution.
//!
//! The optimizer is a plain list of [`Pass`]es. It knows nothing about any
//! particular backend: backends hand in their passes through [`Backend`],
//! typically a [`BatchFusion`] configured with their rewrite rules.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::core::Key;
use crate::error::GraphError;
use crate::graph::TaskGraph;
use crate::node::{Arg, Call, Task};
use crate::op::{Op, OpId, ReceiverId};
use crate::value::Value;

/// A graph rewrite.
///
/// A pass may rename internal entries, but every key present before the pass
/// must still resolve to the same value afterwards.
pub trait Pass: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: TaskGraph) -> Result<TaskGraph, GraphError>;
}

/// Something that contributes optimizations, usually a remote-call wrapper.
pub trait Backend {
    fn optimizations(&self) -> Vec<Arc<dyn Pass>> {
        Vec::new()
    }
}

#[derive(Clone, Default)]
pub struct Optimizer {
    passes: Vec<Arc<dyn Pass>>,
}

impl Optimizer {
    pub fn new(passes: Vec<Arc<dyn Pass>>) -> Self {
        Self { passes }
    }

    pub fn with(mut self, pass: impl Pass + 'static) -> Self {
        self.passes.push(Arc::new(pass));
        self
    }

    pub fn register(&mut self, pass: Arc<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Collects the optimizations of every backend, in order.
    pub fn from_backends<'a>(backends: impl IntoIterator<Item = &'a dyn Backend>) -> Self {
        Self {
            passes: backends.into_iter().flat_map(|backend| backend.optimizations()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Runs every pass in registration order.
    pub fn apply(&self, mut graph: TaskGraph) -> Result<TaskGraph, GraphError> {
        for pass in &self.passes {
            let before = graph.len();
            graph = pass.apply(graph)?;
            tracing::debug!(pass = pass.name(), before, after = graph.len(), "applied optimization");
        }

        Ok(graph)
    }
}

impl fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.passes.iter().map(|pass| pass.name())).finish()
    }
}

/// Merges independent calls to a batchable operation into one batched call.
///
/// Only calls without dependencies are considered, and only calls that take
/// exactly one positional argument. Calls are grouped by operation and by
/// receiver identity; each group of two or more becomes one call to the
/// batched operation with the list of arguments, and every original key is
/// rewritten to pick its element out of the batched result.
#[derive(Clone, Default)]
pub struct BatchFusion {
    rules: HashMap<OpId, Op>,
}

impl BatchFusion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls to `single` may be fused into one call to `batched`, which gets
    /// the list of arguments as its only positional argument and must return
    /// a list of results in the same order.
    pub fn rule(mut self, single: &Op, batched: &Op) -> Self {
        self.rules.insert(single.id().clone(), batched.clone());
        self
    }
}

type Group = (OpId, Option<ReceiverId>);

impl Pass for BatchFusion {
    fn name(&self) -> &str {
        "batch-fusion"
    }

    fn apply(&self, mut graph: TaskGraph) -> Result<TaskGraph, GraphError> {
        let mut groups: Vec<(Group, Vec<(Key, Value)>)> = Vec::new();
        let mut lookup: HashMap<Group, usize> = HashMap::new();

        for (key, task) in graph.iter() {
            let Task::Call(call) = task else {
                continue;
            };

            if !self.rules.contains_key(&call.op) || !call.kwargs.is_empty() {
                continue;
            }

            // a single literal argument also means no dependencies
            let [Arg::Value(arg)] = call.args.as_slice() else {
                continue;
            };

            let group = (call.op.clone(), call.receiver);
            let slot = *lookup.entry(group.clone()).or_insert_with(|| {
                groups.push((group, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push((key.clone(), arg.clone()));
        }

        for ((op, receiver), members) in groups {
            if members.len() <= 1 {
                continue;
            }

            let batched = &self.rules[&op];

            // keys and arguments come out of the same list, so position i of
            // the batch is always the i-th member
            let (keys, args): (Vec<Key>, Vec<Value>) = members.into_iter().unzip();

            let call = Call {
                op: batched.id().clone(),
                receiver,
                args: vec![Arg::Value(Value::List(args))],
                kwargs: BTreeMap::new(),
            };
            let source = Key::derive("fuse-batch", &call);

            tracing::debug!(op = %op, batched = %batched.id(), size = keys.len(), key = %source, "fused batch");

            graph.registry_mut().register(batched);
            for (index, key) in keys.into_iter().enumerate() {
                graph.insert(
                    key,
                    Task::GetItem {
                        source: source.clone(),
                        index,
                    },
                );
            }
            graph.insert(source, Task::Call(call));
        }

        Ok(graph)
    }
}
