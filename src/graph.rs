use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::{self, Write};

use camino::Utf8Path;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::core::Key;
use crate::error::{ComputeError, GraphError};
use crate::node::{Input, Node, Task};
use crate::op::Registry;
use crate::value::Value;

/// A map from keys to task descriptors.
///
/// Entries keep the order they were inserted in, which for a collected graph
/// is a valid dependency order. Besides the entries the graph owns the
/// [`Registry`] needed to run them.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    entries: HashMap<Key, Task>,
    order: Vec<Key>,
    registry: Registry,
}

/// The result of [`TaskGraph::collect`].
#[derive(Debug)]
pub struct Collected {
    pub graph: TaskGraph,
    /// Distinct top-level nodes, in the order they were first seen.
    pub roots: Vec<Node>,
    pub repack: Repack,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walks the nodes reachable from `inputs` and gathers them into a graph.
    /// A node reached along several paths is stored once.
    pub fn collect<I: Into<Input>>(inputs: impl IntoIterator<Item = I>) -> Collected {
        let inputs: Vec<Input> = inputs.into_iter().map(Into::into).collect();

        let mut roots = Vec::new();
        let mut slots = HashMap::new();
        let shapes = inputs
            .iter()
            .map(|input| Shape::of(input, &mut roots, &mut slots))
            .collect();

        let mut graph = TaskGraph::new();
        let mut seen = HashSet::new();

        // iterative post-order, so dependencies land before their dependents
        for root in &roots {
            let mut stack: Vec<(&Node, bool)> = vec![(root, false)];

            while let Some((node, expanded)) = stack.pop() {
                if expanded {
                    if let Some(op) = node.op() {
                        graph.registry.register(op);
                    }
                    graph.insert(node.key().clone(), node.task().clone());
                    continue;
                }

                if !seen.insert(node.key().clone()) {
                    continue;
                }

                stack.push((node, true));
                for child in node.children().iter().rev() {
                    if !seen.contains(child.key()) {
                        stack.push((child, false));
                    }
                }
            }
        }

        tracing::debug!(entries = graph.len(), roots = roots.len(), "collected task graph");

        let keys = roots.iter().map(|root| root.key().clone()).collect();

        Collected {
            graph,
            roots,
            repack: Repack { shapes, keys },
        }
    }

    pub fn get(&self, key: &Key) -> Option<&Task> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts or replaces an entry. Replacing keeps the original position.
    pub fn insert(&mut self, key: Key, task: Task) -> Option<Task> {
        let previous = self.entries.insert(key.clone(), task);
        if previous.is_none() {
            self.order.push(key);
        }
        previous
    }

    pub fn remove(&mut self, key: &Key) -> Option<Task> {
        let removed = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(removed)
    }

    /// Keeps only the entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&Key, &Task) -> bool) {
        let entries = &mut self.entries;
        self.order.retain(|key| {
            let kept = keep(key, &entries[key]);
            if !kept {
                entries.remove(key);
            }
            kept
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Task)> {
        self.order.iter().map(|key| (key, &self.entries[key]))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.order.iter()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn dependencies_of(&self, key: &Key) -> Option<BTreeSet<Key>> {
        self.entries.get(key).map(Task::dependencies)
    }

    /// Dependency sets of every entry.
    pub fn dependencies(&self) -> HashMap<Key, BTreeSet<Key>> {
        self.iter()
            .map(|(key, task)| (key.clone(), task.dependencies()))
            .collect()
    }

    /// For every entry, the entries that reference it.
    pub fn dependents(&self) -> HashMap<Key, BTreeSet<Key>> {
        let mut dependents: HashMap<Key, BTreeSet<Key>> =
            self.keys().map(|key| (key.clone(), BTreeSet::new())).collect();

        for (key, task) in self.iter() {
            for dependency in task.dependencies() {
                dependents.entry(dependency).or_default().insert(key.clone());
            }
        }

        dependents
    }

    fn to_petgraph(&self) -> Result<(DiGraph<Key, ()>, HashMap<Key, NodeIndex>), GraphError> {
        let mut graph = DiGraph::with_capacity(self.len(), self.len());
        let mut index = HashMap::with_capacity(self.len());

        for key in self.keys() {
            index.insert(key.clone(), graph.add_node(key.clone()));
        }

        for (key, task) in self.iter() {
            for dependency in task.dependencies() {
                let source = index
                    .get(&dependency)
                    .ok_or_else(|| GraphError::MissingDependency {
                        key: key.clone(),
                        dependency: dependency.clone(),
                    })?;
                graph.add_edge(*source, index[key], ());
            }
        }

        Ok((graph, index))
    }

    /// Checks that every reference resolves, that there are no cycles, and
    /// that every called operation is registered.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.topological_order()?;

        for (_, task) in self.iter() {
            let mut calls = vec![task];
            while let Some(task) = calls.pop() {
                match task {
                    Task::Call(call) => {
                        self.registry.resolve(call)?;
                    }
                    Task::Chain(links) => calls.extend(links.iter().map(|(_, link)| link)),
                    Task::Literal(_) | Task::GetItem { .. } => {}
                }
            }
        }

        Ok(())
    }

    /// A dependency-respecting ordering of all keys.
    pub fn topological_order(&self) -> Result<Vec<Key>, GraphError> {
        let (graph, _) = self.to_petgraph()?;

        let sorted = petgraph::algo::toposort(&graph, None)
            .map_err(|cycle| GraphError::Cycle(graph[cycle.node_id()].clone()))?;

        Ok(sorted.into_iter().map(|index| graph[index].clone()).collect())
    }

    /// Rank of every key for breaking ties between ready tasks, lower first.
    ///
    /// Keys on the longest remaining path run first, then keys that unblock
    /// more dependents, then the topological position.
    pub fn priority_hint(&self) -> Result<HashMap<Key, usize>, GraphError> {
        let order = self.topological_order()?;
        let dependents = self.dependents();

        let mut height: HashMap<&Key, usize> = HashMap::with_capacity(order.len());
        for key in order.iter().rev() {
            let below = dependents[key]
                .iter()
                .map(|dependent| height[dependent])
                .max()
                .unwrap_or(0);
            height.insert(key, below + 1);
        }

        let mut ranked: Vec<(usize, &Key)> = order.iter().enumerate().collect();
        ranked.sort_by_key(|&(position, key)| (Reverse(height[key]), Reverse(dependents[key].len()), position));

        Ok(ranked
            .into_iter()
            .enumerate()
            .map(|(rank, (_, key))| (key.clone(), rank))
            .collect())
    }

    /// Renders the graph as a Mermaid flowchart.
    pub fn to_mermaid(&self) -> String {
        let mut f = String::new();
        // writing into a String cannot fail
        let _ = self.write_mermaid(&mut f);
        f
    }

    fn write_mermaid(&self, f: &mut impl Write) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let index: HashMap<&Key, usize> = self.keys().enumerate().map(|(i, key)| (key, i)).collect();

        for (i, (key, task)) in self.iter().enumerate() {
            let name = task.label().replace('"', "\\\"");
            let key = key.as_str().replace('"', "\\\"");
            writeln!(f, "    {i}[\"{name}\\n{key}\"]")?;
        }

        for (key, task) in self.iter() {
            for dependency in task.dependencies() {
                if let Some(source) = index.get(&dependency) {
                    writeln!(f, "    {source} --> {}", index[key])?;
                }
            }
        }

        Ok(())
    }

    /// Renders the graph in Graphviz dot syntax.
    pub fn to_dot(&self) -> String {
        let mut f = String::new();
        let _ = self.write_dot(&mut f);
        f
    }

    fn write_dot(&self, f: &mut impl Write) -> fmt::Result {
        writeln!(f, "digraph {{")?;
        writeln!(f, "    rankdir=LR;")?;

        for (key, task) in self.iter() {
            let shape = match task {
                Task::Call(_) | Task::Chain(_) => "box",
                Task::GetItem { .. } => "ellipse",
                Task::Literal(_) => "note",
            };
            writeln!(f, "    {:?} [label={:?}, shape={shape}];", key.as_str(), task.label())?;
        }

        for (key, task) in self.iter() {
            for dependency in task.dependencies() {
                writeln!(f, "    {:?} -> {:?};", dependency.as_str(), key.as_str())?;
            }
        }

        writeln!(f, "}}")
    }

    /// Writes the graph to `path`, choosing the format by extension.
    pub fn visualize(&self, path: impl AsRef<Utf8Path>) -> Result<(), GraphError> {
        let path = path.as_ref();

        let rendered = match path.extension() {
            Some("dot" | "gv") => self.to_dot(),
            Some("mmd" | "mermaid") => self.to_mermaid(),
            _ => return Err(GraphError::UnsupportedFormat(path.to_owned())),
        };

        std::fs::write(path, rendered)?;
        Ok(())
    }
}

impl fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_mermaid(f)
    }
}

#[derive(Debug, Clone)]
enum Shape {
    Value(Value),
    Slot(usize),
    List(Vec<Shape>),
    Map(BTreeMap<String, Shape>),
}

impl Shape {
    fn of(input: &Input, roots: &mut Vec<Node>, slots: &mut HashMap<Key, usize>) -> Self {
        match input {
            Input::Value(value) => Shape::Value(value.clone()),
            Input::Node(node) => {
                let slot = *slots.entry(node.key().clone()).or_insert_with(|| {
                    roots.push(node.clone());
                    roots.len() - 1
                });
                Shape::Slot(slot)
            }
            Input::List(items) => Shape::List(items.iter().map(|item| Shape::of(item, roots, slots)).collect()),
            Input::Map(map) => Shape::Map(
                map.iter()
                    .map(|(name, item)| (name.clone(), Shape::of(item, roots, slots)))
                    .collect(),
            ),
        }
    }

    /// Fails with the first slot that has no result.
    fn fill(&self, results: &[Value]) -> Result<Value, usize> {
        Ok(match self {
            Shape::Value(value) => value.clone(),
            Shape::Slot(slot) => results.get(*slot).cloned().ok_or(*slot)?,
            Shape::List(items) => Value::List(items.iter().map(|item| item.fill(results)).collect::<Result<_, _>>()?),
            Shape::Map(map) => Value::Map(
                map.iter()
                    .map(|(name, item)| Ok::<_, usize>((name.clone(), item.fill(results)?)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

/// Rebuilds the shape of the caller's inputs from the results of the roots.
#[derive(Debug, Clone)]
pub struct Repack {
    shapes: Vec<Shape>,
    keys: Vec<Key>,
}

impl Repack {
    /// `results` holds one value per root, in root order. Returns one value
    /// per original input.
    pub fn apply(&self, results: &[Value]) -> Result<Vec<Value>, ComputeError> {
        self.shapes
            .iter()
            .map(|shape| {
                shape
                    .fill(results)
                    .map_err(|slot| ComputeError::MissingResult(self.keys[slot].clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Arg, Call, Delayed, literal};
    use crate::op::{Invocation, Op, OpId};
    use crate::value::BinaryOp;

    fn add() -> Op {
        Op::new("test.add", |call: &Invocation| {
            Ok(call.arg(0)?.binary(BinaryOp::Add, call.arg(1)?)?)
        })
    }

    fn call(deps: &[&str]) -> Task {
        Task::Call(Call {
            op: OpId::new("test.add"),
            receiver: None,
            args: deps.iter().map(|d| Arg::Ref(Key::new(*d))).collect(),
            kwargs: BTreeMap::new(),
        })
    }

    #[test]
    fn test_shared_node_stored_once() {
        let shared = add().call([1, 1]).unwrap();
        let left = shared.add(1).unwrap();
        let right = shared.mul(2).unwrap();

        let Collected { graph, roots, .. } = TaskGraph::collect([&left, &right]);
        assert_eq!(graph.len(), 3);
        assert_eq!(roots.len(), 2);
    }

    #[test]
    fn test_scenario_three_entries() {
        let c = add().call([1, 1]).unwrap().add(add().call([2, 2]).unwrap()).unwrap();
        let collected = TaskGraph::collect([c]);
        assert_eq!(collected.graph.len(), 3);
    }

    #[test]
    fn test_collected_order_is_topological() {
        let a = add().call([1, 2]).unwrap();
        let b = a.add(&a).unwrap().sub(literal(3)).unwrap();
        let graph = TaskGraph::collect([b]).graph;

        let position: HashMap<&Key, usize> = graph.keys().enumerate().map(|(i, k)| (k, i)).collect();
        for (key, task) in graph.iter() {
            for dep in task.dependencies() {
                assert!(position[&dep] < position[key]);
            }
        }

        let order = graph.topological_order().unwrap();
        let position: HashMap<&Key, usize> = order.iter().enumerate().map(|(i, k)| (k, i)).collect();
        for (key, deps) in graph.dependencies() {
            for dep in deps {
                assert!(position[&dep] < position[&key]);
            }
        }
    }

    #[test]
    fn test_validate() {
        let mut graph = TaskGraph::new();
        graph.insert(Key::new("a"), call(&["missing"]));
        assert!(matches!(graph.validate(), Err(GraphError::MissingDependency { .. })));

        let mut graph = TaskGraph::new();
        graph.insert(Key::new("a"), call(&["b"]));
        graph.insert(Key::new("b"), call(&["a"]));
        assert!(matches!(graph.validate(), Err(GraphError::Cycle(_))));

        let mut graph = TaskGraph::new();
        graph.insert(Key::new("a"), Task::Literal(Value::Int(1)));
        graph.insert(Key::new("b"), call(&["a"]));
        assert!(matches!(graph.validate(), Err(GraphError::UnknownOperation(_))));
        graph.registry_mut().register(&add());
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_priority_prefers_critical_path() {
        let mut graph = TaskGraph::new();
        graph.insert(Key::new("short"), Task::Literal(Value::Int(1)));
        graph.insert(Key::new("long"), Task::Literal(Value::Int(1)));
        graph.insert(Key::new("mid"), call(&["long"]));
        graph.insert(Key::new("sink"), call(&["mid", "short"]));

        let hint = graph.priority_hint().unwrap();
        assert_eq!(hint.len(), 4);
        assert!(hint[&Key::new("long")] < hint[&Key::new("short")]);
    }

    #[test]
    fn test_remove_and_replace_keep_order() {
        let mut graph = TaskGraph::new();
        graph.insert(Key::new("a"), Task::Literal(Value::Int(1)));
        graph.insert(Key::new("b"), Task::Literal(Value::Int(2)));
        graph.insert(Key::new("a"), Task::Literal(Value::Int(3)));

        let keys: Vec<&str> = graph.keys().map(Key::as_str).collect();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(graph.get(&Key::new("a")), Some(&Task::Literal(Value::Int(3))));

        graph.remove(&Key::new("a"));
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.keys().count(), 1);
    }

    #[test]
    fn test_repack_mirrors_input() {
        let x = add().call([1, 1]).unwrap();
        let input = Input::List(vec![Input::from(&x), Input::from(7), Input::from(&x)]);
        let Collected { roots, repack, .. } = TaskGraph::collect([input, Input::from(Delayed::Ready(Value::Null))]);

        assert_eq!(roots.len(), 1);
        let values = repack.apply(&[Value::Int(2)]).unwrap();
        assert_eq!(
            values,
            [Value::List(vec![Value::Int(2), Value::Int(7), Value::Int(2)]), Value::Null]
        );
    }

    #[test]
    fn test_exports() {
        let c = add().call([1, 1]).unwrap().add(add().call([2, 2]).unwrap()).unwrap();
        let graph = TaskGraph::collect([c]).graph;

        let mermaid = graph.to_mermaid();
        assert!(mermaid.starts_with("graph LR\n"));
        assert_eq!(mermaid.matches("-->").count(), 2);
        assert_eq!(graph.to_string(), mermaid);

        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph {"));
        assert_eq!(dot.matches("->").count(), 2);

        assert!(matches!(
            graph.visualize("graph.png"),
            Err(GraphError::UnsupportedFormat(_))
        ));
    }
}
