use std::collections::HashSet;

use crate::core::Key;
use crate::error::GraphError;
use crate::graph::TaskGraph;
use crate::node::Task;

/// Drops every entry not needed to produce `keys`.
pub(crate) fn cull(mut graph: TaskGraph, keys: &[Key]) -> Result<TaskGraph, GraphError> {
    let mut needed = HashSet::with_capacity(graph.len());
    let mut stack = Vec::with_capacity(keys.len());

    for key in keys {
        if !graph.contains(key) {
            return Err(GraphError::MissingKey(key.clone()));
        }
        stack.push(key.clone());
    }

    while let Some(key) = stack.pop() {
        if !needed.insert(key.clone()) {
            continue;
        }
        if let Some(task) = graph.get(&key) {
            stack.extend(task.dependencies().into_iter().filter(|dep| !needed.contains(dep)));
        }
    }

    let before = graph.len();
    graph.retain(|key, _| needed.contains(key));
    tracing::trace!(before, after = graph.len(), "culled graph");

    Ok(graph)
}

/// Merges straight runs of entries into single chained entries.
///
/// An entry is merged into its dependent when that dependent is its only
/// consumer, the dependent has no other dependency, and the entry is not one
/// of the requested `keys`. The dependent keeps its key.
pub(crate) fn fuse_linear(mut graph: TaskGraph, keys: &[Key]) -> Result<TaskGraph, GraphError> {
    let order = graph.topological_order()?;
    let dependents = graph.dependents();
    let requested: HashSet<&Key> = keys.iter().collect();
    let mut merged = 0;

    for child in &order {
        let Some(dependencies) = graph.dependencies_of(child) else {
            continue;
        };

        let mut dependencies = dependencies.into_iter();
        let (Some(parent), None) = (dependencies.next(), dependencies.next()) else {
            continue;
        };

        if requested.contains(&parent) || dependents.get(&parent).is_none_or(|d| d.len() != 1) {
            continue;
        }

        let (Some(upstream), Some(task)) = (graph.remove(&parent), graph.get(child).cloned()) else {
            continue;
        };

        let mut links = match upstream {
            Task::Chain(links) => links,
            other => vec![(parent, other)],
        };
        links.push((child.clone(), task));

        graph.insert(child.clone(), Task::Chain(links));
        merged += 1;
    }

    if merged > 0 {
        tracing::debug!(merged, entries = graph.len(), "fused linear chains");
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::node::{Arg, Call};
    use crate::op::OpId;

    fn call(deps: &[&str]) -> Task {
        Task::Call(Call {
            op: OpId::new("f"),
            receiver: None,
            args: deps.iter().map(|d| Arg::Ref(Key::new(*d))).collect(),
            kwargs: BTreeMap::new(),
        })
    }

    fn graph(entries: &[(&str, &[&str])]) -> TaskGraph {
        let mut graph = TaskGraph::new();
        for (key, deps) in entries {
            graph.insert(Key::new(*key), call(deps));
        }
        graph
    }

    #[test]
    fn test_cull_keeps_ancestors() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &[]), ("d", &["b"])]);
        let culled = cull(g, &[Key::new("b")]).unwrap();

        let keys: Vec<&str> = culled.keys().map(Key::as_str).collect();
        assert_eq!(keys, ["a", "b"]);
    }

    #[test]
    fn test_cull_missing_key() {
        let g = graph(&[("a", &[])]);
        assert!(matches!(cull(g, &[Key::new("x")]), Err(GraphError::MissingKey(_))));
    }

    #[test]
    fn test_fuse_straight_line() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let fused = fuse_linear(g, &[Key::new("c")]).unwrap();

        assert_eq!(fused.len(), 1);
        let Some(Task::Chain(links)) = fused.get(&Key::new("c")) else {
            panic!("expected a chain");
        };
        let keys: Vec<&str> = links.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["a", "b", "c"]);
        assert!(fused.get(&Key::new("c")).unwrap().dependencies().is_empty());
    }

    #[test]
    fn test_fuse_respects_branches_and_requests() {
        // a feeds two consumers; b is requested
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b"])]);
        let fused = fuse_linear(g, &[Key::new("b"), Key::new("c"), Key::new("d")]).unwrap();

        assert_eq!(fused.len(), 4);
        assert!(fused.iter().all(|(_, task)| !matches!(task, Task::Chain(_))));
        assert!(fused.topological_order().is_ok());
    }

    #[test]
    fn test_fuse_stops_at_joins() {
        let g = graph(&[("a", &[]), ("b", &[]), ("c", &["a", "b"]), ("d", &["c"])]);
        let fused = fuse_linear(g, &[Key::new("d")]).unwrap();

        assert_eq!(fused.len(), 3);
        assert_eq!(
            fused.get(&Key::new("d")).unwrap().dependencies(),
            [Key::new("a"), Key::new("b")].into_iter().collect()
        );
    }
}
