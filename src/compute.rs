//! The top level entry point: collect, optimize, schedule, repack.

use std::fmt;
use std::sync::Arc;

use crate::error::{ComputeError, TaskError};
use crate::graph::{Collected, TaskGraph};
use crate::node::{Input, Node};
use crate::optimize::{Backend, Optimizer, Pass};
use crate::scheduler::{Callback, Diagnostics, Inline, Run, RunConfig, Scheduler, Threaded};
use crate::value::Value;

/// Computes deferred values.
///
/// An engine holds the optimization passes contributed by backends, the
/// scheduler and the callbacks for every run. Options such as the chunk size
/// come from the execution context at the time of the call.
#[derive(Clone)]
pub struct Engine {
    optimizer: Optimizer,
    optimize: bool,
    scheduler: Arc<dyn Scheduler>,
    callbacks: Vec<Arc<dyn Callback>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            optimizer: Optimizer::default(),
            optimize: true,
            scheduler: Arc::new(Threaded::new()),
            callbacks: Vec::new(),
        }
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the optimizations of `backend`.
    pub fn backend(mut self, backend: &dyn Backend) -> Self {
        for pass in backend.optimizations() {
            self.optimizer.register(pass);
        }
        self
    }

    pub fn pass(mut self, pass: impl Pass + 'static) -> Self {
        self.optimizer.register(Arc::new(pass));
        self
    }

    /// Turns graph optimizations on or off. Culling always happens.
    pub fn optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    pub fn callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Arc::new(callback));
        self
    }

    /// Computes every input and returns the results with the same shape.
    pub fn compute<I: Into<Input>>(&self, inputs: impl IntoIterator<Item = I>) -> Result<Vec<Value>, ComputeError> {
        self.run(inputs).map(|run| run.values)
    }

    /// Like [`Engine::compute`], but also returns what happened.
    pub fn run<I: Into<Input>>(&self, inputs: impl IntoIterator<Item = I>) -> Result<Run, ComputeError> {
        let Collected { graph, roots, repack } = TaskGraph::collect(inputs);

        if roots.is_empty() {
            return Ok(Run {
                values: repack.apply(&[])?,
                diagnostics: Diagnostics::default(),
            });
        }

        let graph = if self.optimize {
            self.optimizer.apply(graph)?
        } else {
            graph
        };

        let keys: Vec<_> = roots.iter().map(|root| root.key().clone()).collect();
        let config = RunConfig {
            optimize: self.optimize,
            callbacks: self.callbacks.clone(),
        };

        tracing::debug!(scheduler = self.scheduler.name(), entries = graph.len(), keys = keys.len(), "scheduling");
        let Run { values, diagnostics } = self.scheduler.run(graph, &keys, &config)?;

        Ok(Run {
            values: repack.apply(&values)?,
            diagnostics,
        })
    }

    pub fn compute_node(&self, node: &Node) -> Result<Value, ComputeError> {
        let mut values = self.compute([node])?;
        values.pop().ok_or_else(|| ComputeError::MissingResult(node.key().clone()))
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("optimizer", &self.optimizer)
            .field("optimize", &self.optimize)
            .field("scheduler", &self.scheduler.name())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Computes `inputs` with a default [`Engine`].
pub fn compute<I: Into<Input>>(inputs: impl IntoIterator<Item = I>) -> Result<Vec<Value>, ComputeError> {
    Engine::new().compute(inputs)
}

/// Runs `node` right away on the calling thread.
pub(crate) fn eager(node: &Node) -> Result<Value, TaskError> {
    Engine::new()
        .optimize(false)
        .scheduler(Inline)
        .compute_node(node)
        .map_err(|error| TaskError::Eager(Box::new(error)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{self, Overrides};
    use crate::node::{Delayed, literal};
    use crate::op::{Invocation, Op};
    use crate::value::BinaryOp;

    fn add() -> Op {
        Op::new("test.add", |call: &Invocation| {
            Ok(call.arg(0)?.binary(BinaryOp::Add, call.arg(1)?)?)
        })
    }

    #[test]
    fn test_three_entry_graph() {
        let a = add().call([1, 1]).unwrap();
        let b = add().call([1, 1]).unwrap();
        let c = a.add(&b).unwrap();

        assert_eq!(a.key(), b.key());
        assert_eq!(compute([&c]).unwrap(), [Value::Int(4)]);
    }

    #[test]
    fn test_shape_is_preserved() {
        let a = add().call([1, 2]).unwrap();
        let inputs = vec![
            Input::from(&a),
            Input::from(vec![Input::from(&a), Input::from("x")]),
            Input::from(5),
        ];

        let values = compute(inputs).unwrap();
        assert_eq!(
            values,
            [
                Value::Int(3),
                Value::List(vec![Value::Int(3), Value::from("x")]),
                Value::Int(5)
            ]
        );
    }

    #[test]
    fn test_no_nodes_skips_scheduling() {
        let values = compute([1, 2]).unwrap();
        assert_eq!(values, [Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_node_and_delayed_compute() {
        let node = literal(7);
        assert_eq!(Engine::new().compute_node(&node).unwrap(), Value::Int(7));

        let delayed = Delayed::from(node).mul(6).unwrap();
        assert_eq!(delayed.compute().unwrap(), Value::Int(42));
    }

    #[test]
    fn test_eager_mode_returns_values() {
        let _scope = context::set(Overrides::new().eager(true));
        let result = add().call([2, 3]).unwrap();
        assert_eq!(result.value(), Some(&Value::Int(5)));
        assert!(result.node().is_none());
    }

    #[test]
    fn test_eager_failure_is_reported() {
        let _scope = context::set(Overrides::new().eager(true));
        let error = Delayed::Ready(Value::Int(1)).add("x").unwrap_err();
        assert!(matches!(error, TaskError::Eager(_)));
    }
}
