use crate::core::Key;
use crate::graph::TaskGraph;
use crate::scheduler::ExecutionState;

/// Hooks into a scheduler run. Every method defaults to doing nothing.
///
/// Hooks are called from the thread driving the run, never from a worker.
pub trait Callback: Send + Sync {
    /// Before any state is built, with the graph that is about to run.
    fn on_start(&self, _graph: &TaskGraph) {}

    /// Once the initial state is built.
    fn on_state(&self, _graph: &TaskGraph, _state: &ExecutionState) {}

    /// Right before `key` is handed to a worker.
    fn pre_task(&self, _key: &Key, _state: &ExecutionState) {}

    /// After the result of `key` is stored.
    fn post_task(&self, _key: &Key, _worker: Option<usize>, _state: &ExecutionState) {}

    /// At the end of the run, whether or not it failed. `state` is missing if
    /// the run failed before the state was built.
    fn on_finish(&self, _state: Option<&ExecutionState>, _failed: bool) {}
}
