//! Execution of task graphs.
//!
//! A run prunes the graph down to what the requested keys need, builds an
//! [`ExecutionState`] and then drives it from the calling thread. With the
//! [`Threaded`] scheduler, ready tasks are encoded into payloads, grouped into
//! chunks and shipped to a `rayon` pool; results come back over a channel and
//! unlock their dependents. Only the driving thread ever touches the state.

mod callbacks;
mod diagnostics;
mod prune;
mod state;
mod worker;

use std::fmt;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Instant;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::codec::WireTask;
use crate::context::{self, ChunkSize};
use crate::core::Key;
use crate::error::{ComputeError, GraphError};
use crate::graph::TaskGraph;
use crate::value::Value;

pub use callbacks::Callback;
pub use diagnostics::{Diagnostics, TaskExecution};
pub use state::{ExecutionState, KeyState};

use worker::{ChunkResult, Payload};

/// Per-run settings that do not come from the execution context.
#[derive(Clone, Default)]
pub struct RunConfig {
    /// Merge linear chains before running.
    pub optimize: bool,
    pub callbacks: Vec<Arc<dyn Callback>>,
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("optimize", &self.optimize)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// The values of the requested keys, in request order.
#[derive(Debug, Clone)]
pub struct Run {
    pub values: Vec<Value>,
    pub diagnostics: Diagnostics,
}

pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Computes `keys` from `graph`. Reads the execution context once, at the
    /// start of the run.
    fn run(&self, graph: TaskGraph, keys: &[Key], config: &RunConfig) -> Result<Run, ComputeError>;
}

/// Culls the graph, optionally fuses linear chains and checks the result.
fn prepare(graph: TaskGraph, keys: &[Key], optimize: bool) -> Result<TaskGraph, GraphError> {
    let mut graph = prune::cull(graph, keys)?;
    if optimize {
        graph = prune::fuse_linear(graph, keys)?;
    }
    graph.validate()?;
    Ok(graph)
}

/// Runs `body` and then the finish hooks, whatever the outcome.
fn supervise<T>(
    callbacks: &[Arc<dyn Callback>],
    body: impl FnOnce(&mut Option<ExecutionState>) -> Result<T, ComputeError>,
) -> Result<T, ComputeError> {
    let mut state = None;
    let result = body(&mut state);

    if let Err(error) = &result {
        tracing::debug!(%error, "run failed");
    }

    for callback in callbacks {
        callback.on_finish(state.as_ref(), result.is_err());
    }

    result
}

fn start<'s>(
    graph: &TaskGraph,
    config: &RunConfig,
    slot: &'s mut Option<ExecutionState>,
) -> Result<&'s mut ExecutionState, ComputeError> {
    for callback in &config.callbacks {
        callback.on_start(graph);
    }

    let state = slot.insert(ExecutionState::new(graph, graph.priority_hint()?));

    for callback in &config.callbacks {
        callback.on_state(graph, state);
    }

    if state.is_stalled() {
        return Err(ComputeError::NoReadyTasks);
    }

    Ok(state)
}

fn results(state: &ExecutionState, keys: &[Key]) -> Result<Vec<Value>, ComputeError> {
    keys.iter()
        .map(|key| {
            state
                .cache()
                .get(key)
                .cloned()
                .ok_or_else(|| ComputeError::MissingResult(key.clone()))
        })
        .collect()
}

fn compute_span(name: &'static str, total: usize) -> tracing::Span {
    let span = tracing::info_span!("compute", scheduler = name);
    span.pb_set_length(total as u64);
    span.pb_set_style(&crate::utils::style_compute());
    span.pb_set_message("Computing...");
    span
}

/// Runs tasks on a `rayon` thread pool.
///
/// Without an explicit pool a fresh one is built for every run, sized by the
/// `workers` option.
#[derive(Debug, Clone, Default)]
pub struct Threaded {
    pool: Option<Arc<ThreadPool>>,
}

impl Threaded {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs on `pool` instead. The `workers` option is ignored.
    pub fn with_pool(pool: Arc<ThreadPool>) -> Self {
        Self { pool: Some(pool) }
    }
}

impl Scheduler for Threaded {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn run(&self, graph: TaskGraph, keys: &[Key], config: &RunConfig) -> Result<Run, ComputeError> {
        let options = context::get();
        let codec = options.codec();

        supervise(&config.callbacks, |slot| {
            let owned;
            let pool = match &self.pool {
                Some(pool) => pool.as_ref(),
                None => {
                    owned = ThreadPoolBuilder::new()
                        .num_threads(options.workers())
                        .thread_name(|i| format!("taskfuse-worker-{i}"))
                        .build()?;
                    &owned
                }
            };
            let workers = pool.current_num_threads().max(1);

            let graph = prepare(graph, keys, config.optimize)?;
            let state = start(&graph, config, slot)?;

            let started = Instant::now();
            let span = compute_span(self.name(), state.len());
            let _enter = span.enter();

            let registry = graph.registry();
            let mut diagnostics = Diagnostics::default();

            pool.in_place_scope(|s| -> Result<(), ComputeError> {
                let (tx, rx) = channel::<ChunkResult>();
                let mut in_flight = 0usize;

                loop {
                    // fire
                    let ready = state.ready_len();
                    let (chunk, take) = match options.chunk_size {
                        ChunkSize::Unbounded => (ready.div_ceil(workers).max(1), ready),
                        ChunkSize::Fixed(size) => {
                            let idle = workers.saturating_sub(in_flight);
                            (size.get(), ready.min(size.get() * idle))
                        }
                    };

                    let mut payloads = Vec::with_capacity(take);
                    for _ in 0..take {
                        let Some(key) = state.pop_ready() else {
                            break;
                        };
                        for callback in &config.callbacks {
                            callback.pre_task(&key, state);
                        }

                        let task = graph.get(&key).ok_or_else(|| GraphError::MissingKey(key.clone()))?;
                        let bytes = codec.encode_task(WireTask {
                            key: key.clone(),
                            task: task.clone(),
                            data: state.dependency_values(&key),
                        })?;

                        payloads.push(Payload {
                            op: task.op().cloned(),
                            key,
                            bytes,
                        });
                    }

                    let mut payloads = payloads.into_iter().peekable();
                    while payloads.peek().is_some() {
                        let batch: Vec<Payload> = payloads.by_ref().take(chunk).collect();
                        diagnostics.chunks.push(batch.len());
                        in_flight += 1;
                        tracing::trace!(size = batch.len(), in_flight, "dispatching chunk");

                        let tx = tx.clone();
                        let codec = codec.clone();
                        s.spawn(move |_| {
                            let result = worker::run_chunk(batch, registry, codec.as_ref());
                            // the receiver is gone only if the run already failed
                            let _ = tx.send(result);
                        });
                    }

                    if state.is_done() {
                        return Ok(());
                    }
                    if in_flight == 0 {
                        return Err(ComputeError::NoReadyTasks);
                    }

                    // drain
                    let ChunkResult { worker, outcomes } = rx.recv().map_err(|_| ComputeError::Disconnected)?;
                    in_flight -= 1;

                    for done in outcomes {
                        let (value, execution) = match done.outcome {
                            Ok(bytes) => (
                                codec.decode_value(&bytes)?,
                                TaskExecution {
                                    start: done.start,
                                    duration: done.duration,
                                    worker,
                                },
                            ),
                            Err(raised) if options.rerun_on_failure => {
                                tracing::warn!(
                                    key = %done.key,
                                    failed = %raised.key,
                                    error = %raised.error,
                                    "task failed on a worker, rerunning locally"
                                );
                                diagnostics.reruns.push(done.key.clone());

                                let task = graph
                                    .get(&done.key)
                                    .ok_or_else(|| GraphError::MissingKey(done.key.clone()))?;
                                let data = state.dependency_values(&done.key);

                                let start = Instant::now();
                                let value = worker::execute(&done.key, task, registry, &data)
                                    .map_err(|raised| raised.into_failure(None))?;
                                let execution = TaskExecution {
                                    start,
                                    duration: start.elapsed(),
                                    worker: None,
                                };
                                (value, execution)
                            }
                            Err(raised) => return Err(raised.into_failure(worker).into()),
                        };

                        let ran_on = execution.worker;
                        diagnostics.execution_times.insert(done.key.clone(), execution);
                        state.finish(done.key.clone(), value);
                        span.pb_inc(1);

                        for callback in &config.callbacks {
                            callback.post_task(&done.key, ran_on, state);
                        }
                    }
                }
            })?;

            tracing::info!(
                tasks = state.len(),
                chunks = diagnostics.chunks.len(),
                elapsed = ?started.elapsed(),
                "compute complete"
            );

            Ok(Run {
                values: results(state, keys)?,
                diagnostics,
            })
        })
    }
}

/// Runs every task on the calling thread, one at a time, without encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inline;

impl Scheduler for Inline {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn run(&self, graph: TaskGraph, keys: &[Key], config: &RunConfig) -> Result<Run, ComputeError> {
        supervise(&config.callbacks, |slot| {
            let graph = prepare(graph, keys, config.optimize)?;
            let state = start(&graph, config, slot)?;
            let mut diagnostics = Diagnostics::default();

            while let Some(key) = state.pop_ready() {
                for callback in &config.callbacks {
                    callback.pre_task(&key, state);
                }

                let task = graph.get(&key).ok_or_else(|| GraphError::MissingKey(key.clone()))?;
                let data = state.dependency_values(&key);

                let start = Instant::now();
                let value = worker::execute(&key, task, graph.registry(), &data)
                    .map_err(|raised| raised.into_failure(None))?;
                diagnostics.execution_times.insert(
                    key.clone(),
                    TaskExecution {
                        start,
                        duration: start.elapsed(),
                        worker: None,
                    },
                );

                state.finish(key.clone(), value);

                for callback in &config.callbacks {
                    callback.post_task(&key, None, state);
                }
            }

            if !state.is_done() {
                return Err(ComputeError::NoReadyTasks);
            }

            Ok(Run {
                values: results(state, keys)?,
                diagnostics,
            })
        })
    }
}
