use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::Key;
use crate::op::{OpId, ReceiverId};
use crate::value::Value;

/// Failure of a builtin operator applied to concrete values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValueError {
    #[error("unsupported operand type for {op}: '{operand}'")]
    UnsupportedUnary { op: &'static str, operand: &'static str },

    #[error("unsupported operand types for {op}: '{lhs}' and '{rhs}'")]
    UnsupportedBinary {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow in {0}")]
    Overflow(&'static str),

    #[error("negative shift count")]
    NegativeShift,

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("missing field '{0}'")]
    MissingField(String),

    #[error("expected {expected}, got '{got}'")]
    Type {
        expected: &'static str,
        got: &'static str,
    },
}

impl ValueError {
    pub(crate) fn unary(op: &'static str, operand: &Value) -> Self {
        ValueError::UnsupportedUnary {
            op,
            operand: operand.type_name(),
        }
    }

    pub(crate) fn binary(op: &'static str, lhs: &Value, rhs: &Value) -> Self {
        ValueError::UnsupportedBinary {
            op,
            lhs: lhs.type_name(),
            rhs: rhs.type_name(),
        }
    }

    pub(crate) fn expected(expected: &'static str, got: &Value) -> Self {
        ValueError::Type {
            expected,
            got: got.type_name(),
        }
    }
}

/// Errors raised while building deferred nodes.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("nout must be None or a non-negative integer, got {0}")]
    InvalidNout(i64),

    #[error("cannot unpack '{0}': the number of outputs is unknown")]
    UnknownLength(Key),

    #[error("cannot unpack a value of type '{0}'")]
    NotAList(&'static str),

    #[error("eager execution failed:\n{0}")]
    Eager(#[source] Box<ComputeError>),
}

/// Structural problems with a task graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("'{key}' depends on '{dependency}', which is not in the graph")]
    MissingDependency { key: Key, dependency: Key },

    #[error("cycle detected in task graph at '{0}'")]
    Cycle(Key),

    #[error("requested key '{0}' is not in the graph")]
    MissingKey(Key),

    #[error("operation '{0}' is not registered")]
    UnknownOperation(OpId),

    #[error("receiver {0} is not registered")]
    UnknownReceiver(ReceiverId),

    #[error("unsupported export format for '{0}', expected .dot, .gv, .mmd or .mermaid")]
    UnsupportedFormat(Utf8PathBuf),

    #[error("couldn't write graph export.\n{0}")]
    Io(#[from] std::io::Error),
}

/// Payload serialization failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("couldn't encode payload: {0}")]
    Encode(String),

    #[error("couldn't decode payload: {0}")]
    Decode(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("expected a {expected} frame")]
    UnexpectedFrame { expected: &'static str },
}

/// A named option received a value of the wrong shape.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("invalid value for option '{name}': expected {expected}")]
pub struct OptionError {
    pub name: String,
    pub expected: &'static str,
}

/// A single task failed while the graph was running.
///
/// The original error is carried intact, so the caller can inspect it with
/// [`TaskFailure::downcast_ref`] and tell a failing remote call apart from a
/// scheduling problem.
pub struct TaskFailure {
    pub key: Key,
    pub op: Option<OpId>,
    /// Index of the pool thread that ran the task, `None` for the controller.
    pub worker: Option<usize>,
    pub error: anyhow::Error,
    /// The rendered error chain, as captured where the task ran.
    pub trace: String,
}

impl TaskFailure {
    pub(crate) fn new(key: Key, op: Option<OpId>, worker: Option<usize>, error: anyhow::Error) -> Self {
        let trace = format!("{error:?}");
        Self {
            key,
            op,
            worker,
            error,
            trace,
        }
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl fmt::Debug for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFailure")
            .field("key", &self.key)
            .field("op", &self.op)
            .field("worker", &self.worker)
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task '{}' failed: {}", self.key, self.error)
    }
}

impl std::error::Error for TaskFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source: &(dyn std::error::Error + 'static) = self.error.as_ref();
        Some(source)
    }
}

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("no ready tasks while the graph is unfinished")]
    NoReadyTasks,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Task(Box<TaskFailure>),

    #[error("couldn't build the worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("worker pool disconnected before the run finished")]
    Disconnected,

    #[error("no result for requested key '{0}'")]
    MissingResult(Key),
}

impl From<TaskFailure> for ComputeError {
    fn from(failure: TaskFailure) -> Self {
        ComputeError::Task(Box::new(failure))
    }
}

impl ComputeError {
    /// The failing task, if the run was aborted by one.
    pub fn task_error(&self) -> Option<&TaskFailure> {
        match self {
            ComputeError::Task(failure) => Some(failure),
            _ => None,
        }
    }

    /// Downcasts the original error of the failing task.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.task_error()?.downcast_ref::<E>()
    }
}

impl TaskError {
    /// Downcasts the original error of a task that failed in eager mode.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        match self {
            TaskError::Eager(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}
