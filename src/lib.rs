#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod codec;
mod compute;
pub mod context;
mod core;
mod error;
mod graph;
mod node;
mod op;
mod optimize;
pub mod scheduler;
mod utils;
mod value;

pub use crate::codec::{Cbor, Frame, Json, PayloadCodec, WireTask};
pub use crate::compute::{Engine, compute};
pub use crate::context::{ChunkSize, Options, Overrides, Scope};
pub use crate::core::Key;
pub use crate::error::*;
pub use crate::graph::{Collected, Repack, TaskGraph};
pub use crate::node::{Arg, Args, Call, Delayed, Input, Node, Task, literal};
pub use crate::op::{Invocation, Op, OpId, Receiver, ReceiverId, Registry, builtin};
pub use crate::optimize::{Backend, BatchFusion, Optimizer, Pass};
pub use crate::scheduler::{
    Callback, Diagnostics, ExecutionState, Inline, KeyState, Run, RunConfig, Scheduler, TaskExecution, Threaded,
};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::value::{BinaryOp, CompareOp, UnaryOp, Value};
