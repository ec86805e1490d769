//! Payload encoding between the controller and the workers.
//!
//! Workers never see the graph. They get an opaque payload holding one task
//! descriptor together with the values of its dependencies, and send back an
//! encoded result. The encoding is pluggable through the execution context.

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::core::Key;
use crate::error::CodecError;
use crate::node::Task;
use crate::value::Value;

/// A task as shipped to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTask {
    pub key: Key,
    pub task: Task,
    /// Resolved values of every key the task references.
    pub data: BTreeMap<Key, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Task(WireTask),
    Value(Value),
}

/// Custom serialization hooks for cross-worker payloads.
pub trait PayloadCodec: Debug + Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Frame, CodecError>;

    fn encode_task(&self, task: WireTask) -> Result<Vec<u8>, CodecError> {
        self.encode(&Frame::Task(task))
    }

    fn decode_task(&self, bytes: &[u8]) -> Result<WireTask, CodecError> {
        match self.decode(bytes)? {
            Frame::Task(task) => Ok(task),
            Frame::Value(_) => Err(CodecError::UnexpectedFrame { expected: "task" }),
        }
    }

    fn encode_value(&self, value: Value) -> Result<Vec<u8>, CodecError> {
        self.encode(&Frame::Value(value))
    }

    fn decode_value(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        match self.decode(bytes)? {
            Frame::Value(value) => Ok(value),
            Frame::Task(_) => Err(CodecError::UnexpectedFrame { expected: "value" }),
        }
    }
}

/// CBOR via `ciborium`, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cbor;

impl PayloadCodec for Cbor {
    fn name(&self) -> &'static str {
        "cbor"
    }

    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        let mut buffer = Vec::new();
        ciborium::into_writer(frame, &mut buffer).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(buffer)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame, CodecError> {
        ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// JSON via `serde_json`. Human readable, but non-finite floats do not
/// survive the trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl PayloadCodec for Json {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, frame: &Frame) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(frame)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
