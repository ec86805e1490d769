use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use tracing::Level;

use crate::codec::{PayloadCodec, WireTask};
use crate::core::Key;
use crate::error::{CodecError, TaskFailure};
use crate::node::{Call, Task};
use crate::op::{Invocation, OpId, Registry};
use crate::value::Value;

/// One encoded task on its way to a worker.
#[derive(Debug, Clone)]
pub(crate) struct Payload {
    pub key: Key,
    pub op: Option<OpId>,
    pub bytes: Vec<u8>,
}

/// An error raised by a task, under the key that raised it. For a chain this
/// is the failing link, not the chain itself.
#[derive(Debug)]
pub(crate) struct Raised {
    pub key: Key,
    pub op: Option<OpId>,
    pub error: anyhow::Error,
}

impl Raised {
    fn new(key: &Key, task: &Task, error: anyhow::Error) -> Self {
        Self {
            key: key.clone(),
            op: task.op().cloned(),
            error,
        }
    }

    pub(crate) fn into_failure(self, worker: Option<usize>) -> TaskFailure {
        TaskFailure::new(self.key, self.op, worker, self.error)
    }
}

/// The outcome of one task inside a chunk.
#[derive(Debug)]
pub(crate) struct Completed {
    pub key: Key,
    pub start: Instant,
    pub duration: Duration,
    /// Encoded result value.
    pub outcome: Result<Vec<u8>, Raised>,
}

#[derive(Debug)]
pub(crate) struct ChunkResult {
    pub worker: Option<usize>,
    pub outcomes: Vec<Completed>,
}

/// Runs a chunk of payloads in order on the current thread.
pub(crate) fn run_chunk(batch: Vec<Payload>, registry: &Registry, codec: &dyn PayloadCodec) -> ChunkResult {
    let span = tracing::span!(Level::TRACE, "chunk", size = batch.len());
    let _enter = span.enter();

    let outcomes = batch
        .into_iter()
        .map(|payload| {
            let start = Instant::now();
            let outcome = run_payload(&payload, registry, codec);
            Completed {
                key: payload.key,
                start,
                duration: start.elapsed(),
                outcome,
            }
        })
        .collect();

    ChunkResult {
        worker: rayon::current_thread_index(),
        outcomes,
    }
}

fn run_payload(payload: &Payload, registry: &Registry, codec: &dyn PayloadCodec) -> Result<Vec<u8>, Raised> {
    let blame = |error: CodecError| Raised {
        key: payload.key.clone(),
        op: payload.op.clone(),
        error: error.into(),
    };

    let WireTask { key, task, data } = codec.decode_task(&payload.bytes).map_err(blame)?;
    let value = execute(&key, &task, registry, &data)?;
    codec.encode_value(value).map_err(blame)
}

/// Evaluates one task descriptor against the values of its dependencies.
/// Panics in user code become errors.
pub(crate) fn execute(key: &Key, task: &Task, registry: &Registry, data: &BTreeMap<Key, Value>) -> Result<Value, Raised> {
    let result = match task {
        Task::Chain(links) => {
            let mut local = data.clone();
            let mut last = Value::Null;
            for (link_key, link) in links {
                last = execute(link_key, link, registry, &local)?;
                local.insert(link_key.clone(), last.clone());
            }
            return Ok(last);
        }
        Task::Literal(value) => Ok(value.clone()),
        Task::GetItem { source, index } => get_item(source, *index, data),
        Task::Call(call) => caught(|| invoke(call, registry, data)),
    };

    result.map_err(|error| Raised::new(key, task, error))
}

fn get_item(source: &Key, index: usize, data: &BTreeMap<Key, Value>) -> anyhow::Result<Value> {
    let list = data
        .get(source)
        .ok_or_else(|| anyhow::anyhow!("missing value for '{source}'"))?;
    let index = i64::try_from(index)?;
    Ok(list.index(&Value::Int(index))?)
}

fn invoke(call: &Call, registry: &Registry, data: &BTreeMap<Key, Value>) -> anyhow::Result<Value> {
    let (func, receiver) = registry.resolve(call)?;

    let missing = |key: Key| anyhow::anyhow!("missing value for '{key}'");
    let args = call
        .args
        .iter()
        .map(|arg| arg.resolve(data).map_err(missing))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let kwargs = call
        .kwargs
        .iter()
        .map(|(name, arg)| Ok((name.clone(), arg.resolve(data).map_err(missing)?)))
        .collect::<anyhow::Result<BTreeMap<_, _>>>()?;

    func(&Invocation::new(receiver, args, kwargs))
}

fn caught(f: impl FnOnce() -> anyhow::Result<Value>) -> anyhow::Result<Value> {
    // the task only reads shared state, so a panic leaves nothing half written
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            Err(anyhow::anyhow!(msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Cbor;
    use crate::node::Arg;
    use crate::op::Op;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(&Op::new("inc", |call: &Invocation| {
            Ok(Value::Int(call.arg(0)?.as_i64().unwrap_or_default() + 1))
        }));
        registry.register(&Op::new("boom", |_: &Invocation| -> anyhow::Result<Value> {
            panic!("kaboom")
        }));
        registry.register(&Op::new("fail", |_: &Invocation| -> anyhow::Result<Value> {
            anyhow::bail!("remote refused")
        }));
        registry
    }

    fn inc(arg: Arg) -> Task {
        Task::Call(Call {
            op: OpId::new("inc"),
            receiver: None,
            args: vec![arg],
            kwargs: BTreeMap::new(),
        })
    }

    fn fail() -> Task {
        Task::Call(Call {
            op: OpId::new("fail"),
            receiver: None,
            args: vec![],
            kwargs: BTreeMap::new(),
        })
    }

    #[test]
    fn test_execute_call_and_getitem() {
        let registry = registry();
        let data = BTreeMap::from([(Key::new("x"), Value::Int(4))]);
        let value = execute(&Key::new("y"), &inc(Arg::Ref(Key::new("x"))), &registry, &data).unwrap();
        assert_eq!(value, Value::Int(5));

        let data = BTreeMap::from([(Key::new("l"), Value::from(vec![Value::Int(1), Value::Int(2)]))]);
        let task = Task::GetItem {
            source: Key::new("l"),
            index: 1,
        };
        assert_eq!(execute(&Key::new("i"), &task, &registry, &data).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_execute_chain() {
        let chain = Task::Chain(vec![
            (Key::new("a"), inc(Arg::Value(Value::Int(0)))),
            (Key::new("b"), inc(Arg::Ref(Key::new("a")))),
            (Key::new("c"), inc(Arg::Ref(Key::new("b")))),
        ]);
        let value = execute(&Key::new("c"), &chain, &registry(), &BTreeMap::new()).unwrap();
        assert_eq!(value, Value::Int(3));
    }

    #[test]
    fn test_chain_blames_failing_link() {
        let chain = Task::Chain(vec![
            (Key::new("a"), inc(Arg::Value(Value::Int(0)))),
            (Key::new("b"), fail()),
            (Key::new("c"), inc(Arg::Ref(Key::new("b")))),
        ]);
        let raised = execute(&Key::new("c"), &chain, &registry(), &BTreeMap::new()).unwrap_err();
        assert_eq!(raised.key, Key::new("b"));
        assert_eq!(raised.op, Some(OpId::new("fail")));
        assert_eq!(raised.error.to_string(), "remote refused");
    }

    #[test]
    fn test_missing_dependency_is_an_error() {
        let task = inc(Arg::Ref(Key::new("nope")));
        let raised = execute(&Key::new("k"), &task, &registry(), &BTreeMap::new()).unwrap_err();
        assert_eq!(raised.key, Key::new("k"));
        assert!(raised.error.to_string().contains("nope"));
    }

    #[test]
    fn test_panic_is_caught() {
        let task = Task::Call(Call {
            op: OpId::new("boom"),
            receiver: None,
            args: vec![],
            kwargs: BTreeMap::new(),
        });
        let raised = execute(&Key::new("k"), &task, &registry(), &BTreeMap::new()).unwrap_err();
        assert_eq!(raised.error.to_string(), "Task panicked: kaboom");
    }

    #[test]
    fn test_run_chunk_keeps_order() {
        let registry = registry();
        let batch = (0..3)
            .map(|i| {
                let key = Key::new(format!("k{i}"));
                let bytes = Cbor
                    .encode_task(WireTask {
                        key: key.clone(),
                        task: inc(Arg::Value(Value::Int(i))),
                        data: BTreeMap::new(),
                    })
                    .unwrap();
                Payload { key, op: None, bytes }
            })
            .collect();

        let result = run_chunk(batch, &registry, &Cbor);
        let values: Vec<Value> = result
            .outcomes
            .into_iter()
            .map(|done| Cbor.decode_value(&done.outcome.unwrap()).unwrap())
            .collect();
        assert_eq!(values, [Value::Int(1), Value::Int(2), Value::Int(3)]);
    }
}
