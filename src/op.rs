//! Operations and the receivers they are bound to.
//!
//! An [`Op`] pairs a stable identifier with the function that implements it.
//! Descriptors inside a graph only carry the identifier; the function is
//! looked up in the graph's [`Registry`] when a worker runs the task, so no
//! closure ever travels inside a payload.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use anyhow::{Context as _, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::Dynamic;
use crate::error::{GraphError, TaskError, ValueError};
use crate::node::Call;
use crate::value::{BinaryOp, CompareOp, UnaryOp, Value};

/// Identity of an operation.
///
/// Ids are namespaced with dots, e.g. `completion.complete`. The last
/// segment is used as the readable prefix of derived keys.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(Arc<str>);

impl OpId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        OpId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpId({})", self.0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-unique identity of a [`Receiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReceiverId(u64);

impl fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_RECEIVER: AtomicU64 = AtomicU64::new(0);

/// A stateful backend object that operations can be bound to.
///
/// Receivers compare by identity: two receivers wrapping equal objects are
/// still different receivers, and calls on them are never batched together.
#[derive(Clone)]
pub struct Receiver {
    id: ReceiverId,
    object: Dynamic,
}

impl Receiver {
    pub fn new<T: Any + Send + Sync>(object: T) -> Self {
        Self {
            id: ReceiverId(NEXT_RECEIVER.fetch_add(1, Ordering::Relaxed)),
            object: Arc::new(object),
        }
    }

    pub fn id(&self) -> ReceiverId {
        self.id
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.object.downcast_ref::<T>()
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Receiver({})", self.id)
    }
}

/// The arguments an operation is called with, on the worker side.
#[derive(Debug, Clone)]
pub struct Invocation {
    receiver: Option<Receiver>,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
}

impl Invocation {
    pub(crate) fn new(receiver: Option<Receiver>, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Self { receiver, args, kwargs }
    }

    /// The bound backend object.
    pub fn receiver<T: Any>(&self) -> anyhow::Result<&T> {
        let receiver = self
            .receiver
            .as_ref()
            .ok_or_else(|| anyhow!("operation is not bound to a receiver"))?;

        receiver
            .downcast_ref::<T>()
            .ok_or_else(|| anyhow!("receiver {} is not a {}", receiver.id(), std::any::type_name::<T>()))
    }

    pub fn arg(&self, index: usize) -> anyhow::Result<&Value> {
        self.args
            .get(index)
            .with_context(|| format!("missing positional argument {index}, got {}", self.args.len()))
    }

    /// A list-valued positional argument, as received by batched operations.
    pub fn list(&self, index: usize) -> anyhow::Result<&[Value]> {
        let value = self.arg(index)?;
        Ok(value.as_list().ok_or_else(|| ValueError::expected("list", value))?)
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.kwargs
    }
}

pub(crate) type OpFn = dyn Fn(&Invocation) -> anyhow::Result<Value> + Send + Sync;

/// A callable operation, optionally bound to a receiver.
#[derive(Clone)]
pub struct Op {
    id: OpId,
    func: Arc<OpFn>,
    receiver: Option<Receiver>,
    pure: Option<bool>,
    nout: Option<usize>,
}

impl Op {
    /// Wraps `func` under `id`.
    ///
    /// The id is the identity of the operation: calls are keyed by id and
    /// arguments, never by the function. Two different functions created
    /// under one id produce the same keys for equal arguments, and a graph
    /// runs only the first one it collected.
    pub fn new<F>(id: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(&Invocation) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            id: OpId::new(id),
            func: Arc::new(func),
            receiver: None,
            pure: None,
            nout: None,
        }
    }

    /// The same operation, bound to `receiver`.
    pub fn bind(&self, receiver: &Receiver) -> Self {
        Self {
            receiver: Some(receiver.clone()),
            ..self.clone()
        }
    }

    pub fn pure(mut self, pure: bool) -> Self {
        self.pure = Some(pure);
        self
    }

    /// Declares how many outputs a call returns, which makes its nodes
    /// unpackable.
    pub fn nout(mut self, nout: i64) -> Result<Self, TaskError> {
        let nout = usize::try_from(nout).map_err(|_| TaskError::InvalidNout(nout))?;
        self.nout = Some(nout);
        Ok(self)
    }

    pub fn id(&self) -> &OpId {
        &self.id
    }

    pub fn receiver(&self) -> Option<&Receiver> {
        self.receiver.as_ref()
    }

    pub(crate) fn is_pure(&self) -> Option<bool> {
        self.pure
    }

    pub(crate) fn outputs(&self) -> Option<usize> {
        self.nout
    }

    pub(crate) fn func(&self) -> &Arc<OpFn> {
        &self.func
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Op")
            .field("id", &self.id)
            .field("receiver", &self.receiver)
            .field("pure", &self.pure)
            .field("nout", &self.nout)
            .finish()
    }
}

fn same_fn(a: &Arc<OpFn>, b: &Arc<OpFn>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Lookup table from identifiers to functions and receivers, built while a
/// graph is collected.
#[derive(Clone, Default)]
pub struct Registry {
    ops: HashMap<OpId, Arc<OpFn>>,
    receivers: HashMap<ReceiverId, Receiver>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `op` and its receiver. The first function registered under
    /// an id wins.
    pub fn register(&mut self, op: &Op) {
        match self.ops.get(op.id()) {
            Some(existing) if !same_fn(existing, op.func()) => {
                tracing::warn!(op = %op.id, "conflicting functions registered under one id, keeping the first");
            }
            Some(_) => {}
            None => {
                self.ops.insert(op.id().clone(), op.func().clone());
            }
        }

        if let Some(receiver) = op.receiver() {
            self.receivers.entry(receiver.id).or_insert_with(|| receiver.clone());
        }
    }

    pub fn contains(&self, op: &OpId) -> bool {
        self.ops.contains_key(op)
    }

    pub(crate) fn resolve(&self, call: &Call) -> Result<(Arc<OpFn>, Option<Receiver>), GraphError> {
        let func = self
            .ops
            .get(&call.op)
            .cloned()
            .ok_or_else(|| GraphError::UnknownOperation(call.op.clone()))?;

        let receiver = match call.receiver {
            Some(id) => Some(
                self.receivers
                    .get(&id)
                    .cloned()
                    .ok_or(GraphError::UnknownReceiver(id))?,
            ),
            None => None,
        };

        Ok((func, receiver))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ops: Vec<_> = self.ops.keys().collect();
        ops.sort();
        let mut receivers: Vec<_> = self.receivers.keys().collect();
        receivers.sort();

        f.debug_struct("Registry")
            .field("ops", &ops)
            .field("receivers", &receivers)
            .finish()
    }
}

/// The builtin operators, as operations.
///
/// Each builtin exists exactly once per process, so registering it from
/// several graphs never conflicts.
pub mod builtin {
    use super::*;

    static TABLE: LazyLock<HashMap<&'static str, Op>> = LazyLock::new(|| {
        let mut table = HashMap::new();

        for op in UnaryOp::ALL {
            let id = format!("operator.{}", op.name());
            let func = Op::new(id, move |call: &Invocation| Ok(call.arg(0)?.unary(op)?)).pure(true);
            table.insert(op.name(), func);
        }

        for op in BinaryOp::ALL {
            let id = format!("operator.{}", op.name());
            let func = Op::new(id, move |call: &Invocation| Ok(call.arg(0)?.binary(op, call.arg(1)?)?)).pure(true);
            table.insert(op.name(), func);
        }

        for op in CompareOp::ALL {
            let id = format!("operator.{}", op.name());
            let func = Op::new(id, move |call: &Invocation| Ok(call.arg(0)?.compare(op, call.arg(1)?)?)).pure(true);
            table.insert(op.name(), func);
        }

        let getitem = Op::new("operator.getitem", |call: &Invocation| {
            Ok(call.arg(0)?.index(call.arg(1)?)?)
        });
        table.insert("getitem", getitem.pure(true));

        table
    });

    fn lookup(name: &'static str) -> Op {
        // every operator enum variant is inserted above
        TABLE[name].clone()
    }

    pub fn unary(op: UnaryOp) -> Op {
        lookup(op.name())
    }

    pub fn binary(op: BinaryOp) -> Op {
        lookup(op.name())
    }

    pub fn compare(op: CompareOp) -> Op {
        lookup(op.name())
    }

    pub fn getitem() -> Op {
        lookup("getitem")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_id_name() {
        assert_eq!(OpId::new("completion.complete").name(), "complete");
        assert_eq!(OpId::new("add").name(), "add");
    }

    #[test]
    fn test_receivers_compare_by_identity() {
        let a = Receiver::new(1u8);
        let b = Receiver::new(1u8);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
        assert_eq!(a.downcast_ref::<u8>(), Some(&1));
        assert!(a.downcast_ref::<u16>().is_none());
    }

    #[test]
    fn test_invalid_nout() {
        let op = Op::new("f", |_: &Invocation| Ok(Value::Null));
        assert!(matches!(op.clone().nout(-1), Err(TaskError::InvalidNout(-1))));
        assert_eq!(op.nout(2).unwrap().outputs(), Some(2));
    }

    #[test]
    fn test_invocation_accessors() {
        let call = Invocation::new(
            Some(Receiver::new(String::from("backend"))),
            vec![Value::Int(1)],
            BTreeMap::from([("temperature".to_string(), Value::Float(0.5))]),
        );

        assert_eq!(call.receiver::<String>().unwrap(), "backend");
        assert!(call.receiver::<u32>().is_err());
        assert_eq!(call.arg(0).unwrap(), &Value::Int(1));
        assert!(call.arg(1).is_err());
        assert_eq!(call.kwarg("temperature"), Some(&Value::Float(0.5)));
    }

    #[test]
    fn test_registry_keeps_first() {
        let first = Op::new("f", |_: &Invocation| Ok(Value::Int(1)));
        let second = Op::new("f", |_: &Invocation| Ok(Value::Int(2)));

        let mut registry = Registry::new();
        registry.register(&first);
        registry.register(&second);

        let call = Call {
            op: OpId::new("f"),
            receiver: None,
            args: vec![],
            kwargs: BTreeMap::new(),
        };
        let (func, _) = registry.resolve(&call).unwrap();
        let empty = Invocation::new(None, vec![], BTreeMap::new());
        assert_eq!(func(&empty).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_unknown_receiver() {
        let mut registry = Registry::new();
        let mut call = Call {
            op: OpId::new("f"),
            receiver: Some(ReceiverId(u64::MAX)),
            args: vec![],
            kwargs: BTreeMap::new(),
        };
        assert!(matches!(registry.resolve(&call), Err(GraphError::UnknownOperation(_))));

        registry.register(&Op::new("f", |_: &Invocation| Ok(Value::Null)));
        assert!(matches!(registry.resolve(&call), Err(GraphError::UnknownReceiver(_))));

        call.receiver = None;
        assert!(registry.resolve(&call).is_ok());
    }

    #[test]
    fn test_builtins_are_shared() {
        let a = builtin::binary(BinaryOp::Add);
        let b = builtin::binary(BinaryOp::Add);
        assert!(same_fn(a.func(), b.func()));
        assert_eq!(a.id().as_str(), "operator.add");

        let call = Invocation::new(None, vec![Value::Int(2), Value::Int(3)], BTreeMap::new());
        assert_eq!((a.func())(&call).unwrap(), Value::Int(5));
    }
}
