//! Deferred nodes and the descriptors stored in a graph.
//!
//! A [`Node`] is immutable and refers to the nodes its arguments came from,
//! so a set of root nodes carries the whole computation with it. Collecting
//! the roots into a [`TaskGraph`](crate::TaskGraph) flattens that structure
//! into a map of [`Task`] descriptors keyed by content.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::compute;
use crate::context;
use crate::core::Key;
use crate::error::{ComputeError, TaskError};
use crate::op::{Op, OpId, ReceiverId, builtin};
use crate::value::{BinaryOp, CompareOp, UnaryOp, Value};

/// One argument slot of a call descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    Value(Value),
    /// The result of another entry.
    Ref(Key),
    List(Vec<Arg>),
    Map(BTreeMap<String, Arg>),
}

impl Arg {
    fn collect_refs(&self, out: &mut BTreeSet<Key>) {
        match self {
            Arg::Value(_) => {}
            Arg::Ref(key) => {
                out.insert(key.clone());
            }
            Arg::List(items) => items.iter().for_each(|item| item.collect_refs(out)),
            Arg::Map(map) => map.values().for_each(|item| item.collect_refs(out)),
        }
    }

    /// Substitutes resolved values for references. Fails with the first key
    /// missing from `data`.
    pub(crate) fn resolve(&self, data: &BTreeMap<Key, Value>) -> Result<Value, Key> {
        match self {
            Arg::Value(value) => Ok(value.clone()),
            Arg::Ref(key) => data.get(key).cloned().ok_or_else(|| key.clone()),
            Arg::List(items) => items
                .iter()
                .map(|item| item.resolve(data))
                .collect::<Result<_, _>>()
                .map(Value::List),
            Arg::Map(map) => map
                .iter()
                .map(|(name, item)| Ok((name.clone(), item.resolve(data)?)))
                .collect::<Result<_, _>>()
                .map(Value::Map),
        }
    }
}

/// An operation call: identity, receiver and arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub op: OpId,
    pub receiver: Option<ReceiverId>,
    pub args: Vec<Arg>,
    pub kwargs: BTreeMap<String, Arg>,
}

/// A graph entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Task {
    Literal(Value),
    Call(Call),
    /// Element `index` of another entry's list result.
    GetItem { source: Key, index: usize },
    /// Linear chain merged by the scheduler. Links run in order and may refer
    /// to the links before them; the last link is the result.
    Chain(Vec<(Key, Task)>),
}

impl Task {
    /// Keys referenced by this descriptor's own argument slots.
    pub fn dependencies(&self) -> BTreeSet<Key> {
        let mut out = BTreeSet::new();

        match self {
            Task::Literal(_) => {}
            Task::Call(call) => {
                call.args.iter().for_each(|arg| arg.collect_refs(&mut out));
                call.kwargs.values().for_each(|arg| arg.collect_refs(&mut out));
            }
            Task::GetItem { source, .. } => {
                out.insert(source.clone());
            }
            Task::Chain(links) => {
                for (_, link) in links {
                    out.extend(link.dependencies());
                }
                for (key, _) in links {
                    out.remove(key);
                }
            }
        }

        out
    }

    /// The operation this task ends with, if it calls one.
    pub fn op(&self) -> Option<&OpId> {
        match self {
            Task::Call(call) => Some(&call.op),
            Task::Chain(links) => links.last().and_then(|(_, link)| link.op()),
            _ => None,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Task::Literal(_) => "literal",
            Task::Call(call) => call.op.name(),
            Task::GetItem { .. } => "getitem",
            Task::Chain(links) => links.last().map_or("chain", |(_, link)| link.label()),
        }
    }
}

/// An argument as supplied by the caller: a plain value, a node, or a
/// container that may hold nodes.
#[derive(Debug, Clone)]
pub enum Input {
    Value(Value),
    Node(Node),
    List(Vec<Input>),
    Map(BTreeMap<String, Input>),
}

impl Input {
    /// Converts into an argument slot, collecting the nodes it refers to.
    /// Containers without nodes collapse into plain values.
    pub(crate) fn to_arg(&self, deps: &mut Vec<Node>) -> Arg {
        match self {
            Input::Value(value) => Arg::Value(value.clone()),
            Input::Node(node) => {
                deps.push(node.clone());
                Arg::Ref(node.key().clone())
            }
            Input::List(items) => {
                let args: Vec<Arg> = items.iter().map(|item| item.to_arg(deps)).collect();
                match args.iter().all(|arg| matches!(arg, Arg::Value(_))) {
                    true => Arg::Value(Value::List(args.into_iter().map(into_value).collect())),
                    false => Arg::List(args),
                }
            }
            Input::Map(map) => {
                let args: BTreeMap<String, Arg> =
                    map.iter().map(|(name, item)| (name.clone(), item.to_arg(deps))).collect();
                match args.values().all(|arg| matches!(arg, Arg::Value(_))) {
                    true => Arg::Value(Value::Map(args.into_iter().map(|(k, v)| (k, into_value(v))).collect())),
                    false => Arg::Map(args),
                }
            }
        }
    }
}

fn into_value(arg: Arg) -> Value {
    match arg {
        Arg::Value(value) => value,
        _ => Value::Null,
    }
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Input::Value(value)
    }
}

impl From<Node> for Input {
    fn from(node: Node) -> Self {
        Input::Node(node)
    }
}

impl From<&Node> for Input {
    fn from(node: &Node) -> Self {
        Input::Node(node.clone())
    }
}

impl From<Delayed> for Input {
    fn from(delayed: Delayed) -> Self {
        match delayed {
            Delayed::Pending(node) => Input::Node(node),
            Delayed::Ready(value) => Input::Value(value),
        }
    }
}

impl From<&Delayed> for Input {
    fn from(delayed: &Delayed) -> Self {
        delayed.clone().into()
    }
}

impl<T: Into<Input>> From<Vec<T>> for Input {
    fn from(items: Vec<T>) -> Self {
        Input::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Input>> From<BTreeMap<String, T>> for Input {
    fn from(map: BTreeMap<String, T>) -> Self {
        Input::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

macro_rules! input_from_value {
    ($($T:ty),*) => {
        $(
            impl From<$T> for Input {
                fn from(value: $T) -> Self {
                    Input::Value(Value::from(value))
                }
            }
        )*
    };
}

input_from_value!(bool, i64, i32, u32, usize, f64, f32, String, &str);

/// Arguments and options of a single call.
#[derive(Debug, Clone, Default)]
pub struct Args {
    args: Vec<Input>,
    kwargs: BTreeMap<String, Input>,
    key_name: Option<Key>,
    pure: Option<bool>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, arg: impl Into<Input>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, arg: impl Into<Input>) -> Self {
        self.kwargs.insert(name.into(), arg.into());
        self
    }

    /// Uses `key` instead of a derived key, making the node distinct from
    /// otherwise identical calls.
    pub fn key_name(mut self, key: impl Into<Key>) -> Self {
        self.key_name = Some(key.into());
        self
    }

    /// Overrides the purity flag of the operation for this call.
    pub fn pure(mut self, pure: bool) -> Self {
        self.pure = Some(pure);
        self
    }
}

impl<T: Into<Input>> FromIterator<T> for Args {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            args: iter.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// Everything a call key is derived from.
#[derive(Serialize)]
struct CallToken<'a> {
    op: &'a OpId,
    receiver: Option<ReceiverId>,
    args: &'a [Arg],
    kwargs: &'a BTreeMap<String, Arg>,
    pure: Option<bool>,
    nout: Option<usize>,
}

struct NodeInner {
    key: Key,
    task: Task,
    deps: Vec<Node>,
    op: Option<Op>,
    nout: Option<usize>,
}

/// A deferred unit of computation.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

impl Node {
    pub fn key(&self) -> &Key {
        &self.0.key
    }

    pub fn task(&self) -> &Task {
        &self.0.task
    }

    pub fn dependencies(&self) -> BTreeSet<Key> {
        self.0.task.dependencies()
    }

    /// Declared number of outputs.
    pub fn nout(&self) -> Option<usize> {
        self.0.nout
    }

    pub(crate) fn children(&self) -> &[Node] {
        &self.0.deps
    }

    pub(crate) fn op(&self) -> Option<&Op> {
        self.0.op.as_ref()
    }

    fn get_item(&self, index: usize) -> Node {
        let key = Key::derive("getitem", &(self.key(), index));

        Node(Arc::new(NodeInner {
            key,
            task: Task::GetItem {
                source: self.key().clone(),
                index,
            },
            deps: vec![self.clone()],
            op: None,
            nout: None,
        }))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.key())
    }
}

/// A node holding a plain value.
pub fn literal(value: impl Into<Value>) -> Node {
    let value = value.into();

    Node(Arc::new(NodeInner {
        key: Key::derive("literal", &value),
        task: Task::Literal(value),
        deps: Vec::new(),
        op: None,
        nout: None,
    }))
}

impl Op {
    /// Calls the operation with positional arguments.
    pub fn call<I: Into<Input>>(&self, args: impl IntoIterator<Item = I>) -> Result<Delayed, TaskError> {
        self.call_with(args.into_iter().collect())
    }

    /// Calls the operation. Returns a pending node, or the computed value when
    /// the context is in eager mode.
    pub fn call_with(&self, args: Args) -> Result<Delayed, TaskError> {
        settle(self.node(args))
    }

    fn node(&self, args: Args) -> Node {
        let mut deps = Vec::new();
        let slots: Vec<Arg> = args.args.iter().map(|arg| arg.to_arg(&mut deps)).collect();
        let kwargs: BTreeMap<String, Arg> = args
            .kwargs
            .iter()
            .map(|(name, arg)| (name.clone(), arg.to_arg(&mut deps)))
            .collect();

        let receiver = self.receiver().map(|receiver| receiver.id());
        let nout = self.outputs();

        let key = match args.key_name {
            Some(key) => key,
            None => {
                let token = CallToken {
                    op: self.id(),
                    receiver,
                    args: &slots,
                    kwargs: &kwargs,
                    pure: args.pure.or(self.is_pure()),
                    nout,
                };
                Key::derive(self.id().name(), &token)
            }
        };

        let task = Task::Call(Call {
            op: self.id().clone(),
            receiver,
            args: slots,
            kwargs,
        });

        Node(Arc::new(NodeInner {
            key,
            task,
            deps,
            op: Some(self.clone()),
            nout,
        }))
    }
}

fn settle(node: Node) -> Result<Delayed, TaskError> {
    if context::with(|options| options.eager) {
        return compute::eager(&node).map(Delayed::Ready);
    }

    Ok(Delayed::Pending(node))
}

/// The result of a deferred call.
#[derive(Debug, Clone)]
pub enum Delayed {
    Pending(Node),
    /// Produced directly in eager mode.
    Ready(Value),
}

#[allow(clippy::should_implement_trait)]
impl Delayed {
    pub fn node(&self) -> Option<&Node> {
        match self {
            Delayed::Pending(node) => Some(node),
            Delayed::Ready(_) => None,
        }
    }

    pub fn key(&self) -> Option<&Key> {
        self.node().map(Node::key)
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Delayed::Ready(value) => Some(value),
            Delayed::Pending(_) => None,
        }
    }

    /// Computes this value with the default engine.
    pub fn compute(&self) -> Result<Value, ComputeError> {
        match self {
            Delayed::Ready(value) => Ok(value.clone()),
            Delayed::Pending(node) => compute::Engine::new().compute_node(node),
        }
    }

    pub fn unary(&self, op: UnaryOp) -> Result<Delayed, TaskError> {
        builtin::unary(op).call([self])
    }

    pub fn binary(&self, op: BinaryOp, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        builtin::binary(op).call_with(Args::new().arg(self).arg(rhs))
    }

    pub fn compare(&self, op: CompareOp, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        builtin::compare(op).call_with(Args::new().arg(self).arg(rhs))
    }

    pub fn neg(&self) -> Result<Delayed, TaskError> {
        self.unary(UnaryOp::Neg)
    }

    pub fn pos(&self) -> Result<Delayed, TaskError> {
        self.unary(UnaryOp::Pos)
    }

    pub fn abs(&self) -> Result<Delayed, TaskError> {
        self.unary(UnaryOp::Abs)
    }

    pub fn invert(&self) -> Result<Delayed, TaskError> {
        self.unary(UnaryOp::Invert)
    }

    pub fn add(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.binary(BinaryOp::Sub, rhs)
    }

    pub fn mul(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.binary(BinaryOp::Mul, rhs)
    }

    /// True division, always a float.
    pub fn div(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.binary(BinaryOp::TrueDiv, rhs)
    }

    pub fn floordiv(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.binary(BinaryOp::FloorDiv, rhs)
    }

    pub fn rem(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.binary(BinaryOp::Rem, rhs)
    }

    pub fn pow(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.binary(BinaryOp::Pow, rhs)
    }

    pub fn bitand(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.binary(BinaryOp::And, rhs)
    }

    pub fn bitor(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.binary(BinaryOp::Or, rhs)
    }

    pub fn bitxor(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.binary(BinaryOp::Xor, rhs)
    }

    pub fn shl(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.binary(BinaryOp::Shl, rhs)
    }

    pub fn shr(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.binary(BinaryOp::Shr, rhs)
    }

    pub fn eq(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.compare(CompareOp::Eq, rhs)
    }

    pub fn ne(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.compare(CompareOp::Ne, rhs)
    }

    pub fn lt(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.compare(CompareOp::Lt, rhs)
    }

    pub fn le(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.compare(CompareOp::Le, rhs)
    }

    pub fn gt(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.compare(CompareOp::Gt, rhs)
    }

    pub fn ge(&self, rhs: impl Into<Input>) -> Result<Delayed, TaskError> {
        self.compare(CompareOp::Ge, rhs)
    }

    /// Generic element lookup: lists and strings by position, maps by name.
    pub fn index(&self, index: impl Into<Input>) -> Result<Delayed, TaskError> {
        builtin::getitem().call_with(Args::new().arg(self).arg(index))
    }

    /// Element `index` of a list result.
    pub fn get_item(&self, index: usize) -> Result<Delayed, TaskError> {
        match self {
            Delayed::Pending(node) => settle(node.get_item(index)),
            Delayed::Ready(_) => self.index(index),
        }
    }

    /// Splits a result with a declared number of outputs into one node per
    /// output.
    pub fn unpack(&self) -> Result<Vec<Delayed>, TaskError> {
        match self {
            Delayed::Pending(node) => {
                let nout = node.nout().ok_or_else(|| TaskError::UnknownLength(node.key().clone()))?;
                (0..nout).map(|index| self.get_item(index)).collect()
            }
            Delayed::Ready(Value::List(items)) => Ok(items.iter().cloned().map(Delayed::Ready).collect()),
            Delayed::Ready(other) => Err(TaskError::NotAList(other.type_name())),
        }
    }
}

impl From<Node> for Delayed {
    fn from(node: Node) -> Self {
        Delayed::Pending(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Invocation;

    fn add() -> Op {
        Op::new("test.add", |call: &Invocation| {
            Ok(call.arg(0)?.binary(BinaryOp::Add, call.arg(1)?)?)
        })
    }

    fn pending(delayed: Delayed) -> Node {
        delayed.node().cloned().expect("pending node")
    }

    #[test]
    fn test_same_call_same_key() {
        let a = pending(add().call([1, 2]).unwrap());
        let b = pending(add().call([1, 2]).unwrap());
        let c = pending(add().call([2, 1]).unwrap());

        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(a.key().name(), "add");
    }

    #[test]
    fn test_same_id_shares_key_across_functions() {
        let one = Op::new("test.value", |_: &Invocation| Ok(Value::Int(1)));
        let two = Op::new("test.value", |_: &Invocation| Ok(Value::Int(2)));

        let a = one.call([0]).unwrap();
        let b = two.call([0]).unwrap();
        assert_eq!(a.key(), b.key());
        assert_eq!(compute::compute([&a, &b]).unwrap(), [Value::Int(1), Value::Int(1)]);
    }

    #[test]
    fn test_key_name_and_purity() {
        let named = pending(add().call_with(Args::new().arg(1).arg(2).key_name("mine")).unwrap());
        assert_eq!(named.key().as_str(), "mine");

        let plain = pending(add().call([1, 2]).unwrap());
        let pure = pending(add().call_with(Args::new().arg(1).arg(2).pure(true)).unwrap());
        assert_ne!(plain.key(), pure.key());
    }

    #[test]
    fn test_receiver_is_part_of_key() {
        let a = crate::op::Receiver::new(());
        let b = crate::op::Receiver::new(());
        let on_a = pending(add().bind(&a).call([1, 2]).unwrap());
        let on_b = pending(add().bind(&b).call([1, 2]).unwrap());
        assert_ne!(on_a.key(), on_b.key());
    }

    #[test]
    fn test_dependencies_follow_arguments() {
        let x = add().call([1, 1]).unwrap();
        let y = add().call([2, 2]).unwrap();
        let nested = Input::List(vec![Input::from(&y), Input::from(3)]);
        let z = pending(add().call_with(Args::new().arg(&x).arg(nested)).unwrap());

        let expected: BTreeSet<Key> = [x.key().unwrap().clone(), y.key().unwrap().clone()].into();
        assert_eq!(z.dependencies(), expected);
        assert_eq!(z.children().len(), 2);
    }

    #[test]
    fn test_literal_containers_collapse() {
        let mut deps = Vec::new();
        let arg = Input::from(vec![1, 2]).to_arg(&mut deps);
        assert_eq!(arg, Arg::Value(Value::List(vec![Value::Int(1), Value::Int(2)])));
        assert!(deps.is_empty());
    }

    #[test]
    fn test_operators_build_nodes() {
        let x = add().call([1, 1]).unwrap();
        let y = x.add(&x).unwrap();
        let node = pending(y);
        assert_eq!(node.key().name(), "add");
        assert_eq!(node.dependencies().len(), 1);
        assert_eq!(node.task().op().map(OpId::as_str), Some("operator.add"));
    }

    #[test]
    fn test_unpack() {
        let pair = Op::new("test.pair", |_: &Invocation| {
            Ok(Value::List(vec![Value::Int(1), Value::Int(2)]))
        });

        let unknown = pair.call(Vec::<Input>::new()).unwrap();
        assert!(matches!(unknown.unpack(), Err(TaskError::UnknownLength(_))));

        let known = pair.nout(2).unwrap().call(Vec::<Input>::new()).unwrap();
        let parts = known.unpack().unwrap();
        assert_eq!(parts.len(), 2);
        assert!(matches!(
            parts[1].node().map(Node::task),
            Some(Task::GetItem { index: 1, .. })
        ));
    }

    #[test]
    fn test_chain_dependencies_exclude_links() {
        let chain = Task::Chain(vec![
            (Key::new("a"), Task::GetItem { source: Key::new("src"), index: 0 }),
            (Key::new("b"), Task::GetItem { source: Key::new("a"), index: 1 }),
        ]);
        assert_eq!(chain.dependencies(), BTreeSet::from([Key::new("src")]));
        assert_eq!(chain.label(), "getitem");
    }
}
