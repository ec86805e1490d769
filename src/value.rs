//! Plain data flowing between tasks.
//!
//! Everything a worker receives or returns is a [`Value`]. Keeping the set of
//! shapes closed is what allows payloads to be encoded with any
//! [`PayloadCodec`](crate::PayloadCodec) and shipped to a worker without
//! carrying executable code along.
//!
//! The builtin operators (arithmetic, comparison, bitwise, indexing) are
//! defined here on values, and re-exposed on deferred nodes through
//! [`Delayed`](crate::Delayed).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValueError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view, promoting integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn unary(&self, op: UnaryOp) -> Result<Value, ValueError> {
        let unsupported = || ValueError::unary(op.name(), self);

        match (op, self) {
            (UnaryOp::Neg, Value::Int(a)) => a.checked_neg().map(Value::Int).ok_or(ValueError::Overflow(op.name())),
            (UnaryOp::Neg, Value::Float(a)) => Ok(Value::Float(-a)),
            (UnaryOp::Pos, Value::Int(_) | Value::Float(_)) => Ok(self.clone()),
            (UnaryOp::Abs, Value::Int(a)) => a.checked_abs().map(Value::Int).ok_or(ValueError::Overflow(op.name())),
            (UnaryOp::Abs, Value::Float(a)) => Ok(Value::Float(a.abs())),
            (UnaryOp::Invert, Value::Int(a)) => Ok(Value::Int(!a)),
            (UnaryOp::Invert, Value::Bool(a)) => Ok(Value::Bool(!a)),
            _ => Err(unsupported()),
        }
    }

    pub fn binary(&self, op: BinaryOp, rhs: &Value) -> Result<Value, ValueError> {
        use Value::{Bool, Float, Int, List, Str};

        let unsupported = || ValueError::binary(op.name(), self, rhs);
        let overflow = || ValueError::Overflow(op.name());

        match (op, self, rhs) {
            // ints stay ints where the result is integral
            (BinaryOp::Add, Int(a), Int(b)) => a.checked_add(*b).map(Int).ok_or_else(overflow),
            (BinaryOp::Sub, Int(a), Int(b)) => a.checked_sub(*b).map(Int).ok_or_else(overflow),
            (BinaryOp::Mul, Int(a), Int(b)) => a.checked_mul(*b).map(Int).ok_or_else(overflow),
            (BinaryOp::FloorDiv, Int(a), Int(b)) => floor_div(*a, *b).map(Int),
            (BinaryOp::Rem, Int(a), Int(b)) => floor_rem(*a, *b).map(Int),
            (BinaryOp::Pow, Int(a), Int(b)) if *b >= 0 => u32::try_from(*b)
                .ok()
                .and_then(|b| a.checked_pow(b))
                .map(Int)
                .ok_or_else(overflow),
            (BinaryOp::And, Int(a), Int(b)) => Ok(Int(a & b)),
            (BinaryOp::Or, Int(a), Int(b)) => Ok(Int(a | b)),
            (BinaryOp::Xor, Int(a), Int(b)) => Ok(Int(a ^ b)),
            (BinaryOp::And, Bool(a), Bool(b)) => Ok(Bool(a & b)),
            (BinaryOp::Or, Bool(a), Bool(b)) => Ok(Bool(a | b)),
            (BinaryOp::Xor, Bool(a), Bool(b)) => Ok(Bool(a ^ b)),
            (BinaryOp::Shl | BinaryOp::Shr, Int(_), Int(b)) if *b < 0 => Err(ValueError::NegativeShift),
            (BinaryOp::Shl, Int(a), Int(b)) => u32::try_from(*b)
                .ok()
                .and_then(|b| a.checked_shl(b))
                .map(Int)
                .ok_or_else(overflow),
            (BinaryOp::Shr, Int(a), Int(b)) => Ok(Int(if *b >= 64 { a >> 63 } else { a >> b })),

            // sequences
            (BinaryOp::Add, Str(a), Str(b)) => Ok(Str(format!("{a}{b}"))),
            (BinaryOp::Add, List(a), List(b)) => Ok(List(a.iter().chain(b).cloned().collect())),
            (BinaryOp::Mul, Str(s), Int(n)) | (BinaryOp::Mul, Int(n), Str(s)) => {
                repeat_len(s.len(), *n)?;
                Ok(Str(s.repeat(usize::try_from(*n).unwrap_or(0))))
            }
            (BinaryOp::Mul, List(items), Int(n)) | (BinaryOp::Mul, Int(n), List(items)) => {
                let len = repeat_len(items.len(), *n)?;
                Ok(List(items.iter().cloned().cycle().take(len).collect()))
            }

            // everything else numeric is promoted to float
            _ => {
                let (Some(a), Some(b)) = (self.as_f64(), rhs.as_f64()) else {
                    return Err(unsupported());
                };

                let value = match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Pow => a.powf(b),
                    BinaryOp::TrueDiv | BinaryOp::FloorDiv | BinaryOp::Rem if b == 0.0 => {
                        return Err(ValueError::DivisionByZero);
                    }
                    BinaryOp::TrueDiv => a / b,
                    BinaryOp::FloorDiv => (a / b).floor(),
                    BinaryOp::Rem => a - b * (a / b).floor(),
                    _ => return Err(unsupported()),
                };

                Ok(Float(value))
            }
        }
    }

    pub fn compare(&self, op: CompareOp, rhs: &Value) -> Result<Value, ValueError> {
        let result = match op {
            CompareOp::Eq => loose_eq(self, rhs),
            CompareOp::Ne => !loose_eq(self, rhs),
            _ => match self.partial_order(rhs) {
                Some(ordering) => match op {
                    CompareOp::Lt => ordering == Ordering::Less,
                    CompareOp::Le => ordering != Ordering::Greater,
                    CompareOp::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                },
                // NaN is unordered against every number
                None if self.as_f64().is_some() && rhs.as_f64().is_some() => false,
                None => return Err(ValueError::binary(op.name(), self, rhs)),
            },
        };

        Ok(Value::Bool(result))
    }

    /// Element lookup: lists, strings and bytes by (possibly negative)
    /// integer position, maps by string key.
    pub fn index(&self, index: &Value) -> Result<Value, ValueError> {
        match (self, index) {
            (Value::List(items), Value::Int(i)) => {
                let at = wrap_index(*i, items.len())?;
                Ok(items[at].clone())
            }
            (Value::Str(s), Value::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let at = wrap_index(*i, chars.len())?;
                Ok(Value::Str(chars[at].to_string()))
            }
            (Value::Bytes(bytes), Value::Int(i)) => {
                let at = wrap_index(*i, bytes.len())?;
                Ok(Value::Int(bytes[at] as i64))
            }
            (Value::Map(map), Value::Str(name)) => map
                .get(name)
                .cloned()
                .ok_or_else(|| ValueError::MissingField(name.clone())),
            _ => Err(ValueError::binary("getitem", self, index)),
        }
    }

    fn partial_order(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    match x.partial_order(y)? {
                        Ordering::Equal => continue,
                        other => return Some(other),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| loose_eq(x, y))
        }
        _ => a == b,
    }
}

/// Upper bound on the length of a repeated string (in bytes) or list.
const MAX_REPEAT_LEN: usize = 1 << 28;

/// Length of `len` items repeated `times` times. Negative counts repeat
/// nothing.
fn repeat_len(len: usize, times: i64) -> Result<usize, ValueError> {
    let times = usize::try_from(times).unwrap_or(0);
    len.checked_mul(times)
        .filter(|&total| total <= MAX_REPEAT_LEN)
        .ok_or(ValueError::Overflow("mul"))
}

fn wrap_index(index: i64, len: usize) -> Result<usize, ValueError> {
    let resolved = if index < 0 { len as i64 + index } else { index };

    if resolved < 0 || resolved >= len as i64 {
        return Err(ValueError::IndexOutOfRange { index, len });
    }

    Ok(resolved as usize)
}

/// Integer division rounding towards negative infinity.
fn floor_div(a: i64, b: i64) -> Result<i64, ValueError> {
    if b == 0 {
        return Err(ValueError::DivisionByZero);
    }
    let q = a.checked_div(b).ok_or(ValueError::Overflow("floordiv"))?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

/// Remainder carrying the sign of the divisor.
fn floor_rem(a: i64, b: i64) -> Result<i64, ValueError> {
    if b == 0 {
        return Err(ValueError::DivisionByZero);
    }
    let r = a.checked_rem(b).ok_or(ValueError::Overflow("mod"))?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

macro_rules! impl_from {
    ($($T:ty => $V:ident),* $(,)?) => {
        $(
            impl From<$T> for Value {
                fn from(value: $T) -> Self {
                    Value::$V(value.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i64 => Int,
    i32 => Int,
    u32 => Int,
    f64 => Float,
    f32 => Float,
    String => Str,
    &str => Str,
    Vec<Value> => List,
    BTreeMap<String, Value> => Map,
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Int(value as i64)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Pos,
    Abs,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Rem,
    Pow,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 4] = [UnaryOp::Neg, UnaryOp::Pos, UnaryOp::Abs, UnaryOp::Invert];

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Pos => "pos",
            UnaryOp::Abs => "abs",
            UnaryOp::Invert => "invert",
        }
    }
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 12] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::TrueDiv,
        BinaryOp::FloorDiv,
        BinaryOp::Rem,
        BinaryOp::Pow,
        BinaryOp::And,
        BinaryOp::Or,
        BinaryOp::Xor,
        BinaryOp::Shl,
        BinaryOp::Shr,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::TrueDiv => "truediv",
            BinaryOp::FloorDiv => "floordiv",
            BinaryOp::Rem => "mod",
            BinaryOp::Pow => "pow",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "lshift",
            BinaryOp::Shr => "rshift",
        }
    }
}

impl CompareOp {
    pub const ALL: [CompareOp; 6] = [
        CompareOp::Eq,
        CompareOp::Ne,
        CompareOp::Lt,
        CompareOp::Le,
        CompareOp::Gt,
        CompareOp::Ge,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Lt => "lt",
            CompareOp::Le => "le",
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_arithmetic() {
        let a = Value::Int(7);
        let b = Value::Int(-2);
        assert_eq!(a.binary(BinaryOp::Add, &b).unwrap(), Value::Int(5));
        assert_eq!(a.binary(BinaryOp::FloorDiv, &b).unwrap(), Value::Int(-4));
        assert_eq!(a.binary(BinaryOp::Rem, &b).unwrap(), Value::Int(-1));
        assert_eq!(a.binary(BinaryOp::TrueDiv, &b).unwrap(), Value::Float(-3.5));
        assert_eq!(a.binary(BinaryOp::Pow, &Value::Int(2)).unwrap(), Value::Int(49));
    }

    #[test]
    fn test_mixed_promotes_to_float() {
        let sum = Value::Int(1).binary(BinaryOp::Add, &Value::Float(0.5)).unwrap();
        assert_eq!(sum, Value::Float(1.5));
    }

    #[test]
    fn test_division_by_zero() {
        let err = Value::Int(1).binary(BinaryOp::FloorDiv, &Value::Int(0));
        assert!(matches!(err, Err(ValueError::DivisionByZero)));
        let err = Value::Float(1.0).binary(BinaryOp::TrueDiv, &Value::Int(0));
        assert!(matches!(err, Err(ValueError::DivisionByZero)));
    }

    #[test]
    fn test_overflow_is_reported() {
        let err = Value::Int(i64::MAX).binary(BinaryOp::Add, &Value::Int(1));
        assert!(matches!(err, Err(ValueError::Overflow("add"))));
    }

    #[test]
    fn test_sequences() {
        let s = Value::from("ab").binary(BinaryOp::Mul, &Value::Int(3)).unwrap();
        assert_eq!(s, Value::from("ababab"));

        let l = Value::List(vec![Value::Int(1)])
            .binary(BinaryOp::Add, &Value::List(vec![Value::Int(2)]))
            .unwrap();
        assert_eq!(l, Value::List(vec![Value::Int(1), Value::Int(2)]));

        let empty = Value::List(vec![Value::Int(1)]).binary(BinaryOp::Mul, &Value::Int(-2)).unwrap();
        assert_eq!(empty, Value::List(vec![]));
    }

    #[test]
    fn test_huge_repetition_is_an_overflow() {
        let huge = Value::Int(i64::MAX);
        let list = Value::List(vec![Value::Int(1), Value::Int(2)]);

        assert!(matches!(list.binary(BinaryOp::Mul, &huge), Err(ValueError::Overflow("mul"))));
        assert!(matches!(huge.binary(BinaryOp::Mul, &list), Err(ValueError::Overflow("mul"))));
        assert!(matches!(
            Value::from("ab").binary(BinaryOp::Mul, &huge),
            Err(ValueError::Overflow("mul"))
        ));
        assert!(matches!(
            Value::from("ab").binary(BinaryOp::Mul, &Value::Int(1 << 30)),
            Err(ValueError::Overflow("mul"))
        ));
    }

    #[test]
    fn test_unsupported_operands() {
        let err = Value::from("a").binary(BinaryOp::Sub, &Value::Int(1)).unwrap_err();
        assert_eq!(err.to_string(), "unsupported operand types for sub: 'str' and 'int'");
    }

    #[test]
    fn test_unary() {
        assert_eq!(Value::Int(-3).unary(UnaryOp::Abs).unwrap(), Value::Int(3));
        assert_eq!(Value::Int(3).unary(UnaryOp::Neg).unwrap(), Value::Int(-3));
        assert_eq!(Value::Int(0).unary(UnaryOp::Invert).unwrap(), Value::Int(-1));
        assert_eq!(Value::Bool(true).unary(UnaryOp::Invert).unwrap(), Value::Bool(false));
        assert!(Value::from("x").unary(UnaryOp::Neg).is_err());
    }

    #[test]
    fn test_compare() {
        let t = Value::Bool(true);
        assert_eq!(Value::Int(1).compare(CompareOp::Eq, &Value::Float(1.0)).unwrap(), t);
        assert_eq!(Value::Int(1).compare(CompareOp::Lt, &Value::Float(1.5)).unwrap(), t);
        assert_eq!(Value::from("b").compare(CompareOp::Ge, &Value::from("a")).unwrap(), t);

        let short = Value::List(vec![Value::Int(1)]);
        let long = Value::List(vec![Value::Int(1), Value::Int(0)]);
        assert_eq!(short.compare(CompareOp::Lt, &long).unwrap(), t);

        assert!(Value::from("a").compare(CompareOp::Lt, &Value::Int(1)).is_err());
    }

    #[test]
    fn test_nan_compares_false() {
        let nan = Value::Float(f64::NAN);
        let one = Value::Float(1.0);
        let f = Value::Bool(false);

        for op in [CompareOp::Lt, CompareOp::Le, CompareOp::Gt, CompareOp::Ge, CompareOp::Eq] {
            assert_eq!(nan.compare(op, &one).unwrap(), f);
            assert_eq!(Value::Int(1).compare(op, &nan).unwrap(), f);
        }
        assert_eq!(nan.compare(CompareOp::Ne, &nan).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_index() {
        let list = Value::List(vec![Value::Int(10), Value::Int(20), Value::Int(30)]);
        assert_eq!(list.index(&Value::Int(0)).unwrap(), Value::Int(10));
        assert_eq!(list.index(&Value::Int(-1)).unwrap(), Value::Int(30));
        assert!(matches!(
            list.index(&Value::Int(3)),
            Err(ValueError::IndexOutOfRange { index: 3, len: 3 })
        ));

        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Value::Int(1));
        let map = Value::Map(map);
        assert_eq!(map.index(&Value::from("k")).unwrap(), Value::Int(1));
        assert!(map.index(&Value::from("missing")).is_err());

        assert_eq!(Value::from("héllo").index(&Value::Int(1)).unwrap(), Value::from("é"));
    }

    #[test]
    fn test_from_json() {
        let json: serde_json::Value = serde_json::json!({"a": [1, 2.5, "x", null]});
        let value = Value::from(json);
        let expected = Value::Map(BTreeMap::from([(
            "a".to_string(),
            Value::List(vec![Value::Int(1), Value::Float(2.5), Value::from("x"), Value::Null]),
        )]));
        assert_eq!(value, expected);
    }
}
