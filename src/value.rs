//! Values carried as operation arguments and results.
//!
//! The scheduler never interprets values. It only needs their transmission
//! size, which turns into bus time when a request or response crosses a
//! non-virtual bus.

use crate::ids::ObjectRef;

/// An argument or result of a simulated operation.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
    Seq(Vec<Value>),
    Object(ObjectRef),
}

impl Value {
    /// Number of bytes this value occupies on a bus.
    pub fn size_bytes(&self) -> u64 {
        match self {
            Value::Nil => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Real(_) | Value::Object(_) => 8,
            Value::Text(s) => s.len() as u64,
            Value::Seq(items) => items.iter().map(Value::size_bytes).sum(),
        }
    }

    /// Integer content, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Total bus size of an argument list.
pub fn args_size(args: &[Value]) -> u64 {
    args.iter().map(Value::size_bytes).sum()
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Seq(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Object(r) => write!(f, "{}", r),
        }
    }
}
