// ABOUTME: The typed value model shared by the wire codec and the row pipeline
// ABOUTME: Key tuples compare lexicographically; encodings are canonical across ends

use std::cmp::Ordering;
use std::fmt;

/// A single typed value as carried by the codec.
///
/// Column values only ever use the four scalar variants; `Array` appears in
/// command arguments (key tuples) and row framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Nil,
    Uint(u64),
    Int(i64),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
}

/// An ordered tuple of scalar values matching a table's primary key.
///
/// The empty tuple means "before the first row" when used as a lower bound
/// and "beyond the last row" when used as an upper bound.
pub type ColumnValues = Vec<Value>;

/// One row's values, in column order.
pub type Row = Vec<Value>;

impl Value {
    pub fn bytes(s: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(s.into())
    }

    /// Numeric value as i128 so signed and unsigned variants compare sanely.
    fn as_number(&self) -> Option<i128> {
        match self {
            Value::Uint(u) => Some(*u as i128),
            Value::Int(i) => Some(*i as i128),
            _ => None,
        }
    }
}

/// Total order over scalar values: nil sorts first, then numbers, then byte
/// strings. Within a table every primary-key column has a single type, so the
/// cross-type arms only decide degenerate comparisons consistently.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Nil, Value::Nil) => Ordering::Equal,
        (Value::Nil, _) => Ordering::Less,
        (_, Value::Nil) => Ordering::Greater,
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => match (a, b) {
                (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
                (Value::Array(x), Value::Array(y)) => compare_keys(x, y),
                (Value::Bytes(_), Value::Array(_)) => Ordering::Less,
                (Value::Array(_), Value::Bytes(_)) => Ordering::Greater,
                _ => unreachable!("numeric values handled above"),
            },
        },
    }
}

/// Lexicographic order over key tuples.
pub fn compare_keys(a: &[Value], b: &[Value]) -> Ordering {
    for (av, bv) in a.iter().zip(b.iter()) {
        match compare_values(av, bv) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Human-readable key tuple for trace logs, eg. `(42,"abc")`.
pub struct KeyDisplay<'a>(pub &'a [Value]);

impl fmt::Display for KeyDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (n, value) in self.0.iter().enumerate() {
            if n > 0 {
                write!(f, ",")?;
            }
            match value {
                Value::Nil => write!(f, "NULL")?,
                Value::Uint(u) => write!(f, "{}", u)?,
                Value::Int(i) => write!(f, "{}", i)?,
                Value::Bytes(b) => match std::str::from_utf8(b) {
                    Ok(s) => write!(f, "{:?}", s)?,
                    Err(_) => write!(f, "0x{}", hex::encode(b))?,
                },
                Value::Array(inner) => write!(f, "{}", KeyDisplay(inner))?,
            }
        }
        write!(f, ")")
    }
}
