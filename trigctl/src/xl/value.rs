//! Runtime values and their type tags.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag for condition variables and expression results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bool,
    Number,
    Text,
    Location,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "boolean",
            Self::Number => "number",
            Self::Text => "string",
            Self::Location => "location",
        };
        f.write_str(name)
    }
}

/// A geographic fix. The zero value (0, 0, 0) is what `previousValue`
/// evaluates to before the first fire.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub hdop: f64,
}

/// A condition-language value. All numerics are f64, so integer literals
/// compare against float samples without any coercion rules.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
    Location(Location),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::Text(_) => ValueKind::Text,
            Value::Location(_) => ValueKind::Location,
        }
    }

    /// The zero value for a kind: `false`, `0`, `""`, or the origin fix.
    pub fn zero(kind: ValueKind) -> Value {
        match kind {
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Number => Value::Number(0.0),
            ValueKind::Text => Value::Text(String::new()),
            ValueKind::Location => Value::Location(Location::default()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Location(l) => write!(f, "({}, {})", l.latitude, l.longitude),
        }
    }
}
