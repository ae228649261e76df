//! Raw payloads and decoded values.

use serde::{Deserialize, Serialize};

/// Raw data returned by one read transaction, already concatenated across
/// chunked sub-reads.
///
/// Register reads produce 16-bit words, coil and discrete-input reads
/// produce bits. The two address spaces never mix within one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Holding/input register words, in wire order.
    Words(Vec<u16>),
    /// Coil/discrete-input bits, in wire order.
    Bits(Vec<bool>),
}

impl Payload {
    /// Number of words or bits in this payload.
    pub fn len(&self) -> usize {
        match self {
            Payload::Words(words) => words.len(),
            Payload::Bits(bits) => bits.len(),
        }
    }

    /// Whether the payload holds no data at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append another payload of the same kind, preserving order.
    pub fn append(&mut self, other: Payload) {
        match (self, other) {
            (Payload::Words(dst), Payload::Words(src)) => dst.extend(src),
            (Payload::Bits(dst), Payload::Bits(src)) => dst.extend(src),
            _ => unreachable!("payload kinds never mix within one operation"),
        }
    }

    /// Extract `len` words/bits starting at `offset`, or `None` if the
    /// payload is too short.
    pub fn slice(&self, offset: usize, len: usize) -> Option<Payload> {
        match self {
            Payload::Words(words) => words
                .get(offset..offset + len)
                .map(|s| Payload::Words(s.to_vec())),
            Payload::Bits(bits) => bits
                .get(offset..offset + len)
                .map(|s| Payload::Bits(s.to_vec())),
        }
    }
}

/// A decoded entity value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    /// Numeric reading, after conversion.
    Number(f64),
    /// Coil or discrete-input state.
    Boolean(bool),
    /// Text reading or enumeration label.
    Text(String),
}

impl Value {
    /// Numeric view of this value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
