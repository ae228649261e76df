//! Decoding of raw register/bit payloads into typed values.
//!
//! The decode pipeline is pure: the caller passes the entity's previously
//! accepted value in, so monotonic handling needs no state here.

use std::collections::HashMap;

use thiserror::Error;

use crate::entity::{Conversion, EntityDescriptor};
use crate::value::{Payload, Value};

/// Errors raised while decoding one entity's payload slice.
///
/// Decode failures are per-entity: they never affect sibling entities
/// sharing the same read operation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Payload is empty")]
    EmptyPayload,

    #[error("Payload has {got} words, expected {expected}")]
    ShortPayload { got: usize, expected: usize },

    #[error("Cannot combine {0} words into an integer")]
    UnsupportedWordCount(usize),

    #[error("Float values need 2 or 4 words, got {0}")]
    UnsupportedFloatWidth(usize),

    #[error("No map entry for raw value {0}")]
    MapMiss(i64),
}

/// Decode one entity's payload slice into a typed value.
///
/// `previous` is the last value accepted for this entity, consulted only
/// by the `never_resets` rule: a numeric decrease is treated as a
/// transient device reset and the previous value is kept.
pub fn decode(
    payload: &Payload,
    desc: &EntityDescriptor,
    previous: Option<&Value>,
) -> Result<Value, DecodeError> {
    let conv = &desc.conversion;

    let value = match payload {
        Payload::Bits(bits) => decode_bits(bits, conv)?,
        Payload::Words(words) => decode_words(words, conv)?,
    };

    Ok(apply_floor(value, previous, conv.never_resets))
}

/// Bit-typed data yields a boolean directly, or a mapped label when an
/// enumeration map is configured (switch-style on/off semantics).
fn decode_bits(bits: &[bool], conv: &Conversion) -> Result<Value, DecodeError> {
    let bit = *bits.first().ok_or(DecodeError::EmptyPayload)?;

    match &conv.map {
        Some(map) => lookup(map, i64::from(bit)),
        None => Ok(Value::Boolean(bit)),
    }
}

fn decode_words(words: &[u16], conv: &Conversion) -> Result<Value, DecodeError> {
    if words.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }

    if conv.is_string {
        return Ok(Value::Text(decode_string(words)));
    }

    if let Some(scales) = &conv.sum_scale {
        if words.len() < scales.len() {
            return Err(DecodeError::ShortPayload {
                got: words.len(),
                expected: scales.len(),
            });
        }
        let raw: f64 = words
            .iter()
            .zip(scales)
            .map(|(word, scale)| f64::from(*word) * scale)
            .sum();
        return Ok(Value::Number(apply_numeric(raw, conv)));
    }

    if conv.is_float {
        let raw = combine_float(words)?;
        return Ok(Value::Number(apply_numeric(raw, conv)));
    }

    let mut raw = combine_words(words)?;
    if let Some(shift) = conv.shift_bits {
        raw = raw.checked_shr(shift).unwrap_or(0);
    }
    if let Some(width) = conv.bit_width {
        if width < 64 {
            raw &= (1u64 << width) - 1;
        }
    }

    if let Some(map) = &conv.map {
        return lookup(map, raw as i64);
    }

    Ok(Value::Number(apply_numeric(raw as f64, conv)))
}

/// Combine up to four words into an integer, first word most significant.
fn combine_words(words: &[u16]) -> Result<u64, DecodeError> {
    if words.len() > 4 {
        return Err(DecodeError::UnsupportedWordCount(words.len()));
    }
    Ok(words
        .iter()
        .fold(0u64, |acc, word| (acc << 16) | u64::from(*word)))
}

/// Reinterpret the combined register bits as IEEE 754 floating point.
fn combine_float(words: &[u16]) -> Result<f64, DecodeError> {
    match words.len() {
        2 => {
            let bits = (u32::from(words[0]) << 16) | u32::from(words[1]);
            Ok(f64::from(f32::from_bits(bits)))
        }
        4 => {
            let bits = words
                .iter()
                .fold(0u64, |acc, word| (acc << 16) | u64::from(*word));
            Ok(f64::from_bits(bits))
        }
        n => Err(DecodeError::UnsupportedFloatWidth(n)),
    }
}

/// Registers hold two ASCII bytes each, high byte first; trailing NUL and
/// space padding is trimmed.
fn decode_string(words: &[u16]) -> String {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for word in words {
        bytes.push((word >> 8) as u8);
        bytes.push((word & 0xff) as u8);
    }
    while matches!(bytes.last(), Some(b'\0') | Some(b' ')) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn lookup(map: &HashMap<i64, String>, raw: i64) -> Result<Value, DecodeError> {
    map.get(&raw)
        .cloned()
        .map(Value::Text)
        .ok_or(DecodeError::MapMiss(raw))
}

/// Multiplier, offset and precision rounding.
fn apply_numeric(raw: f64, conv: &Conversion) -> f64 {
    let mut value = raw;
    if let Some(multiplier) = conv.multiplier {
        value *= multiplier;
    }
    if let Some(offset) = conv.offset {
        value += offset;
    }
    if let Some(precision) = conv.precision {
        let factor = 10f64.powi(precision as i32);
        value = (value * factor).round() / factor;
    }
    value
}

/// Keep the previous value when a `never_resets` entity reports a lower
/// number than it last did.
fn apply_floor(value: Value, previous: Option<&Value>, never_resets: bool) -> Value {
    if !never_resets {
        return value;
    }
    match (value.as_f64(), previous.and_then(Value::as_f64)) {
        (Some(new), Some(old)) if new < old => previous.cloned().unwrap_or(value),
        _ => value,
    }
}
