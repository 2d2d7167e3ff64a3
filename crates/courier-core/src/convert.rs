//! Type conversion between [`Value`] kinds
//!
//! Typed accessors on messages and exchanges never fail loudly: a missing
//! conversion path yields `None`.

use crate::value::{FromValue, Value, ValueKind};
use std::fmt;

/// Converts a value into another kind, returning `None` when no path exists
pub trait TypeConverter: Send + Sync + fmt::Debug {
    fn convert(&self, value: &Value, target: ValueKind) -> Option<Value>;
}

/// Conversions between the primitive kinds plus UTF-8 and JSON text
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTypeConverter;

impl TypeConverter for DefaultTypeConverter {
    fn convert(&self, value: &Value, target: ValueKind) -> Option<Value> {
        if value.kind() == target {
            return Some(value.clone());
        }

        match target {
            ValueKind::Null => None,
            ValueKind::Text => to_text(value).map(Value::Text),
            ValueKind::Int => to_int(value).map(Value::Int),
            ValueKind::Float => to_float(value).map(Value::Float),
            ValueKind::Bool => to_bool(value).map(Value::Bool),
            ValueKind::Bytes => to_bytes(value).map(Value::Bytes),
            ValueKind::Json => to_json(value).map(Value::Json),
        }
    }
}

fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::Bool(b) => Some(b.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(x) => Some(x.to_string()),
        Value::Text(s) => Some(s.clone()),
        Value::Bytes(b) => String::from_utf8(b.clone()).ok(),
        Value::Json(serde_json::Value::String(s)) => Some(s.clone()),
        Value::Json(j) => Some(j.to_string()),
        Value::Null => None,
    }
}

fn to_int(value: &Value) -> Option<i64> {
    match value {
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Int(i) => Some(*i),
        Value::Float(x) if x.is_finite() && x.fract() == 0.0 => Some(*x as i64),
        Value::Text(s) => s.trim().parse().ok(),
        Value::Json(serde_json::Value::Number(n)) => n.as_i64(),
        Value::Json(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(x) => Some(*x),
        Value::Text(s) => s.trim().parse().ok(),
        Value::Json(serde_json::Value::Number(n)) => n.as_f64(),
        _ => None,
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Int(i) => Some(*i != 0),
        Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        Value::Json(serde_json::Value::Bool(b)) => Some(*b),
        _ => None,
    }
}

fn to_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Bytes(b) => Some(b.clone()),
        Value::Json(j) => serde_json::to_vec(j).ok(),
        Value::Null => None,
        other => to_text(other).map(String::into_bytes),
    }
}

fn to_json(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::Null => Some(serde_json::Value::Null),
        Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
        Value::Int(i) => Some(serde_json::Value::from(*i)),
        Value::Float(x) => serde_json::Number::from_f64(*x).map(serde_json::Value::Number),
        Value::Text(s) => serde_json::from_str(s).ok(),
        Value::Bytes(b) => serde_json::from_slice(b).ok(),
        Value::Json(j) => Some(j.clone()),
    }
}

/// Reads `value` as `T`, converting through `converter` when the kind differs
pub fn convert_to<T: FromValue>(converter: &dyn TypeConverter, value: &Value) -> Option<T> {
    if let Some(direct) = T::from_value(value) {
        return Some(direct);
    }
    converter
        .convert(value, T::KIND)
        .and_then(|converted| T::from_value(&converted))
}
