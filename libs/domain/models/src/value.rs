//! Raw and wrapped value shapes flowing through the pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::keys::StandardKey;

/// The shape a plugin's dynamic/static read can produce for a single key.
/// Flat — no `{value, unit}` wrapping. The processor wraps these when it
/// builds the merged snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
    Bool(bool),
    List(Vec<Value>),
    AlertMap(BTreeMap<String, Vec<String>>),
    Null,
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// `{value, unit?}` — what every consumer outside the pipeline core sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wrapped {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Wrapped {
    pub fn new(value: Value) -> Self {
        Self { value, unit: None }
    }

    pub fn with_unit(value: Value, unit: impl Into<String>) -> Self {
        Self { value, unit: Some(unit.into()) }
    }
}

/// Flat `key -> raw value` map — what a plugin's read produces and what the
/// filter pass consumes.
pub type DataPacket = BTreeMap<StandardKey, Value>;

/// `key -> {value, unit}` map — what the per-plugin cache and the central
/// snapshot store.
pub type WrappedPacket = BTreeMap<StandardKey, Wrapped>;

/// Wraps every entry of a flat packet with no unit, the shape the processor
/// produces right after a meaningful read before any enrichment adds units.
pub fn wrap_packet(packet: DataPacket) -> WrappedPacket {
    packet
        .into_iter()
        .map(|(k, v)| (k, Wrapped::new(v)))
        .collect()
}

/// Strips the `{value, unit}` wrapping back down to a flat map, the shape
/// the filter pass operates on.
pub fn flatten_packet(packet: &WrappedPacket) -> DataPacket {
    packet
        .iter()
        .map(|(k, w)| (k.clone(), w.value.clone()))
        .collect()
}
