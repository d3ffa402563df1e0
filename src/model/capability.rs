//! Worker capabilities and task requirements.
//!
//! Both sides use the same ordered key → scalar map. A worker can take a task
//! when every requirement appears among its capabilities with an equal value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered capability map.
pub type Capabilities = BTreeMap<String, CapabilityValue>;

/// A single capability value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CapabilityValue {
    /// Equality with integer/float promotion, so `gpus = 2` satisfies `gpus = 2.0`.
    pub fn matches(&self, other: &CapabilityValue) -> bool {
        use CapabilityValue::*;
        match (self, other) {
            (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
            (a, b) => a == b,
        }
    }
}

impl std::fmt::Display for CapabilityValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityValue::Bool(b) => write!(f, "{b}"),
            CapabilityValue::Int(i) => write!(f, "{i}"),
            CapabilityValue::Float(x) => write!(f, "{x}"),
            CapabilityValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for CapabilityValue {
    fn from(value: bool) -> Self {
        CapabilityValue::Bool(value)
    }
}

impl From<i64> for CapabilityValue {
    fn from(value: i64) -> Self {
        CapabilityValue::Int(value)
    }
}

impl From<i32> for CapabilityValue {
    fn from(value: i32) -> Self {
        CapabilityValue::Int(value.into())
    }
}

impl From<f64> for CapabilityValue {
    fn from(value: f64) -> Self {
        CapabilityValue::Float(value)
    }
}

impl From<&str> for CapabilityValue {
    fn from(value: &str) -> Self {
        CapabilityValue::Text(value.to_string())
    }
}

impl From<String> for CapabilityValue {
    fn from(value: String) -> Self {
        CapabilityValue::Text(value)
    }
}

/// Does a worker with `capabilities` satisfy `requirements`?
pub fn satisfies(capabilities: &Capabilities, requirements: &Capabilities) -> bool {
    requirements.iter().all(|(key, wanted)| {
        capabilities
            .get(key)
            .is_some_and(|offered| offered.matches(wanted))
    })
}

/// Parse a `key=value` pair as typed on a command line.
///
/// Values are read as bool, then integer, then float, falling back to text.
pub fn parse_pair(pair: &str) -> crate::error::Result<(String, CapabilityValue)> {
    let (key, raw) = pair.split_once('=').ok_or_else(|| {
        crate::error::Error::Validation(format!("capability '{pair}' is not key=value"))
    })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(crate::error::Error::Validation(format!(
            "capability '{pair}' has an empty key"
        )));
    }
    let raw = raw.trim();
    let value = if let Ok(b) = raw.parse::<bool>() {
        CapabilityValue::Bool(b)
    } else if let Ok(i) = raw.parse::<i64>() {
        CapabilityValue::Int(i)
    } else if let Ok(x) = raw.parse::<f64>() {
        CapabilityValue::Float(x)
    } else {
        CapabilityValue::Text(raw.to_string())
    };
    Ok((key.to_string(), value))
}
