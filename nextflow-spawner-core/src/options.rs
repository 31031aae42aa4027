//! Typed option values and the validated options record

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::schema::FieldKind;

/// A single validated option value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// Optional field left unset with no default
    Null,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
}

impl OptionValue {
    /// Coerce a raw form value into the given kind.
    ///
    /// Enum membership is checked by the caller, which knows the allowed set.
    pub fn parse(kind: FieldKind, raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        match kind {
            FieldKind::String | FieldKind::Enum => Ok(OptionValue::String(raw.to_string())),
            FieldKind::Integer => raw
                .parse::<i64>()
                .map(OptionValue::Integer)
                .map_err(|_| format!("expected an integer, got '{}'", raw)),
            FieldKind::Number => match raw.parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(OptionValue::Number(n)),
                _ => Err(format!("expected a number, got '{}'", raw)),
            },
            FieldKind::Boolean => parse_bool(raw)
                .map(OptionValue::Boolean)
                .ok_or_else(|| format!("expected a boolean, got '{}'", raw)),
        }
    }

    /// Convert a schema default into a typed value, `None` if it does not fit the kind
    pub fn from_default(kind: FieldKind, value: &Value) -> Option<Self> {
        match (kind, value) {
            (_, Value::Null) => Some(OptionValue::Null),
            (FieldKind::String, Value::String(s)) => Some(OptionValue::String(s.clone())),
            (FieldKind::Enum, Value::String(s)) => Some(OptionValue::String(s.clone())),
            (FieldKind::Enum, Value::Number(n)) => Some(OptionValue::String(n.to_string())),
            (FieldKind::Enum, Value::Bool(b)) => Some(OptionValue::String(b.to_string())),
            (FieldKind::Integer, Value::Number(n)) => n
                .as_i64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                })
                .map(OptionValue::Integer),
            (FieldKind::Number, Value::Number(n)) => n.as_f64().map(OptionValue::Number),
            (FieldKind::Boolean, Value::Bool(b)) => Some(OptionValue::Boolean(*b)),
            // Nextflow schemas occasionally quote scalar defaults
            (_, Value::String(s)) => Self::parse(kind, s).ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, OptionValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            OptionValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OptionValue::Number(n) => Some(*n),
            OptionValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            OptionValue::Null => Value::Null,
            OptionValue::Boolean(b) => Value::Bool(*b),
            OptionValue::Integer(i) => Value::from(*i),
            OptionValue::Number(n) => Value::from(*n),
            OptionValue::String(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Null => Ok(()),
            OptionValue::Boolean(b) => write!(f, "{}", b),
            OptionValue::Integer(i) => write!(f, "{}", i),
            OptionValue::Number(n) => write!(f, "{}", n),
            OptionValue::String(s) => write!(f, "{}", s),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Validated launch options: exactly one value per schema field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaunchOptions(BTreeMap<String, OptionValue>);

impl LaunchOptions {
    pub(crate) fn insert(&mut self, name: String, value: OptionValue) {
        self.0.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionValue)> {
        self.0.iter()
    }

    /// JSON object of every non-null value
    pub fn to_json_object(&self) -> serde_json::Map<String, Value> {
        self.0
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}
