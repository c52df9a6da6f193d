//! Buildset properties.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{Error, Result};

/// Named values attached to a buildset, each with the source that set it.
///
/// Serialized as `{"name": [value, "source"]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, (Value, String)>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value, source: impl Into<String>) {
        self.0.insert(name.into(), (value, source.into()));
    }

    pub fn get(&self, name: &str) -> Option<&(Value, String)> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &(Value, String))> {
        self.0.iter()
    }

    /// Keep only the requested names; `*` selects everything.
    pub fn select(&self, names: &[String]) -> Properties {
        if names.iter().any(|n| n == "*") {
            return self.clone();
        }
        Properties(
            self.0
                .iter()
                .filter(|(name, _)| names.contains(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        )
    }

    /// Decode one stored `[value, source]` pair.
    pub fn decode_entry(raw: &Value) -> Result<(Value, String)> {
        match raw.as_array().map(Vec::as_slice) {
            Some([value, Value::String(source)]) => Ok((value.clone(), source.clone())),
            _ => Err(Error::InvalidProperty(format!(
                "property value must be a [value, source] pair, got {}",
                raw
            ))),
        }
    }

    /// Encode one entry into its stored `[value, source]` form.
    pub fn encode_entry(value: &Value, source: &str) -> Value {
        Value::Array(vec![value.clone(), Value::String(source.to_string())])
    }
}

impl FromIterator<(String, (Value, String))> for Properties {
    fn from_iter<I: IntoIterator<Item = (String, (Value, String))>>(iter: I) -> Self {
        Properties(iter.into_iter().collect())
    }
}
