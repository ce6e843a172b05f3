//! Task configurations and sweep declaration loading.
//!
//! A [`Configuration`] is an ordered mapping of JSON-compatible values. Sweep
//! variations address entries by dotted path (`initial.T`) and are applied on
//! top of a base configuration with deep-merge semantics.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigurationError;

/// Payload produced by a simulation and persisted by an output writer.
pub type Payload = Map<String, Value>;

/// Ordered mapping from string keys to scalar or nested values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(Map<String, Value>);

impl Configuration {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Top-level entry
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Entry addressed by a dotted path
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut keys = path.split('.');
        let first = keys.next()?;
        let mut current = self.0.get(first)?;
        for key in keys {
            current = current.as_object()?.get(key)?;
        }
        Some(current)
    }

    /// Check that `path` can be written without clobbering a scalar.
    pub fn check_path(&self, path: &str) -> Result<(), ConfigurationError> {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(ConfigurationError::invalid(path, "empty key segment"));
        }

        let segments: Vec<&str> = path.split('.').collect();
        let mut current = &self.0;
        for (depth, key) in segments[..segments.len() - 1].iter().enumerate() {
            match current.get(*key) {
                None => return Ok(()),
                Some(Value::Object(map)) => current = map,
                Some(_) => {
                    return Err(ConfigurationError::invalid(
                        path,
                        format!("'{}' is not a mapping", segments[..=depth].join(".")),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Replace the entry at a dotted path, inserting missing levels.
    ///
    /// A value/unit string such as `"300 K"` keeps its unit when overridden
    /// by a number, and a legacy `[value, unit]` list has its first element
    /// replaced.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<(), ConfigurationError> {
        self.check_path(path)?;

        let mut keys = path.split('.').peekable();
        let mut current = &mut self.0;
        while let Some(key) = keys.next() {
            if keys.peek().is_none() {
                let slot = current.entry(key.to_string()).or_insert(Value::Null);
                replace_value(slot, value);
                break;
            }
            let next = current
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            let Value::Object(map) = next else {
                return Err(ConfigurationError::invalid(path, "not a mapping"));
            };
            current = map;
        }
        Ok(())
    }

    /// Deep-merge `other` into this configuration. Nested mappings merge
    /// recursively; every other value in `other` overrides.
    pub fn merge(&mut self, other: &Map<String, Value>) {
        merge_maps(&mut self.0, other);
    }

    /// Copy of this configuration with the given dotted-path overrides applied.
    pub fn with_overrides(&self, overrides: &[(String, Value)]) -> Result<Self, ConfigurationError> {
        let mut out = self.clone();
        for (path, value) in overrides {
            out.set_path(path, value.clone())?;
        }
        Ok(out)
    }
}

impl From<Map<String, Value>> for Configuration {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn merge_maps(target: &mut Map<String, Value>, other: &Map<String, Value>) {
    for (key, value) in other {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_maps(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn replace_value(slot: &mut Value, value: Value) {
    if let Value::Array(items) = slot
        && !value.is_array()
        && let Some(first) = items.first_mut()
    {
        *first = value;
        return;
    }

    let unit = match (&*slot, &value) {
        (Value::String(current), Value::Number(_)) => unit_suffix(current),
        _ => None,
    };
    *slot = match unit {
        Some(unit) => Value::String(format!("{value} {unit}")),
        None => value,
    };
}

/// Unit part of a `"<number> <unit>"` string.
pub(crate) fn unit_suffix(text: &str) -> Option<String> {
    let (number, rest) = text.trim().split_once(char::is_whitespace)?;
    let unit = rest.trim();
    if unit.is_empty() || number.parse::<f64>().is_err() {
        return None;
    }
    Some(unit.to_string())
}

/// Parse a YAML document into a top-level mapping.
pub fn parse_yaml(text: &str) -> Result<Map<String, Value>, ConfigurationError> {
    let value: Value =
        serde_saphyr::from_str(text).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ConfigurationError::Parse(format!(
            "expected a mapping at the top level, found {}",
            value_kind(&other)
        ))),
    }
}

/// Read and parse a YAML declaration file.
pub fn load_yaml_file(path: &Path) -> Result<Map<String, Value>, ConfigurationError> {
    let content = fs::read_to_string(path)
        .map_err(|e| ConfigurationError::Io(format!("{}: {e}", path.display())))?;
    parse_yaml(&content)
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}
