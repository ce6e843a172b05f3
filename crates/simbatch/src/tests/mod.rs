//! Integration tests for the batch harness
//!
//! Tests are organized by topic:
//! - `strategy` - Task expansion properties across strategies
//! - `output` - Artifact lifecycle shared by both writers
//! - `handler` - Serial and parallel runs, failures and restarts


use serde_json::{Map, Value};

/// Unwrap a `json!` object literal into a mapping
pub(crate) fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}
