//! JSON bridge for seeding a [`SharedState`] from a document.
//!
//! Objects are flattened into dotted paths; arrays and scalars become leaf
//! values. `{"environment": {"temperature": 0.6}}` turns into a single
//! `set("environment.temperature", 0.6)`.

use std::time::Duration;

use crate::state::SharedState;
use crate::value::Value;

/// Flatten `doc` into `(path, value)` pairs. A non-object root yields nothing.
pub fn flatten_json(doc: &serde_json::Value) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    if let serde_json::Value::Object(obj) = doc {
        for (k, v) in obj {
            flatten_into(k.clone(), v, &mut out);
        }
    }
    out
}

fn flatten_into(prefix: String, v: &serde_json::Value, out: &mut Vec<(String, Value)>) {
    match v {
        serde_json::Value::Object(obj) if !obj.is_empty() => {
            for (k, child) in obj {
                flatten_into(format!("{prefix}.{k}"), child, out);
            }
        }
        other => out.push((prefix, Value::from(other.clone()))),
    }
}

/// Write every leaf of `doc` into `state`. Returns how many fields were set.
pub fn seed_from_json(state: &SharedState, doc: &serde_json::Value, ttl: Option<Duration>) -> usize {
    let fields = flatten_json(doc);
    let count = fields.len();
    for (path, value) in fields {
        match ttl {
            Some(ttl) => state.set_with_ttl(&path, value, ttl),
            None => state.set(&path, value),
        }
    }
    count
}

/// Parse a JSON string and seed `state` from it.
pub fn seed_from_str(state: &SharedState, json: &str) -> serde_json::Result<usize> {
    let doc: serde_json::Value = serde_json::from_str(json)?;
    Ok(seed_from_json(state, &doc, None))
}
