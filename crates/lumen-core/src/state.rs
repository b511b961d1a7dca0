//! Thread-safe store of sensor and cognitive fields.
//!
//! Keys are dotted paths (`environment.temperature`). A key may hold a nested
//! map, in which case reads descend into it: after
//! `set("motion", {"accel": {"x": 0.2}})`, `get("motion.accel.x")` resolves to
//! `0.2`. An exact key always wins over a prefix.
//!
//! Every entry records when it was written and an optional TTL. Expiry is lazy:
//! an expired entry stays in the map until overwritten, but no read or
//! snapshot ever returns it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::time::{Clock, SystemClock};
use crate::value::Value;

#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    written_at: u64,
    ttl_ms: Option<u64>,
}

impl Entry {
    fn is_live(&self, now: u64) -> bool {
        match self.ttl_ms {
            Some(ttl) => now.saturating_sub(self.written_at) < ttl,
            None => true,
        }
    }
}

/// Resolve `path` against a key lookup: exact key first, then the longest
/// stored prefix whose value is a map, descending the remaining segments.
fn resolve<'m>(path: &str, lookup: impl Fn(&str) -> Option<&'m Value>) -> Option<&'m Value> {
    if let Some(v) = lookup(path) {
        return Some(v);
    }
    let mut end = path.len();
    while let Some(dot) = path[..end].rfind('.') {
        if let Some(v) = lookup(&path[..dot]) {
            return v.lookup(path[dot + 1..].split('.'));
        }
        end = dot;
    }
    None
}

fn is_well_formed(path: &str) -> bool {
    !path.is_empty() && path.split('.').all(|seg| !seg.is_empty())
}

/// Shared handle to the state store. Clones share the same underlying map.
#[derive(Clone)]
pub struct SharedState {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Write a value with no expiry.
    pub fn set(&self, path: &str, value: impl Into<Value>) {
        self.write(path, value.into(), None);
    }

    /// Write a value that reads as absent once `ttl` has elapsed.
    pub fn set_with_ttl(&self, path: &str, value: impl Into<Value>, ttl: Duration) {
        self.write(path, value.into(), Some(ttl.as_millis() as u64));
    }

    fn write(&self, path: &str, value: Value, ttl_ms: Option<u64>) {
        if !is_well_formed(path) {
            tracing::debug!("ignoring write to malformed path {path:?}");
            return;
        }
        let entry = Entry {
            value,
            written_at: self.clock.now_millis(),
            ttl_ms,
        };
        self.entries.lock().insert(path.to_string(), entry);
    }

    pub fn remove(&self, path: &str) -> bool {
        self.entries.lock().remove(path).is_some()
    }

    /// Read a value, or `default` when the path is missing or expired.
    pub fn get(&self, path: &str, default: impl Into<Value>) -> Value {
        let now = self.clock.now_millis();
        let entries = self.entries.lock();
        let found = resolve(path, |k| {
            entries
                .get(k)
                .filter(|e| e.is_live(now))
                .map(|e| &e.value)
        });
        match found {
            Some(v) => v.clone(),
            None => default.into(),
        }
    }

    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.get(path, Value::Null).as_f64()
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path, Value::Null).as_bool()
    }

    /// Number of stored keys, including expired ones not yet overwritten.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time deep copy of every live entry.
    ///
    /// The lock is held only while cloning; callers work on the copy.
    pub fn snapshot(&self) -> StateSnapshot {
        let now = self.clock.now_millis();
        let entries = {
            let guard = self.entries.lock();
            guard
                .iter()
                .filter(|(_, e)| e.is_live(now))
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect::<BTreeMap<_, _>>()
        };
        StateSnapshot {
            entries,
            taken_at_ms: now,
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable copy of the live state at one instant.
#[derive(Clone, Debug, Default)]
pub struct StateSnapshot {
    entries: BTreeMap<String, Value>,
    taken_at_ms: u64,
}

impl StateSnapshot {
    /// Build a snapshot directly, mostly for tests and offline replay.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            taken_at_ms: 0,
        }
    }

    pub fn taken_at_ms(&self) -> u64 {
        self.taken_at_ms
    }

    pub fn value(&self, path: &str) -> Option<&Value> {
        resolve(path, |k| self.entries.get(k))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.value(path).is_some()
    }

    pub fn get(&self, path: &str, default: impl Into<Value>) -> Value {
        match self.value(path) {
            Some(v) => v.clone(),
            None => default.into(),
        }
    }

    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.value(path).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.value(path).and_then(Value::as_bool)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.value(path).and_then(Value::as_str)
    }

    pub fn f64_or(&self, path: &str, default: f64) -> f64 {
        self.get_f64(path).unwrap_or(default)
    }

    pub fn bool_or(&self, path: &str, default: bool) -> bool {
        self.get_bool(path).unwrap_or(default)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.entries).unwrap_or(serde_json::Value::Null)
    }
}
