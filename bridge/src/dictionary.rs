//! Per-device data dictionary
//!
//! Maps canonical dotted keys (`GROUP.ELEMENT`) to typed values. The same key
//! names one physical quantity whatever protocol produced it. Writes carry the
//! session epoch they were produced under and are rejected once the epoch has
//! moved on, so a completion arriving after `stop_communication` can never
//! repopulate a cleared dictionary.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A dictionary value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
    /// Enumerated status string (INDI light state, cover state, ...)
    Status(String),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Status(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) | Value::Status(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(v as f64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

#[derive(Debug, Default)]
struct Inner {
    epoch: u64,
    entries: BTreeMap<String, Value>,
}

/// Shared, epoch-guarded key/value store for one logical device
#[derive(Debug, Clone, Default)]
pub struct DataDictionary {
    inner: Arc<RwLock<Inner>>,
}

impl DataDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current session epoch
    pub fn epoch(&self) -> u64 {
        self.read().epoch
    }

    /// Start a new epoch and drop every entry. Returns the new epoch.
    pub fn invalidate(&self) -> u64 {
        let mut inner = self.write();
        inner.epoch += 1;
        inner.entries.clear();
        inner.epoch
    }

    /// Store a value, `None` deleting the key.
    ///
    /// Returns `false` without touching the map when `epoch` is stale.
    pub fn store(&self, epoch: u64, key: &str, value: Option<Value>) -> bool {
        let mut inner = self.write();
        if inner.epoch != epoch {
            return false;
        }
        match value {
            Some(value) => {
                inner.entries.insert(key.to_string(), value);
            }
            None => {
                inner.entries.remove(key);
            }
        }
        true
    }

    /// Store a boolean under `key` and its negation under `inverse_key`
    pub fn store_pair(&self, epoch: u64, key: &str, inverse_key: &str, value: Option<bool>) -> bool {
        let mut inner = self.write();
        if inner.epoch != epoch {
            return false;
        }
        match value {
            Some(v) => {
                inner.entries.insert(key.to_string(), Value::Bool(v));
                inner.entries.insert(inverse_key.to_string(), Value::Bool(!v));
            }
            None => {
                inner.entries.remove(key);
                inner.entries.remove(inverse_key);
            }
        }
        true
    }

    /// Remove every key of one property vector (`PREFIX.*`)
    pub fn remove_prefix(&self, epoch: u64, prefix: &str) -> bool {
        let mut inner = self.write();
        if inner.epoch != epoch {
            return false;
        }
        let dotted = format!("{}.", prefix);
        inner.entries.retain(|k, _| !k.starts_with(&dotted));
        true
    }

    /// Drop all entries without ending the session
    pub fn clear(&self, epoch: u64) -> bool {
        let mut inner = self.write();
        if inner.epoch != epoch {
            return false;
        }
        inner.entries.clear();
        true
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().entries.get(key).cloned()
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.read().entries.get(key).and_then(Value::as_f64)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.read().entries.get(key).and_then(Value::as_bool)
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.read()
            .entries
            .get(key)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().entries.keys().cloned().collect()
    }

    /// Copy of the whole map, sorted by key
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.read().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }
}
