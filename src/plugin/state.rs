//! State objects handed to plugin hooks
//!
//! - [`SessionStore`] lives for one exchange (or one stdio session) and is only
//!   touched by that exchange's sequential plugin chain.
//! - [`GlobalStore`] lives for the whole run and is shared by every exchange.
//! - [`ResponseState`] records whether a plugin has answered the exchange.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Ties an exchange's scoped state and log entries together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CorrelationKey {
    connection: u64,
    sequence: u64,
}

impl CorrelationKey {
    pub fn new(connection: u64, sequence: u64) -> Self {
        Self {
            connection,
            sequence,
        }
    }

    pub fn connection(&self) -> u64 {
        self.connection
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.connection, self.sequence)
    }
}

/// Whether the exchange has already been answered by a plugin.
///
/// There is deliberately no way to reset it: once set it stays set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResponseState {
    has_been_set: bool,
}

impl ResponseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self) {
        self.has_been_set = true;
    }

    pub fn has_been_set(&self) -> bool {
        self.has_been_set
    }
}

/// Key/value store scoped to a single exchange
#[derive(Debug, Default, Clone)]
pub struct SessionStore {
    values: HashMap<String, Value>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Key/value store shared by every exchange for the lifetime of the run
#[derive(Debug, Default, Clone)]
pub struct GlobalStore {
    values: Arc<DashMap<String, Value>>,
}

impl GlobalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, v)| v)
    }

    /// Read-modify-write under the entry lock
    pub fn update<F>(&self, key: &str, f: F)
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let mut entry = self.values.entry(key.to_string()).or_insert(Value::Null);
        let current = if entry.is_null() { None } else { Some(&*entry) };
        let next = f(current);
        *entry = next;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
