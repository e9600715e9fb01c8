//! Persisted-state boundary.
//!
//! Values are JSON with a lifetime in minutes. A record stored with
//! `reset = true` gets a fresh lifetime every time it is read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::clock::Clock;

/// Lifetime used when `set` is given none
pub const DEFAULT_MINUTES: u64 = 60;

/// Keyed get/set/remove store with expiry
pub trait Storage: Send + Sync {
    /// Value for `key`, or None if absent or expired
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value, minutes: Option<u64>, reset: bool);

    fn remove(&self, key: &str);
}

impl<T: Storage + ?Sized> Storage for Arc<T> {
    fn get(&self, key: &str) -> Option<Value> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Value, minutes: Option<u64>, reset: bool) {
        (**self).set(key, value, minutes, reset)
    }

    fn remove(&self, key: &str) {
        (**self).remove(key)
    }
}

/// One stored record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record {
    value: Value,
    minutes: u64,
    reset: bool,
    /// Clock time (ms) after which the record is dead
    expiry: u64,
}

/// In-process [`Storage`] driven by a [`Clock`]
#[derive(Clone)]
pub struct MemoryStorage {
    records: Arc<Mutex<HashMap<String, Record>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStorage {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.now().as_millis() as u64
    }

    fn expiry(&self, minutes: u64) -> u64 {
        self.now_ms().saturating_add(minutes.saturating_mul(60_000))
    }

    /// Number of records, expired ones included until next read
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<Value> {
        let now = self.now_ms();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.get(key)?;

        if now > record.expiry {
            trace!("storage: '{}' expired", key);
            records.remove(key);
            return None;
        }

        let value = record.value.clone();
        if record.reset {
            let minutes = record.minutes;
            let expiry = self.expiry(minutes);
            if let Some(r) = records.get_mut(key) {
                r.expiry = expiry;
            }
        }
        Some(value)
    }

    fn set(&self, key: &str, value: Value, minutes: Option<u64>, reset: bool) {
        let minutes = minutes.filter(|m| *m > 0).unwrap_or(DEFAULT_MINUTES);
        let record = Record {
            value,
            minutes,
            reset,
            expiry: self.expiry(minutes),
        };
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), record);
    }

    fn remove(&self, key: &str) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
    }
}
