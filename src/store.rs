//! Flash-backed key/value persistence.
//!
//! Every call opens its own backend session and closes it before returning;
//! nothing holds a session across other logic. Reads never fail: a missing
//! namespace, a missing key, a type mismatch or a backend error all yield the
//! caller's default, the last one with a warning.

use std::marker::PhantomData;
use std::sync::Arc;

use log::*;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Str,
    Bool,
    U8,
    Blob,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Bool(bool),
    U8(u8),
    Blob(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Str(_) => Kind::Str,
            Value::Bool(_) => Kind::Bool,
            Value::U8(_) => Kind::U8,
            Value::Blob(_) => Kind::Blob,
        }
    }
}

/// One storage engine. Each method is a complete session.
pub trait StorageBackend: Send + Sync {
    fn read(&self, namespace: &str, key: &str, kind: Kind) -> Result<Option<Value>, StoreError>;

    fn write(&self, namespace: &str, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Returns whether the key existed.
    fn remove(&self, namespace: &str, key: &str) -> Result<bool, StoreError>;

    /// Reads and removes `key` within a single session.
    fn take(&self, namespace: &str, key: &str, kind: Kind) -> Result<Option<Value>, StoreError>;
}

pub trait StoreValue: Sized {
    const KIND: Kind;

    fn from_value(value: Value) -> Option<Self>;

    fn into_value(self) -> Value;
}

impl StoreValue for String {
    const KIND: Kind = Kind::Str;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    fn into_value(self) -> Value {
        Value::Str(self)
    }
}

impl StoreValue for bool {
    const KIND: Kind = Kind::Bool;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    fn into_value(self) -> Value {
        Value::Bool(self)
    }
}

impl StoreValue for u8 {
    const KIND: Kind = Kind::U8;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::U8(v) => Some(v),
            _ => None,
        }
    }

    fn into_value(self) -> Value {
        Value::U8(self)
    }
}

impl StoreValue for Vec<u8> {
    const KIND: Kind = Kind::Blob;

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    fn into_value(self) -> Value {
        Value::Blob(self)
    }
}

/// A typed `namespace/key` address.
pub struct Key<T> {
    pub namespace: &'static str,
    pub name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(namespace: &'static str, name: &'static str) -> Self {
        Self {
            namespace,
            name,
            _value: PhantomData,
        }
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

pub mod keys {
    use super::Key;

    pub const WIFI_SSID: Key<String> = Key::new("wifi", "ssid");
    pub const WIFI_PASS: Key<String> = Key::new("wifi", "pass");
    pub const FORCE_AP: Key<bool> = Key::new("wifi", "force_ap");
    pub const MODE_CONTINUOUS: Key<bool> = Key::new("mode", "continuous");
    pub const SLEEP_INTERVAL_MINUTES: Key<u8> = Key::new("sleep", "interval_minutes");
    pub const LOGO: Key<Vec<u8>> = Key::new("assets", "logo");
}

#[derive(Clone)]
pub struct DurableStore {
    backend: Arc<dyn StorageBackend>,
}

impl DurableStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn get<T: StoreValue>(&self, key: Key<T>, default: T) -> T {
        self.lookup(key).unwrap_or(default)
    }

    /// Like [`get`](Self::get) but distinguishes an absent key.
    pub fn lookup<T: StoreValue>(&self, key: Key<T>) -> Option<T> {
        match self.backend.read(key.namespace, key.name, T::KIND) {
            Ok(value) => value.and_then(T::from_value),
            Err(e) => {
                warn!("store: {}/{} unavailable, using default: {}", key.namespace, key.name, e);
                None
            }
        }
    }

    pub fn set<T: StoreValue>(&self, key: Key<T>, value: T) -> Result<(), StoreError> {
        self.backend
            .write(key.namespace, key.name, &value.into_value())
            .inspect_err(|e| warn!("store: write {}/{} failed: {}", key.namespace, key.name, e))
    }

    pub fn remove<T>(&self, key: Key<T>) -> Result<bool, StoreError> {
        self.backend.remove(key.namespace, key.name)
    }

    /// Removes `names` from `namespace`, returning how many were present.
    pub fn erase(&self, namespace: &str, names: &[&str]) -> Result<usize, StoreError> {
        let mut removed = 0;
        for name in names {
            if self.backend.remove(namespace, name)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Atomic read-and-clear of a one-shot flag.
    pub fn take_flag(&self, key: Key<bool>) -> bool {
        match self.backend.take(key.namespace, key.name, Kind::Bool) {
            Ok(Some(Value::Bool(flag))) => flag,
            Ok(_) => false,
            Err(e) => {
                warn!("store: take {}/{} failed: {}", key.namespace, key.name, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryBackend;

    fn store() -> (Arc<MemoryBackend>, DurableStore) {
        let backend = Arc::new(MemoryBackend::new());
        (backend.clone(), DurableStore::new(backend))
    }

    #[test]
    fn missing_keys_yield_defaults() {
        let (_, store) = store();
        assert_eq!(store.get(keys::WIFI_SSID, String::new()), "");
        assert!(!store.get(keys::MODE_CONTINUOUS, false));
        assert_eq!(store.get(keys::SLEEP_INTERVAL_MINUTES, 10), 10);
    }

    #[test]
    fn values_round_trip_by_type() {
        let (_, store) = store();
        store.set(keys::SLEEP_INTERVAL_MINUTES, 3).unwrap();
        store.set(keys::WIFI_SSID, "attic".to_string()).unwrap();
        assert_eq!(store.get(keys::SLEEP_INTERVAL_MINUTES, 10), 3);
        assert_eq!(store.get(keys::WIFI_SSID, String::new()), "attic");
    }

    #[test]
    fn type_mismatch_reads_as_default() {
        let (backend, store) = store();
        backend
            .write("sleep", "interval_minutes", &Value::Str("five".into()))
            .unwrap();
        assert_eq!(store.get(keys::SLEEP_INTERVAL_MINUTES, 10), 10);
    }

    #[test]
    fn unavailable_backend_degrades_to_default() {
        let (backend, store) = store();
        store.set(keys::MODE_CONTINUOUS, true).unwrap();
        backend.set_unavailable(true);
        assert!(!store.get(keys::MODE_CONTINUOUS, false));
        assert!(store.set(keys::MODE_CONTINUOUS, false).is_err());
        backend.set_unavailable(false);
        assert!(store.get(keys::MODE_CONTINUOUS, false));
    }

    #[test]
    fn force_flag_is_read_once() {
        let (_, store) = store();
        store.set(keys::FORCE_AP, true).unwrap();
        assert!(store.take_flag(keys::FORCE_AP));
        assert!(!store.take_flag(keys::FORCE_AP));
        assert_eq!(store.lookup(keys::FORCE_AP), None);
    }

    #[test]
    fn erase_counts_present_keys() {
        let (_, store) = store();
        store.set(keys::WIFI_SSID, "attic".to_string()).unwrap();
        assert_eq!(store.erase("wifi", &["ssid", "pass"]).unwrap(), 1);
        assert_eq!(store.lookup(keys::WIFI_SSID), None);
    }
}
