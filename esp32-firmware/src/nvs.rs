//! NVS flash as the durable store backend.

use std::sync::{Mutex, PoisonError};

use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_sys::EspError;
use log::*;
use moe_telemetry::error::StoreError;
use moe_telemetry::store::{Kind, StorageBackend, Value};

/// NVS rejects key names longer than this.
const MAX_KEY_LEN: usize = 15;

pub struct NvsBackend {
    partition: EspDefaultNvsPartition,
    lock: Mutex<()>,
}

impl NvsBackend {
    pub fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            lock: Mutex::new(()),
        }
    }

    /// Opens `namespace` for one call and closes it on return.
    fn session<T>(
        &self,
        namespace: &str,
        f: impl FnOnce(&mut EspNvs<NvsDefault>) -> Result<T, EspError>,
    ) -> Result<T, StoreError> {
        let _session = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), namespace, true).map_err(unavailable)?;
        f(&mut nvs).map_err(unavailable)
    }
}

fn unavailable(e: EspError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn key_name(key: &str) -> &str {
    if key.len() <= MAX_KEY_LEN {
        return key;
    }
    let mut end = MAX_KEY_LEN;
    while !key.is_char_boundary(end) {
        end -= 1;
    }
    debug!("nvs: key {:?} truncated to {:?}", key, &key[..end]);
    &key[..end]
}

fn read_value(nvs: &EspNvs<NvsDefault>, key: &str, kind: Kind) -> Result<Option<Value>, EspError> {
    Ok(match kind {
        Kind::Str => match nvs.str_len(key)? {
            Some(len) => {
                let mut buf = vec![0u8; len + 1];
                nvs.get_str(key, &mut buf)?.map(|s| Value::Str(s.to_string()))
            }
            None => None,
        },
        Kind::Bool => nvs.get_u8(key)?.map(|v| Value::Bool(v != 0)),
        Kind::U8 => nvs.get_u8(key)?.map(Value::U8),
        Kind::Blob => match nvs.blob_len(key)? {
            Some(len) => {
                let mut buf = vec![0u8; len];
                nvs.get_blob(key, &mut buf)?.map(|b| Value::Blob(b.to_vec()))
            }
            None => None,
        },
    })
}

impl StorageBackend for NvsBackend {
    fn read(&self, namespace: &str, key: &str, kind: Kind) -> Result<Option<Value>, StoreError> {
        self.session(namespace, |nvs| read_value(nvs, key_name(key), kind))
    }

    fn write(&self, namespace: &str, key: &str, value: &Value) -> Result<(), StoreError> {
        let key = key_name(key);
        self.session(namespace, |nvs| match value {
            Value::Str(s) => nvs.set_str(key, s),
            Value::Bool(b) => nvs.set_u8(key, u8::from(*b)),
            Value::U8(v) => nvs.set_u8(key, *v),
            Value::Blob(b) => nvs.set_blob(key, b),
        })
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        self.session(namespace, |nvs| nvs.remove(key_name(key)))
    }

    fn take(&self, namespace: &str, key: &str, kind: Kind) -> Result<Option<Value>, StoreError> {
        let key = key_name(key);
        self.session(namespace, |nvs| {
            let value = read_value(nvs, key, kind)?;
            nvs.remove(key)?;
            Ok(value)
        })
    }
}
