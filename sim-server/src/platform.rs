//! Host stand-ins for flash, power and reset.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Mutex, PoisonError};
use std::thread;

use moe_telemetry::error::StoreError;
use moe_telemetry::platform::{RestartCause, System};
use moe_telemetry::power::{PinLevel, PowerControl, SleepPlan};
use moe_telemetry::store::{Kind, StorageBackend, Value};
use tracing::{info, warn};

/// NVS as a JSON file. Every call reads and rewrites the file, so a crash
/// between calls never loses a completed write.
pub struct FileBackend {
    path: PathBuf,
    lock: Mutex<()>,
}

type Entries = BTreeMap<String, BTreeMap<String, Value>>;

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<Entries, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(Entries::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Entries::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, entries: &Entries) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn session<T>(&self, f: impl FnOnce(&mut Entries) -> (T, bool)) -> Result<T, StoreError> {
        let _session = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.load()?;
        let (result, dirty) = f(&mut entries);
        if dirty {
            self.save(&entries)?;
        }
        Ok(result)
    }
}

impl StorageBackend for FileBackend {
    fn read(&self, namespace: &str, key: &str, kind: Kind) -> Result<Option<Value>, StoreError> {
        self.session(|entries| {
            let value = entries
                .get(namespace)
                .and_then(|ns| ns.get(key))
                .filter(|v| v.kind() == kind)
                .cloned();
            (value, false)
        })
    }

    fn write(&self, namespace: &str, key: &str, value: &Value) -> Result<(), StoreError> {
        self.session(|entries| {
            entries
                .entry(namespace.to_string())
                .or_default()
                .insert(key.to_string(), value.clone());
            ((), true)
        })
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        self.session(|entries| {
            let removed = entries
                .get_mut(namespace)
                .and_then(|ns| ns.remove(key))
                .is_some();
            (removed, removed)
        })
    }

    fn take(&self, namespace: &str, key: &str, kind: Kind) -> Result<Option<Value>, StoreError> {
        self.session(|entries| {
            let taken = entries.get_mut(namespace).and_then(|ns| ns.remove(key));
            let dirty = taken.is_some();
            (taken.filter(|v| v.kind() == kind), dirty)
        })
    }
}

/// What ended the current boot.
#[derive(Debug)]
pub enum BootEnd {
    Slept(SleepPlan),
    Restarted(RestartCause),
}

/// Hands the sleep plan to the supervisor instead of powering down.
pub struct SimPower {
    door: Mutex<PinLevel>,
    events: Mutex<Sender<BootEnd>>,
}

impl SimPower {
    pub fn new(events: Sender<BootEnd>) -> Self {
        Self {
            door: Mutex::new(PinLevel::Low),
            events: Mutex::new(events),
        }
    }
}

impl PowerControl for SimPower {
    fn pin_level(&self, _pin: u8) -> PinLevel {
        *self.door.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn power_down(&self, plan: &SleepPlan) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.send(BootEnd::Slept(*plan)).is_err() {
            warn!("power-down with no supervisor listening");
        }
    }
}

/// Reports the restart, then parks the calling thread for good: on hardware
/// nothing after a reset runs either.
pub struct SimSystem {
    events: Mutex<Sender<BootEnd>>,
}

impl SimSystem {
    pub fn new(events: Sender<BootEnd>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }
}

impl System for SimSystem {
    fn restart(&self, cause: RestartCause) -> ! {
        info!("restart requested: {:?}", cause);
        {
            let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = events.send(BootEnd::Restarted(cause));
        }
        loop {
            thread::park();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use moe_telemetry::store::{keys, DurableStore};

    use super::*;

    fn temp_store(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("moe-{}-{}.json", name, std::process::id()));
        let _ = fs::remove_file(&path);
        path
    }

    #[test]
    fn values_survive_reopen() {
        let path = temp_store("reopen");
        let store = DurableStore::new(std::sync::Arc::new(FileBackend::new(&path)));
        store.set(keys::WIFI_SSID, "attic".to_string()).unwrap();
        store.set(keys::SLEEP_INTERVAL_MINUTES, 3).unwrap();
        store.set(keys::LOGO, vec![1, 2, 3]).unwrap();

        let reopened = DurableStore::new(std::sync::Arc::new(FileBackend::new(&path)));
        assert_eq!(reopened.get(keys::WIFI_SSID, String::new()), "attic");
        assert_eq!(reopened.get(keys::SLEEP_INTERVAL_MINUTES, 10), 3);
        assert_eq!(reopened.lookup(keys::LOGO), Some(vec![1, 2, 3]));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn take_clears_flag() {
        let path = temp_store("take");
        let store = DurableStore::new(std::sync::Arc::new(FileBackend::new(&path)));
        store.set(keys::FORCE_AP, true).unwrap();
        assert!(store.take_flag(keys::FORCE_AP));
        assert!(!store.take_flag(keys::FORCE_AP));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn corrupt_file_degrades_to_defaults() {
        let path = temp_store("corrupt");
        fs::write(&path, b"{not json").unwrap();
        let store = DurableStore::new(std::sync::Arc::new(FileBackend::new(&path)));
        assert!(!store.get(keys::MODE_CONTINUOUS, false));
        assert!(store.set(keys::MODE_CONTINUOUS, true).is_err());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn power_down_reaches_supervisor() {
        let (tx, rx) = mpsc::channel();
        let power = SimPower::new(tx);
        let plan = SleepPlan {
            timer: std::time::Duration::from_secs(600),
            wake_pin: 19,
            wake_level: PinLevel::High,
        };
        power.power_down(&plan);
        assert!(matches!(rx.try_recv(), Ok(BootEnd::Slept(p)) if p == plan));
    }
}
