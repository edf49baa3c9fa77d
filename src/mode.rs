//! The single authority for the operating mode.
//!
//! `mode/continuous` in the durable store is the source of truth. The retained
//! cell is seeded from it once per boot and written through on every
//! transition.

use std::sync::{Arc, PoisonError, RwLock};

use log::*;

use crate::error::StoreError;
use crate::retained::{OperatingMode, RetainedCell};
use crate::store::{keys, DurableStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeChanged {
    pub previous: OperatingMode,
    pub current: OperatingMode,
}

pub trait ModeObserver: Send + Sync {
    fn on_mode_changed(&self, event: ModeChanged);
}

pub struct ModeController {
    store: DurableStore,
    retained: &'static RetainedCell,
    observers: RwLock<Vec<Arc<dyn ModeObserver>>>,
}

impl ModeController {
    pub fn boot(store: DurableStore, retained: &'static RetainedCell) -> Self {
        let mode = OperatingMode::from_continuous(store.get(keys::MODE_CONTINUOUS, false));
        retained.set_mode(mode);
        info!("mode: booting in {:?}", mode);
        Self {
            store,
            retained,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn ModeObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn mode(&self) -> OperatingMode {
        self.retained.mode()
    }

    /// Persists, mirrors into retained memory, then notifies subscribers on the
    /// caller's thread. For `Normal` that means the device is asleep before
    /// this returns; on the host it returns after the simulated power-down.
    ///
    /// A failed durable write is returned after the runtime transition has
    /// still been applied.
    pub fn set_mode(&self, mode: OperatingMode) -> Result<(), StoreError> {
        let previous = self.mode();
        let persisted = self.store.set(keys::MODE_CONTINUOUS, mode.is_continuous());
        if let Err(e) = &persisted {
            warn!("mode: {:?} will not survive a reboot: {}", mode, e);
        }
        self.retained.set_mode(mode);
        info!("mode: {:?} -> {:?}", previous, mode);

        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let event = ModeChanged {
            previous,
            current: mode,
        };
        for observer in observers {
            observer.on_mode_changed(event);
        }
        persisted
    }

    pub fn toggle_mode(&self) -> Result<OperatingMode, StoreError> {
        let next = !self.mode();
        self.set_mode(next).map(|_| next)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::sim::MemoryBackend;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ModeChanged>>);

    impl ModeObserver for Recorder {
        fn on_mode_changed(&self, event: ModeChanged) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn retained() -> &'static RetainedCell {
        Box::leak(Box::new(RetainedCell::new()))
    }

    #[test]
    fn durable_flag_seeds_mode() {
        let store = DurableStore::new(Arc::new(MemoryBackend::new()));
        let cell = retained();
        assert_eq!(ModeController::boot(store.clone(), cell).mode(), OperatingMode::Normal);

        store.set(keys::MODE_CONTINUOUS, true).unwrap();
        cell.set_mode(OperatingMode::Normal);
        assert_eq!(ModeController::boot(store, cell).mode(), OperatingMode::Continuous);
    }

    #[test]
    fn set_mode_persists_mirrors_and_notifies() {
        let store = DurableStore::new(Arc::new(MemoryBackend::new()));
        let cell = retained();
        let controller = ModeController::boot(store.clone(), cell);
        let recorder = Arc::new(Recorder::default());
        controller.subscribe(recorder.clone());

        controller.set_mode(OperatingMode::Continuous).unwrap();
        assert!(store.get(keys::MODE_CONTINUOUS, false));
        assert_eq!(cell.mode(), OperatingMode::Continuous);
        assert_eq!(
            recorder.0.lock().unwrap().as_slice(),
            &[ModeChanged {
                previous: OperatingMode::Normal,
                current: OperatingMode::Continuous
            }]
        );
    }

    #[test]
    fn toggle_flips_and_reports() {
        let store = DurableStore::new(Arc::new(MemoryBackend::new()));
        let controller = ModeController::boot(store, retained());
        assert_eq!(controller.toggle_mode().unwrap(), OperatingMode::Continuous);
        assert_eq!(controller.toggle_mode().unwrap(), OperatingMode::Normal);
    }

    #[test]
    fn failed_persist_still_applies() {
        let backend = Arc::new(MemoryBackend::new());
        let controller = ModeController::boot(DurableStore::new(backend.clone()), retained());
        backend.set_unavailable(true);
        assert!(controller.set_mode(OperatingMode::Continuous).is_err());
        assert_eq!(controller.mode(), OperatingMode::Continuous);
    }
}
