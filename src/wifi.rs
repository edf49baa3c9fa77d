//! Station association with stored credentials.

use std::sync::Arc;
use std::time::Duration;

use log::*;

use crate::clock::{Clock, TimeSource};
use crate::error::{StoreError, TimeSyncError};
use crate::radio::{Radio, WifiCredentials};
use crate::store::{keys, DurableStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    TimedOut,
    /// No usable credentials, or a portal was requested. Not an error.
    NotProvisioned,
}

pub struct WifiAssociationManager {
    store: DurableStore,
    radio: Arc<dyn Radio>,
    clock: Arc<dyn Clock>,
    time: Arc<dyn TimeSource>,
    poll_interval: Duration,
}

impl WifiAssociationManager {
    pub fn new(
        store: DurableStore,
        radio: Arc<dyn Radio>,
        clock: Arc<dyn Clock>,
        time: Arc<dyn TimeSource>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            radio,
            clock,
            time,
            poll_interval,
        }
    }

    /// Single bounded association attempt. Never starts an access point.
    pub fn connect(&self, timeout: Duration) -> ConnectOutcome {
        if self.store.take_flag(keys::FORCE_AP) {
            info!("wifi: portal requested, skipping association");
            return ConnectOutcome::NotProvisioned;
        }
        let Some(credentials) = load_credentials(&self.store) else {
            info!("wifi: no stored credentials");
            return ConnectOutcome::NotProvisioned;
        };

        info!("wifi: associating with {:?}", credentials.ssid);
        if let Err(e) = self.radio.begin_association(&credentials) {
            warn!("wifi: association could not start: {}", e);
            return ConnectOutcome::TimedOut;
        }

        let started = self.clock.now();
        loop {
            if self.radio.is_associated() {
                break;
            }
            if self.clock.now().duration_since(started) >= timeout {
                warn!("wifi: no association after {:?}", timeout);
                return ConnectOutcome::TimedOut;
            }
            self.clock.sleep(self.poll_interval);
        }

        if let Err(e) = self.radio.set_power_save(true) {
            warn!("wifi: could not enable power save: {}", e);
        }
        info!("wifi: connected, ip {:?}", self.radio.link_info().ip);
        ConnectOutcome::Connected
    }

    pub fn sync_time(&self, timeout: Duration) -> Result<(), TimeSyncError> {
        self.time
            .sync(timeout)
            .inspect(|_| info!("wifi: time synchronised"))
            .inspect_err(|e| warn!("wifi: {}", e))
    }
}

/// `None` when nothing usable is stored; an empty SSID counts as absent.
pub fn load_credentials(store: &DurableStore) -> Option<WifiCredentials> {
    let ssid = store.get(keys::WIFI_SSID, String::new());
    if ssid.is_empty() {
        return None;
    }
    let password = store.get(keys::WIFI_PASS, String::new());
    Some(WifiCredentials { ssid, password })
}

/// Persists `credentials` and drops any pending portal request.
pub fn save_credentials(store: &DurableStore, credentials: WifiCredentials) -> Result<(), StoreError> {
    store.set(keys::WIFI_SSID, credentials.ssid)?;
    store.set(keys::WIFI_PASS, credentials.password)?;
    store.remove(keys::FORCE_AP)?;
    Ok(())
}

pub fn erase_credentials(store: &DurableStore) -> Result<(), StoreError> {
    let removed = store.erase(
        keys::WIFI_SSID.namespace,
        &[keys::WIFI_SSID.name, keys::WIFI_PASS.name],
    )?;
    info!("wifi: credentials erased ({} keys)", removed);
    Ok(())
}

/// Makes the next boot open the provisioning portal.
pub fn request_portal(store: &DurableStore) -> Result<(), StoreError> {
    store.set(keys::FORCE_AP, true)
}
