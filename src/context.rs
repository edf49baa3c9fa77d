//! Wiring of one boot's components.

use std::sync::Arc;

use log::*;

use crate::clock::{Clock, TimeSource};
use crate::config::Config;
use crate::http::HttpBinder;
use crate::listener::ListenerSlot;
use crate::metrics::MetricsCache;
use crate::mode::ModeController;
use crate::platform::System;
use crate::portal::ProvisioningPortal;
use crate::power::{PowerControl, PowerScheduler};
use crate::radio::Radio;
use crate::retained::RetainedCell;
use crate::store::{DurableStore, StorageBackend};
use crate::update::firmware::UpdateTarget;
use crate::update::{UpdateRoutes, UpdateService};
use crate::wifi::WifiAssociationManager;

/// Everything that differs between the ESP32 and the host.
#[derive(Clone)]
pub struct Platform {
    pub backend: Arc<dyn StorageBackend>,
    pub radio: Arc<dyn Radio>,
    pub binder: Arc<dyn HttpBinder>,
    pub target: Arc<dyn UpdateTarget>,
    pub power: Arc<dyn PowerControl>,
    pub system: Arc<dyn System>,
    pub clock: Arc<dyn Clock>,
    pub time: Arc<dyn TimeSource>,
}

pub struct DeviceContext {
    pub config: Config,
    pub store: DurableStore,
    pub retained: &'static RetainedCell,
    pub mode: Arc<ModeController>,
    pub power: Arc<PowerScheduler>,
    pub metrics: Arc<MetricsCache>,
    pub listeners: Arc<ListenerSlot>,
    pub update: UpdateService,
    pub wifi: WifiAssociationManager,
    pub platform: Platform,
}

impl DeviceContext {
    /// Seeds the mode from the durable store and subscribes the scheduler.
    /// Nothing is bound and the radio is untouched.
    pub fn assemble(config: Config, platform: Platform, retained: &'static RetainedCell) -> Arc<Self> {
        let store = DurableStore::new(platform.backend.clone());
        let mode = Arc::new(ModeController::boot(store.clone(), retained));
        let power = Arc::new(PowerScheduler::new(
            store.clone(),
            retained,
            platform.radio.clone(),
            platform.power.clone(),
            platform.clock.clone(),
            config.wake_pin,
        ));
        mode.subscribe(power.clone());

        let metrics = Arc::new(MetricsCache::new());
        let listeners = Arc::new(ListenerSlot::new(config.http_port, platform.binder.clone()));
        let routes = Arc::new(UpdateRoutes {
            version: config.firmware_version.clone(),
            store: store.clone(),
            mode: mode.clone(),
            metrics: metrics.clone(),
            radio: platform.radio.clone(),
            target: platform.target.clone(),
            system: platform.system.clone(),
            clock: platform.clock.clone(),
            restart_delay: config.restart_delay(),
        });
        let update = UpdateService::new(listeners.clone(), routes);
        let wifi = WifiAssociationManager::new(
            store.clone(),
            platform.radio.clone(),
            platform.clock.clone(),
            platform.time.clone(),
            config.association_poll(),
        );

        debug!("context: assembled for firmware {}", config.firmware_version);
        Arc::new(Self {
            config,
            store,
            retained,
            mode,
            power,
            metrics,
            listeners,
            update,
            wifi,
            platform,
        })
    }

    pub fn portal(self: &Arc<Self>) -> ProvisioningPortal {
        ProvisioningPortal::new(self.clone())
    }

    /// Closes every socket this boot opened.
    pub fn shutdown(&self) {
        self.update.stop();
        self.listeners.release_all();
    }
}
