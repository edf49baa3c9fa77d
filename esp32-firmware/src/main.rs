mod http;
mod nvs;
mod ota;
mod peripherals;
mod sleep;
mod sntp;
mod wifi;

use std::sync::Arc;

use anyhow::Result;
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use log::*;
use moe_telemetry::clock::SystemClock;
use moe_telemetry::platform::{RestartCause, System};
use moe_telemetry::{Config, Device, DeviceContext, Platform, RetainedCell};

use crate::http::EspBinder;
use crate::nvs::NvsBackend;
use crate::ota::EspTarget;
use crate::peripherals::{collaborators, Button};
use crate::sleep::{EspPower, EspSystem};
use crate::sntp::EspTimeSource;
use crate::wifi::EspRadio;

/// Kept in RTC slow memory: survives deep sleep, loaded from the image on power-on.
#[link_section = ".rtc.data"]
static RETAINED: RetainedCell = RetainedCell::new();

const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");

fn main() -> Result<()> {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    let config = Config::default();
    info!(
        "MOE telemetry {} (built {})",
        config.firmware_version, BUILD_TIMESTAMP
    );
    ota::mark_running_valid();

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let platform = Platform {
        backend: Arc::new(NvsBackend::new(nvs.clone())),
        radio: Arc::new(EspRadio::new(peripherals.modem, sysloop, nvs)?),
        binder: Arc::new(EspBinder),
        target: Arc::new(EspTarget),
        power: Arc::new(EspPower::new(config.wake_pin)?),
        system: Arc::new(EspSystem),
        clock: Arc::new(SystemClock),
        time: Arc::new(EspTimeSource::default()),
    };
    let door_pin = config.wake_pin;
    let ctx = DeviceContext::assemble(config, platform, &RETAINED);

    let mut device = Device::new(ctx, collaborators(door_pin, Button::spawn()?));
    device.boot();
    device.run();

    warn!("power-down returned, resetting");
    EspSystem.restart(RestartCause::SleepFailed)
}
