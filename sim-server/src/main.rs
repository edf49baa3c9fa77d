//! Runs the telemetry node on a PC.
//!
//! A supervisor plays the part of the chip: it boots the device, waits for the
//! boot to end in a deep sleep or a reset, then boots it again. Retained
//! memory survives sleeps and is wiped on resets, like RTC RAM.

mod binder;
mod config;
mod peripherals;
mod platform;

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use moe_telemetry::clock::SystemClock;
use moe_telemetry::sim::{InstantTime, MemoryTarget};
use moe_telemetry::update::firmware::IMAGE_MAGIC;
use moe_telemetry::{Device, DeviceContext, Platform, RetainedCell};
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::binder::AxumBinder;
use crate::config::SimConfig;
use crate::peripherals::{collaborators, Keyboard};
use crate::platform::{BootEnd, FileBackend, SimPower, SimSystem};

static RETAINED: RetainedCell = RetainedCell::new();

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("sim_server=debug,moe_telemetry=debug,tower_http=debug,display=info,uplink=info")
        .init();

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("sim.ron"));
    let config = if path.exists() {
        SimConfig::load(&path)?
    } else {
        warn!("{} not found, using built-in defaults", path.display());
        SimConfig::default()
    };
    info!(
        "simulating {} on port {}, store at {}",
        config.device.firmware_version,
        config.device.http_port,
        config.storage_path.display()
    );

    let runtime = Handle::current();
    tokio::task::spawn_blocking(move || supervise(config, runtime))
        .await
        .context("supervisor panicked")?
}

fn supervise(config: SimConfig, runtime: Handle) -> anyhow::Result<()> {
    let backend = Arc::new(FileBackend::new(&config.storage_path));
    let radio = Arc::new(config.radio());
    let target = Arc::new(MemoryTarget::new(vec![IMAGE_MAGIC]));
    let keyboard = Keyboard::spawn();

    for boot in 1u64.. {
        info!("boot #{}", boot);
        let (tx, rx) = mpsc::channel();
        let platform = Platform {
            backend: backend.clone(),
            radio: radio.clone(),
            binder: Arc::new(AxumBinder::new(runtime.clone())),
            target: target.clone(),
            power: Arc::new(SimPower::new(tx.clone())),
            system: Arc::new(SimSystem::new(tx)),
            clock: Arc::new(SystemClock),
            time: Arc::new(InstantTime),
        };
        let ctx = DeviceContext::assemble(config.device.clone(), platform, &RETAINED);

        let mut device = Device::new(ctx.clone(), collaborators(&keyboard));
        thread::Builder::new()
            .name(format!("foreground-{}", boot))
            .spawn(move || {
                device.boot();
                device.run();
            })
            .context("spawning foreground")?;

        let end = rx.recv().context("every sender dropped without a power event")?;
        ctx.shutdown();
        match end {
            BootEnd::Slept(plan) => {
                let real = plan.timer / config.time_scale.max(1);
                info!(
                    "deep sleep {}s (real {:?}), wake on GPIO{} {:?}",
                    plan.timer.as_secs(),
                    real,
                    plan.wake_pin,
                    plan.wake_level
                );
                thread::sleep(real);
            }
            BootEnd::Restarted(cause) => {
                info!("reset ({:?})", cause);
                if let Some(image) = target.next_boot_image() {
                    info!("booting new {} byte image", image.len());
                }
                RETAINED.reset();
            }
        }
    }
    Ok(())
}
