//! Connectivity and power-mode orchestration for the MOE telemetry node.
//!
//! Everything in here is written against small platform traits so the same
//! logic runs on the ESP32 (`esp32-firmware`) and on a PC (`sim-server`).

pub mod assets;
pub mod clock;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod http;
pub mod listener;
pub mod metrics;
pub mod mode;
pub mod multipart;
pub mod platform;
pub mod portal;
pub mod power;
pub mod radio;
pub mod retained;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod store;
pub mod update;
pub mod wifi;

pub use config::Config;
pub use context::{DeviceContext, Platform};
pub use device::{Collaborators, CycleOutcome, Device};
pub use error::{Error, Result};
pub use retained::{OperatingMode, RetainedCell};
