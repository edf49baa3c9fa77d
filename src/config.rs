use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by every component. The device uses the defaults; the
/// simulator overrides them from `sim.ron`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub firmware_version: String,
    pub association_timeout_ms: u64,
    pub association_poll_ms: u64,
    pub time_sync_timeout_ms: u64,
    pub restart_delay_ms: u64,
    pub continuous_sample_secs: u64,
    pub http_port: u16,
    pub dns_port: u16,
    pub ap_prefix: String,
    pub wake_pin: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            association_timeout_ms: 8_000,
            association_poll_ms: 100,
            time_sync_timeout_ms: 5_000,
            restart_delay_ms: 200,
            continuous_sample_secs: 30,
            http_port: 80,
            dns_port: 53,
            ap_prefix: "MOE_Telemetry_".to_string(),
            wake_pin: 19,
        }
    }
}

impl Config {
    pub fn association_timeout(&self) -> Duration {
        Duration::from_millis(self.association_timeout_ms)
    }

    pub fn association_poll(&self) -> Duration {
        Duration::from_millis(self.association_poll_ms)
    }

    pub fn time_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.time_sync_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn continuous_sample_interval(&self) -> Duration {
        Duration::from_secs(self.continuous_sample_secs)
    }
}
