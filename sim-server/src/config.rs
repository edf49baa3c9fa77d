use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use moe_telemetry::sim::SimRadio;
use moe_telemetry::Config;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SimConfig {
    pub device: Config,
    /// JSON file standing in for NVS.
    pub storage_path: PathBuf,
    /// Simulated seconds per real second while asleep.
    pub time_scale: u32,
    pub mac: [u8; 6],
    pub networks: Vec<Network>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq)]
pub struct Network {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    pub rssi: i8,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            device: Config {
                http_port: 8080,
                dns_port: 5353,
                ..Config::default()
            },
            storage_path: PathBuf::from("sim-store.json"),
            time_scale: 60,
            mac: [0x24, 0x6f, 0x28, 0x5e, 0xa1, 0x7c],
            networks: vec![Network {
                ssid: "home".to_string(),
                password: "secret".to_string(),
                rssi: -52,
            }],
        }
    }
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<SimConfig, Error> {
        let config = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: SimConfig = ron::from_str(&config)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn radio(&self) -> SimRadio {
        self.networks
            .iter()
            .fold(SimRadio::new(self.mac), |radio, n| {
                radio.with_network(&n.ssid, &n.password, n.rssi)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load() {
        let path = std::env::temp_dir().join(format!("sim-config-{}.ron", std::process::id()));
        std::fs::write(
            &path,
            r#"(
    device: (
        http_port: 9000,
        association_timeout_ms: 3000,
    ),
    storage_path: "/tmp/moe.json",
    networks: [
        Network(ssid: "attic", rssi: -70),
    ],
)"#,
        )
        .unwrap();

        let config = SimConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.device.http_port, 9000);
        assert_eq!(config.device.association_timeout_ms, 3000);
        assert_eq!(config.device.restart_delay_ms, 200);
        assert_eq!(config.storage_path, PathBuf::from("/tmp/moe.json"));
        assert_eq!(config.time_scale, 60);
        assert_eq!(
            config.networks,
            vec![Network {
                ssid: "attic".to_string(),
                password: String::new(),
                rssi: -70,
            }]
        );
    }

    #[test]
    fn radio_sees_configured_networks() {
        use moe_telemetry::radio::Radio;

        let radio = SimConfig::default().radio();
        let seen = radio.scan().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].ssid, "home");
        assert!(!seen[0].open);
    }
}
