use std::net::Ipv4Addr;

use common::ScanRecord;

use crate::error::RadioError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub ip: Option<Ipv4Addr>,
    pub ssid: String,
    pub rssi: i8,
}

/// The WiFi driver as the orchestration layer sees it.
///
/// Methods take `&self`; implementations serialise access internally so the
/// radio can be shared between the foreground loop and HTTP handlers.
pub trait Radio: Send + Sync {
    /// Starts associating with `credentials` and returns without waiting.
    fn begin_association(&self, credentials: &WifiCredentials) -> Result<(), RadioError>;

    fn is_associated(&self) -> bool;

    fn set_power_save(&self, enabled: bool) -> Result<(), RadioError>;

    /// One blocking scan in station mode.
    fn scan(&self) -> Result<Vec<ScanRecord>, RadioError>;

    /// Starts an open access point and returns its address.
    fn start_access_point(&self, ssid: &str) -> Result<Ipv4Addr, RadioError>;

    /// Disconnects and turns the radio off.
    fn shutdown(&self) -> Result<(), RadioError>;

    fn mac_address(&self) -> [u8; 6];

    fn link_info(&self) -> LinkInfo;
}

pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// `prefix` followed by the last four hex digits of the station MAC.
pub fn access_point_name(prefix: &str, mac: [u8; 6]) -> String {
    format!("{}{:02X}{:02X}", prefix, mac[4], mac[5])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ap_name_uses_mac_suffix() {
        let mac = [0x24, 0x6f, 0x28, 0xa1, 0x0b, 0x3c];
        assert_eq!(access_point_name("MOE_Telemetry_", mac), "MOE_Telemetry_0B3C");
        assert_eq!(format_mac(mac), "24:6F:28:A1:0B:3C");
    }
}
