//! The ESP32 station/AP driver behind the core `Radio` trait.

use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use common::ScanRecord;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi,
};
use esp_idf_sys::{self as sys, esp, EspError};
use log::*;
use moe_telemetry::error::RadioError;
use moe_telemetry::radio::{LinkInfo, Radio, WifiCredentials};

const AP_CHANNEL: u8 = 1;

pub struct EspRadio {
    wifi: Mutex<BlockingWifi<EspWifi<'static>>>,
    mac: [u8; 6],
}

fn driver(e: EspError) -> RadioError {
    RadioError::Driver(e.to_string())
}

impl EspRadio {
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let esp_wifi = EspWifi::new(modem, sysloop.clone(), Some(nvs))?;
        let mac = esp_wifi.sta_netif().get_mac()?;
        let wifi = BlockingWifi::wrap(esp_wifi, sysloop)?;
        Ok(Self {
            wifi: Mutex::new(wifi),
            mac,
        })
    }

    fn wifi(&self) -> MutexGuard<'_, BlockingWifi<EspWifi<'static>>> {
        self.wifi.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Switches to station mode without credentials so scans can run.
fn ensure_station(wifi: &mut BlockingWifi<EspWifi<'static>>) -> Result<(), EspError> {
    if !matches!(wifi.get_configuration()?, Configuration::Client(_)) {
        if wifi.is_started()? {
            wifi.stop()?;
        }
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
    }
    if !wifi.is_started()? {
        wifi.start()?;
    }
    Ok(())
}

/// The NUL-terminated SSID and signal of the associated AP.
fn associated_ap() -> Option<(String, i8)> {
    let mut ap_info = sys::wifi_ap_record_t::default();
    esp!(unsafe { sys::esp_wifi_sta_get_ap_info(&mut ap_info) }).ok()?;
    let len = ap_info.ssid.iter().position(|&c| c == 0).unwrap_or(ap_info.ssid.len());
    Some((String::from_utf8_lossy(&ap_info.ssid[..len]).into_owned(), ap_info.rssi))
}

impl Radio for EspRadio {
    fn begin_association(&self, credentials: &WifiCredentials) -> Result<(), RadioError> {
        let mut wifi = self.wifi();
        let auth_method = if credentials.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        let config = ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| RadioError::InvalidSsid(credentials.ssid.clone()))?,
            password: credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| RadioError::Driver("password too long".into()))?,
            auth_method,
            ..Default::default()
        };
        if wifi.is_started().map_err(driver)? {
            wifi.stop().map_err(driver)?;
        }
        wifi.set_configuration(&Configuration::Client(config))
            .map_err(driver)?;
        wifi.start().map_err(driver)?;
        wifi.wifi_mut().connect().map_err(driver)?;
        info!("wifi: associating with {:?}", credentials.ssid);
        Ok(())
    }

    fn is_associated(&self) -> bool {
        self.wifi().is_up().unwrap_or(false)
    }

    fn set_power_save(&self, enabled: bool) -> Result<(), RadioError> {
        let mode = if enabled {
            sys::wifi_ps_type_t_WIFI_PS_MAX_MODEM
        } else {
            sys::wifi_ps_type_t_WIFI_PS_NONE
        };
        esp!(unsafe { sys::esp_wifi_set_ps(mode) }).map_err(driver)?;
        debug!("wifi: power save {}", if enabled { "on" } else { "off" });
        Ok(())
    }

    fn scan(&self) -> Result<Vec<ScanRecord>, RadioError> {
        let mut wifi = self.wifi();
        ensure_station(&mut wifi).map_err(driver)?;
        let found = wifi.scan().map_err(driver)?;
        info!("wifi: scan found {} access points", found.len());
        Ok(found
            .into_iter()
            .filter(|ap| !ap.ssid.is_empty())
            .map(|ap| ScanRecord {
                ssid: ap.ssid.to_string(),
                rssi: ap.signal_strength,
                open: matches!(ap.auth_method, None | Some(AuthMethod::None)),
            })
            .collect())
    }

    fn start_access_point(&self, ssid: &str) -> Result<Ipv4Addr, RadioError> {
        let mut wifi = self.wifi();
        let config = AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| RadioError::InvalidSsid(ssid.to_string()))?,
            auth_method: AuthMethod::None,
            channel: AP_CHANNEL,
            ..Default::default()
        };
        if wifi.is_started().map_err(driver)? {
            wifi.stop().map_err(driver)?;
        }
        wifi.set_configuration(&Configuration::AccessPoint(config))
            .map_err(driver)?;
        wifi.start().map_err(driver)?;
        wifi.wait_netif_up().map_err(driver)?;
        let ip = wifi.wifi().ap_netif().get_ip_info().map_err(driver)?.ip;
        info!("wifi: access point {:?} up at {}", ssid, ip);
        Ok(ip)
    }

    fn shutdown(&self) -> Result<(), RadioError> {
        let mut wifi = self.wifi();
        if !wifi.is_started().map_err(driver)? {
            return Ok(());
        }
        if let Err(e) = wifi.disconnect() {
            debug!("wifi: disconnect before stop: {}", e);
        }
        wifi.stop().map_err(driver)?;
        info!("wifi: radio off");
        Ok(())
    }

    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    fn link_info(&self) -> LinkInfo {
        let wifi = self.wifi();
        if !wifi.is_up().unwrap_or(false) {
            return LinkInfo::default();
        }
        let ip = wifi.wifi().sta_netif().get_ip_info().ok().map(|info| info.ip);
        let (ssid, rssi) = associated_ap().unwrap_or_default();
        LinkInfo { ip, ssid, rssi }
    }
}
