use std::sync::{Mutex, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoorState {
    Closed,
    Open,
}

impl DoorState {
    pub fn as_u8(self) -> u8 {
        match self {
            DoorState::Closed => 0,
            DoorState::Open => 1,
        }
    }
}

/// Last readings pushed in by the sampling side.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DeviceMetrics {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub battery_pct: Option<u8>,
    pub door: Option<DoorState>,
}

/// Read cache for status queries. Values are never computed here.
#[derive(Default)]
pub struct MetricsCache {
    snapshot: Mutex<DeviceMetrics>,
}

impl MetricsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-finite readings are stored as unknown.
    pub fn set_device_metrics(
        &self,
        temperature: Option<f32>,
        humidity: Option<f32>,
        battery_pct: Option<u8>,
        door: Option<DoorState>,
    ) {
        let metrics = DeviceMetrics {
            temperature: temperature.filter(|t| t.is_finite()).map(one_decimal),
            humidity: humidity.filter(|h| h.is_finite()).map(one_decimal),
            battery_pct: battery_pct.map(|b| b.min(100)),
            door,
        };
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = metrics;
    }

    pub fn snapshot(&self) -> DeviceMetrics {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn one_decimal(v: f32) -> f32 {
    (v * 10.0).round() / 10.0
}

const BATTERY_EMPTY_MV: u32 = 3300;
const BATTERY_FULL_MV: u32 = 4200;

/// Linear charge estimate for a single Li-ion cell.
pub fn battery_percent(millivolts: u32) -> u8 {
    let clamped = millivolts.clamp(BATTERY_EMPTY_MV, BATTERY_FULL_MV);
    ((clamped - BATTERY_EMPTY_MV) * 100 / (BATTERY_FULL_MV - BATTERY_EMPTY_MV)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_readings_become_unknown() {
        let cache = MetricsCache::new();
        cache.set_device_metrics(Some(f32::NAN), Some(41.26), Some(87), None);
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.temperature, None);
        assert_eq!(snapshot.humidity, Some(41.3));
        assert_eq!(snapshot.battery_pct, Some(87));
        assert_eq!(snapshot.door, None);
    }

    #[test]
    fn battery_mapping_clamps() {
        assert_eq!(battery_percent(3000), 0);
        assert_eq!(battery_percent(3300), 0);
        assert_eq!(battery_percent(3750), 50);
        assert_eq!(battery_percent(4200), 100);
        assert_eq!(battery_percent(4400), 100);
    }
}
