use alloc::string::String;
use core::fmt;

use serde::de::{self, Deserializer, Unexpected, Visitor};
use serde::{Deserialize, Serialize};

/// Body of `GET /update/identity`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub version: String,
}

/// Body of `GET /update/device_info`.
///
/// Sensor fields are `null` until a reading has been pushed in, or when the
/// last reading was invalid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub version: String,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub battery: Option<u8>,
    pub door: Option<u8>,
    pub ip: String,
    pub mac: String,
    pub ssid: String,
    pub rssi: i8,
}

/// Body of `GET /update/mode` and of the `POST /update/mode` reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeState {
    pub continuous: bool,
}

/// Body of `POST /update/mode`. `continuous` accepts `true`/`false` or `1`/`0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct ModeRequest {
    #[serde(deserialize_with = "flag")]
    pub continuous: bool,
}

/// One entry of the portal's `GET /scan` list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub ssid: String,
    pub rssi: i8,
    pub open: bool,
}

/// Credentials submitted to the portal's `POST /save`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SaveRequest {
    pub ssid: String,
    #[serde(default)]
    pub pass: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    struct FlagVisitor;

    impl<'de> Visitor<'de> for FlagVisitor {
        type Value = bool;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a boolean, 0 or 1")
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<bool, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<bool, E> {
            match v {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(E::invalid_value(Unexpected::Unsigned(v), &self)),
            }
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<bool, E> {
            match v {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(E::invalid_value(Unexpected::Signed(v), &self)),
            }
        }
    }

    deserializer.deserialize_any(FlagVisitor)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn mode_request_accepts_bool_and_digit() {
        let r: ModeRequest = serde_json::from_str(r#"{"continuous":true}"#).unwrap();
        assert!(r.continuous);
        let r: ModeRequest = serde_json::from_str(r#"{"continuous":0}"#).unwrap();
        assert!(!r.continuous);
    }

    #[test]
    fn mode_request_rejects_other_values() {
        assert!(serde_json::from_str::<ModeRequest>(r#"{"continuous":2}"#).is_err());
        assert!(serde_json::from_str::<ModeRequest>(r#"{"continuous":"yes"}"#).is_err());
        assert!(serde_json::from_str::<ModeRequest>(r#"{}"#).is_err());
    }

    #[test]
    fn device_info_nulls_missing_readings() {
        let info = DeviceInfo {
            version: "1.2.0".into(),
            temperature: Some(21.5),
            humidity: None,
            battery: None,
            door: Some(1),
            ip: "192.168.1.20".into(),
            mac: "AA:BB:CC:DD:EE:FF".into(),
            ssid: "home".into(),
            rssi: -61,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["humidity"], serde_json::Value::Null);
        assert_eq!(json["battery"], serde_json::Value::Null);
        assert_eq!(json["door"], 1);
    }
}
