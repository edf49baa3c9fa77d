//! Synthetic sensors, a log-backed display and keyboard buttons.

use std::io::BufRead;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use moe_telemetry::device::{
    ButtonEvent, Collaborators, InputEvents, Readings, Sensors, StatusDisplay, StatusMessage,
    TelemetryUplink,
};
use moe_telemetry::metrics::{DeviceMetrics, DoorState};
use rand::Rng;
use tracing::{info, warn};

pub struct RandomSensors;

impl Sensors for RandomSensors {
    fn sample(&mut self) -> anyhow::Result<Readings> {
        let mut rng = rand::thread_rng();
        Ok(Readings {
            temperature: Some(rng.gen_range(17.0..25.0)),
            humidity: Some(rng.gen_range(30.0..60.0)),
            battery_mv: Some(rng.gen_range(3500..4200)),
            door: Some(if rng.gen_bool(0.2) {
                DoorState::Open
            } else {
                DoorState::Closed
            }),
        })
    }
}

pub struct LogDisplay;

impl StatusDisplay for LogDisplay {
    fn show(&mut self, message: &StatusMessage) {
        info!(target: "display", "{:?}", message);
    }
}

pub struct LogUplink;

impl TelemetryUplink for LogUplink {
    fn push(&mut self, snapshot: &DeviceMetrics) -> anyhow::Result<()> {
        info!(target: "uplink", "{}", serde_json::to_string(&Upload::from(snapshot))?);
        Ok(())
    }
}

#[derive(serde::Serialize)]
struct Upload {
    temperature: Option<f32>,
    humidity: Option<f32>,
    battery: Option<u8>,
    door: Option<u8>,
}

impl From<&DeviceMetrics> for Upload {
    fn from(m: &DeviceMetrics) -> Self {
        Self {
            temperature: m.temperature,
            humidity: m.humidity,
            battery: m.battery_pct,
            door: m.door.map(DoorState::as_u8),
        }
    }
}

/// `d`, `t` and `l` on stdin stand for double click, triple click and long
/// press. Shared across boots like the physical button.
#[derive(Clone)]
pub struct Keyboard {
    events: Arc<Mutex<Receiver<ButtonEvent>>>,
}

impl Keyboard {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        let reader = thread::Builder::new().name("keyboard".into()).spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let event = match line.trim() {
                    "d" => ButtonEvent::DoubleClick,
                    "t" => ButtonEvent::TripleClick,
                    "l" => ButtonEvent::LongPress,
                    "" => continue,
                    other => {
                        warn!("unknown key {:?}, use d, t or l", other);
                        continue;
                    }
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        if let Err(e) = reader {
            warn!("no keyboard input: {}", e);
        }
        Self {
            events: Arc::new(Mutex::new(rx)),
        }
    }
}

impl InputEvents for Keyboard {
    fn poll(&mut self) -> Vec<ButtonEvent> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.try_iter().collect()
    }
}

pub fn collaborators(keyboard: &Keyboard) -> Collaborators {
    Collaborators {
        sensors: Box::new(RandomSensors),
        display: Box::new(LogDisplay),
        uplink: Box::new(LogUplink),
        input: Box::new(keyboard.clone()),
    }
}
