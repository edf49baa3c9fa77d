//! Board inputs and outputs handed to the device loop.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use esp_idf_sys::{self as sys, esp};
use log::*;
use moe_telemetry::device::{
    ButtonEvent, Collaborators, InputEvents, Readings, Sensors, StatusDisplay, StatusMessage,
    TelemetryUplink,
};
use moe_telemetry::metrics::{DeviceMetrics, DoorState};
use moe_telemetry::power::PinLevel;

use crate::sleep::read_level;

/// PRG button on the Heltec board, active low.
const BUTTON_PIN: i32 = 0;
const SAMPLE_PERIOD: Duration = Duration::from_millis(20);
const CLICK_WINDOW: Duration = Duration::from_millis(600);
const LONG_PRESS: Duration = Duration::from_secs(3);

/// The reed contact pulls the door pin low while the door is shut.
pub struct DoorContact {
    pin: i32,
}

impl Sensors for DoorContact {
    fn sample(&mut self) -> anyhow::Result<Readings> {
        let door = match read_level(self.pin) {
            PinLevel::Low => DoorState::Closed,
            PinLevel::High => DoorState::Open,
        };
        Ok(Readings {
            door: Some(door),
            ..Readings::default()
        })
    }
}

pub struct LogDisplay;

impl StatusDisplay for LogDisplay {
    fn show(&mut self, message: &StatusMessage) {
        info!("display: {:?}", message);
    }
}

pub struct LogUplink;

impl TelemetryUplink for LogUplink {
    fn push(&mut self, snapshot: &DeviceMetrics) -> anyhow::Result<()> {
        let payload = serde_json::json!({
            "temperature": snapshot.temperature,
            "humidity": snapshot.humidity,
            "battery": snapshot.battery_pct,
            "door": snapshot.door.map(DoorState::as_u8),
        });
        info!("uplink: {}", payload);
        Ok(())
    }
}

/// Turns PRG button edges into click and long-press events on a sampling thread.
pub struct Button {
    events: Receiver<ButtonEvent>,
}

impl Button {
    pub fn spawn() -> anyhow::Result<Self> {
        esp!(unsafe { sys::gpio_reset_pin(BUTTON_PIN) })?;
        esp!(unsafe { sys::gpio_set_direction(BUTTON_PIN, sys::gpio_mode_t_GPIO_MODE_INPUT) })?;
        esp!(unsafe { sys::gpio_set_pull_mode(BUTTON_PIN, sys::gpio_pull_mode_t_GPIO_PULLUP_ONLY) })?;

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("button".into())
            .stack_size(4096)
            .spawn(move || watch(tx))?;
        Ok(Self { events: rx })
    }
}

fn watch(events: Sender<ButtonEvent>) {
    let mut pressed_at: Option<Instant> = None;
    let mut long_sent = false;
    let mut clicks = 0u8;
    let mut last_release = Instant::now();

    loop {
        let now = Instant::now();
        let down = read_level(BUTTON_PIN) == PinLevel::Low;
        let event = match (down, pressed_at) {
            (true, None) => {
                pressed_at = Some(now);
                long_sent = false;
                None
            }
            (true, Some(start)) if !long_sent && now - start >= LONG_PRESS => {
                long_sent = true;
                clicks = 0;
                Some(ButtonEvent::LongPress)
            }
            (false, Some(_)) => {
                pressed_at = None;
                if !long_sent {
                    clicks = clicks.saturating_add(1);
                    last_release = now;
                }
                None
            }
            (false, None) if clicks > 0 && now - last_release > CLICK_WINDOW => {
                let counted = std::mem::take(&mut clicks);
                match counted {
                    2 => Some(ButtonEvent::DoubleClick),
                    3 => Some(ButtonEvent::TripleClick),
                    n => {
                        debug!("button: {} clicks ignored", n);
                        None
                    }
                }
            }
            _ => None,
        };
        if let Some(event) = event {
            debug!("button: {:?}", event);
            if events.send(event).is_err() {
                return;
            }
        }
        thread::sleep(SAMPLE_PERIOD);
    }
}

impl InputEvents for Button {
    fn poll(&mut self) -> Vec<ButtonEvent> {
        self.events.try_iter().collect()
    }
}

pub fn collaborators(door_pin: u8, button: Button) -> Collaborators {
    Collaborators {
        sensors: Box::new(DoorContact {
            pin: i32::from(door_pin),
        }),
        display: Box::new(LogDisplay),
        uplink: Box::new(LogUplink),
        input: Box::new(button),
    }
}
