//! The foreground side: boot, then sample, report and sleep.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use log::*;

use crate::context::DeviceContext;
use crate::error::Result;
use crate::metrics::{battery_percent, DeviceMetrics, DoorState};
use crate::platform::RestartCause;
use crate::power::SleepDecision;
use crate::retained::OperatingMode;
use crate::wifi::{self, ConnectOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ButtonEvent {
    DoubleClick,
    TripleClick,
    LongPress,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Readings {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub battery_mv: Option<u32>,
    pub door: Option<DoorState>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StatusMessage {
    Connecting,
    ConnectionTimeout,
    Online(Ipv4Addr),
    ClockUnsynced,
    Provisioning,
    Metrics(DeviceMetrics, OperatingMode),
    ModeChanged(OperatingMode),
    Restarting(RestartCause),
}

pub trait Sensors: Send {
    fn sample(&mut self) -> anyhow::Result<Readings>;
}

pub trait StatusDisplay: Send {
    fn show(&mut self, message: &StatusMessage);
}

pub trait TelemetryUplink: Send {
    fn push(&mut self, snapshot: &DeviceMetrics) -> anyhow::Result<()>;
}

/// Debounced button gestures since the last poll.
pub trait InputEvents: Send {
    fn poll(&mut self) -> Vec<ButtonEvent>;
}

pub struct Collaborators {
    pub sensors: Box<dyn Sensors>,
    pub display: Box<dyn StatusDisplay>,
    pub uplink: Box<dyn TelemetryUplink>,
    pub input: Box<dyn InputEvents>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Awake,
    Slept,
}

pub struct Device {
    ctx: Arc<DeviceContext>,
    parts: Collaborators,
    online: bool,
}

impl Device {
    pub fn new(ctx: Arc<DeviceContext>, parts: Collaborators) -> Self {
        Self {
            ctx,
            parts,
            online: false,
        }
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Connects and starts the update service. Never returns when the
    /// device is not provisioned.
    pub fn boot(&mut self) -> ConnectOutcome {
        let ctx = self.ctx.clone();
        self.parts.display.show(&StatusMessage::Connecting);

        let outcome = ctx.wifi.connect(ctx.config.association_timeout());
        match outcome {
            ConnectOutcome::Connected => {
                self.online = true;
                if let Err(e) = ctx.wifi.sync_time(ctx.config.time_sync_timeout()) {
                    warn!("device: continuing without synced time: {}", e);
                    self.parts.display.show(&StatusMessage::ClockUnsynced);
                }
                if let Err(e) = ctx.update.start() {
                    warn!("device: running without update service: {}", e);
                }
                let ip = ctx.platform.radio.link_info().ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
                self.parts.display.show(&StatusMessage::Online(ip));
            }
            ConnectOutcome::TimedOut => {
                warn!("device: continuing offline");
                self.parts.display.show(&StatusMessage::ConnectionTimeout);
            }
            ConnectOutcome::NotProvisioned => {
                self.parts.display.show(&StatusMessage::Provisioning);
                ctx.portal().run()
            }
        }
        outcome
    }

    /// One sample/report pass, ending in a sleep decision.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        let ctx = self.ctx.clone();
        if ctx.power.has_powered_down() {
            return CycleOutcome::Slept;
        }

        let readings = self.parts.sensors.sample().unwrap_or_else(|e| {
            warn!("device: sampling failed: {:#}", e);
            Readings::default()
        });
        if ctx.power.has_powered_down() {
            return CycleOutcome::Slept;
        }
        ctx.metrics.set_device_metrics(
            readings.temperature,
            readings.humidity,
            readings.battery_mv.map(battery_percent),
            readings.door,
        );
        let snapshot = ctx.metrics.snapshot();
        self.parts
            .display
            .show(&StatusMessage::Metrics(snapshot, ctx.mode.mode()));

        if ctx.power.has_powered_down() {
            return CycleOutcome::Slept;
        }
        if self.online {
            if let Err(e) = self.parts.uplink.push(&snapshot) {
                warn!("device: upload failed: {:#}", e);
            }
        }

        for event in self.parts.input.poll() {
            if let Err(e) = self.handle_input(event) {
                error!("device: {:?} failed: {}", event, e);
            }
            if ctx.power.has_powered_down() {
                return CycleOutcome::Slept;
            }
        }

        match ctx.power.maybe_sleep() {
            SleepDecision::Slept(_) | SleepDecision::AlreadyDown => CycleOutcome::Slept,
            SleepDecision::StayAwake => CycleOutcome::Awake,
        }
    }

    /// Cycles until a power-down. On hardware that never returns.
    pub fn run(&mut self) {
        loop {
            if self.run_cycle() == CycleOutcome::Slept {
                return;
            }
            if self.idle(self.ctx.config.continuous_sample_interval()) {
                return;
            }
        }
    }

    /// Waits out `period`, returning early if a request powered down.
    fn idle(&self, period: Duration) -> bool {
        let clock = &self.ctx.platform.clock;
        let step = Duration::from_secs(1);
        let started = clock.now();
        while clock.now().duration_since(started) < period {
            if self.ctx.power.has_powered_down() {
                return true;
            }
            clock.sleep(step.min(period.saturating_sub(clock.now().duration_since(started))));
        }
        self.ctx.power.has_powered_down()
    }

    pub fn handle_input(&mut self, event: ButtonEvent) -> Result<()> {
        info!("device: button {:?}", event);
        match event {
            ButtonEvent::DoubleClick => {
                let next = !self.ctx.mode.mode();
                self.parts.display.show(&StatusMessage::ModeChanged(next));
                self.ctx.mode.toggle_mode()?;
            }
            ButtonEvent::TripleClick => {
                wifi::request_portal(&self.ctx.store)?;
                self.restart(RestartCause::PortalRequested)
            }
            ButtonEvent::LongPress => {
                wifi::erase_credentials(&self.ctx.store)?;
                self.restart(RestartCause::FactoryReset)
            }
        }
        Ok(())
    }

    fn restart(&mut self, cause: RestartCause) -> ! {
        self.parts.display.show(&StatusMessage::Restarting(cause));
        self.ctx.shutdown();
        self.ctx.platform.system.restart(cause)
    }
}
