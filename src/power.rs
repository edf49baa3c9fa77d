//! Deep-sleep scheduling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::*;

use crate::clock::Clock;
use crate::mode::{ModeChanged, ModeObserver};
use crate::radio::Radio;
use crate::retained::{OperatingMode, RetainedCell};
use crate::store::{keys, DurableStore};

const DEFAULT_INTERVAL_MINUTES: u8 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinLevel {
    Low,
    High,
}

impl PinLevel {
    pub fn opposite(self) -> Self {
        match self {
            PinLevel::Low => PinLevel::High,
            PinLevel::High => PinLevel::Low,
        }
    }
}

/// Wake sources for one deep sleep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SleepPlan {
    pub timer: Duration,
    pub wake_pin: u8,
    pub wake_level: PinLevel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepDecision {
    StayAwake,
    Slept(SleepPlan),
    /// Another caller already issued the power-down; nothing was done.
    AlreadyDown,
}

pub trait PowerControl: Send + Sync {
    fn pin_level(&self, pin: u8) -> PinLevel;

    /// Arms both wake sources and powers down. Never returns on hardware; the
    /// simulator returns once it has taken over.
    fn power_down(&self, plan: &SleepPlan);
}

/// `max(0, interval - (now - last_start))`; the whole interval when no sleep
/// has been recorded since cold boot.
pub fn remaining_sleep(interval: Duration, last_start: Option<u64>, now: u64) -> Duration {
    match last_start {
        None => interval,
        Some(start) => {
            let elapsed = Duration::from_secs(now.saturating_sub(start));
            interval.saturating_sub(elapsed)
        }
    }
}

pub struct PowerScheduler {
    store: DurableStore,
    retained: &'static RetainedCell,
    radio: Arc<dyn Radio>,
    power: Arc<dyn PowerControl>,
    clock: Arc<dyn Clock>,
    wake_pin: u8,
    powered_down: AtomicBool,
}

impl PowerScheduler {
    pub fn new(
        store: DurableStore,
        retained: &'static RetainedCell,
        radio: Arc<dyn Radio>,
        power: Arc<dyn PowerControl>,
        clock: Arc<dyn Clock>,
        wake_pin: u8,
    ) -> Self {
        Self {
            store,
            retained,
            radio,
            power,
            clock,
            wake_pin,
            powered_down: AtomicBool::new(false),
        }
    }

    pub fn interval(&self) -> Duration {
        let minutes = self
            .store
            .get(keys::SLEEP_INTERVAL_MINUTES, DEFAULT_INTERVAL_MINUTES);
        Duration::from_secs(u64::from(minutes) * 60)
    }

    pub fn maybe_sleep(&self) -> SleepDecision {
        if self.retained.mode() == OperatingMode::Continuous {
            return SleepDecision::StayAwake;
        }
        if self
            .powered_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("power: power-down already issued");
            return SleepDecision::AlreadyDown;
        }

        if let Err(e) = self.radio.shutdown() {
            warn!("power: radio shutdown failed, sleeping anyway: {}", e);
        }

        let now = self.clock.unix_time();
        let plan = SleepPlan {
            timer: remaining_sleep(self.interval(), self.retained.last_sleep_start(), now),
            wake_pin: self.wake_pin,
            wake_level: self.power.pin_level(self.wake_pin).opposite(),
        };
        self.retained.record_sleep_start(now);

        info!(
            "power: sleeping at {} for {}s, wake on GPIO{} {:?}",
            wall_clock(now),
            plan.timer.as_secs(),
            plan.wake_pin,
            plan.wake_level
        );
        self.power.power_down(&plan);
        SleepDecision::Slept(plan)
    }

    /// Set once a power-down has been issued from any thread.
    pub fn has_powered_down(&self) -> bool {
        self.powered_down.load(Ordering::Acquire)
    }
}

impl ModeObserver for PowerScheduler {
    fn on_mode_changed(&self, event: ModeChanged) {
        match event.current {
            OperatingMode::Continuous => {
                if let Err(e) = self.radio.set_power_save(false) {
                    warn!("power: could not disable power save: {}", e);
                }
            }
            OperatingMode::Normal => {
                self.maybe_sleep();
            }
        }
    }
}

fn wall_clock(unix_secs: u64) -> String {
    i64::try_from(unix_secs)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("t={}", unix_secs))
}
