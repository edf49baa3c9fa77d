use std::ops::Not;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    /// Sample, upload, deep-sleep on an interval.
    Normal,
    /// Stay associated and never deep-sleep.
    Continuous,
}

impl OperatingMode {
    pub fn from_continuous(continuous: bool) -> Self {
        if continuous {
            OperatingMode::Continuous
        } else {
            OperatingMode::Normal
        }
    }

    pub fn is_continuous(self) -> bool {
        self == OperatingMode::Continuous
    }
}

impl Not for OperatingMode {
    type Output = OperatingMode;

    fn not(self) -> OperatingMode {
        match self {
            OperatingMode::Normal => OperatingMode::Continuous,
            OperatingMode::Continuous => OperatingMode::Normal,
        }
    }
}

const MODE_NORMAL: u8 = 0;
const MODE_CONTINUOUS: u8 = 1;
const NO_TIMESTAMP: u32 = u32::MAX;

/// State that survives deep sleep but not a cold boot.
///
/// `const` constructible so the firmware can place one in RTC memory. The
/// atomics are at most 32 bits wide, the widest Xtensa supports.
pub struct RetainedCell {
    mode: AtomicU8,
    last_sleep_start: AtomicU32,
}

impl RetainedCell {
    pub const fn new() -> Self {
        Self {
            mode: AtomicU8::new(MODE_CONTINUOUS),
            last_sleep_start: AtomicU32::new(NO_TIMESTAMP),
        }
    }

    pub fn mode(&self) -> OperatingMode {
        match self.mode.load(Ordering::Acquire) {
            MODE_NORMAL => OperatingMode::Normal,
            _ => OperatingMode::Continuous,
        }
    }

    pub fn set_mode(&self, mode: OperatingMode) {
        let tag = match mode {
            OperatingMode::Normal => MODE_NORMAL,
            OperatingMode::Continuous => MODE_CONTINUOUS,
        };
        self.mode.store(tag, Ordering::Release);
    }

    /// Unix seconds at which the previous deep sleep began.
    pub fn last_sleep_start(&self) -> Option<u64> {
        match self.last_sleep_start.load(Ordering::Acquire) {
            NO_TIMESTAMP => None,
            t => Some(u64::from(t)),
        }
    }

    pub fn record_sleep_start(&self, unix_secs: u64) {
        let t = u32::try_from(unix_secs).unwrap_or(NO_TIMESTAMP - 1);
        self.last_sleep_start.store(t, Ordering::Release);
    }

    /// What a cold boot does to RTC memory.
    pub fn reset(&self) {
        self.mode.store(MODE_CONTINUOUS, Ordering::Release);
        self.last_sleep_start.store(NO_TIMESTAMP, Ordering::Release);
    }
}

impl Default for RetainedCell {
    fn default() -> Self {
        Self::new()
    }
}
