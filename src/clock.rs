use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::TimeSyncError;

/// Monotonic and wall-clock time. Timeouts are always measured on `now()`.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Seconds since the Unix epoch. Keeps counting through deep sleep on the
    /// device, even before the first network sync.
    fn unix_time(&self) -> u64;

    fn sleep(&self, duration: Duration);
}

/// Network time synchronisation (SNTP on the device).
pub trait TimeSource: Send + Sync {
    fn sync(&self, timeout: Duration) -> Result<(), TimeSyncError>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}
