use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::*;

use crate::clock::Clock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartCause {
    FirmwareInstalled,
    CredentialsSaved,
    FactoryReset,
    PortalRequested,
    PortalUnavailable,
    /// Deep sleep was requested but the chip kept running.
    SleepFailed,
}

pub trait System: Send + Sync {
    fn restart(&self, cause: RestartCause) -> !;
}

/// Restarts from a separate thread after `delay`, leaving the caller free to
/// finish its HTTP response.
pub fn restart_later(
    system: Arc<dyn System>,
    clock: Arc<dyn Clock>,
    delay: Duration,
    cause: RestartCause,
) {
    info!("platform: restart ({:?}) in {:?}", cause, delay);
    thread::spawn(move || {
        clock.sleep(delay);
        system.restart(cause);
    });
}
