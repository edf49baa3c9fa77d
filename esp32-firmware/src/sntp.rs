use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use esp_idf_svc::sntp::{EspSntp, SyncStatus};
use log::*;
use moe_telemetry::clock::TimeSource;
use moe_telemetry::error::TimeSyncError;

const POLL: Duration = Duration::from_millis(100);

/// SNTP against the IDF default pool. The client stays alive once started so
/// the clock keeps being corrected while awake.
#[derive(Default)]
pub struct EspTimeSource {
    sntp: Mutex<Option<EspSntp<'static>>>,
}

impl TimeSource for EspTimeSource {
    fn sync(&self, timeout: Duration) -> Result<(), TimeSyncError> {
        let mut sntp = self.sntp.lock().unwrap_or_else(PoisonError::into_inner);
        if sntp.is_none() {
            let client =
                EspSntp::new_default().map_err(|e| TimeSyncError::Unavailable(e.to_string()))?;
            *sntp = Some(client);
        }
        let Some(client) = sntp.as_ref() else {
            return Err(TimeSyncError::Unavailable("sntp not started".into()));
        };

        let started = Instant::now();
        while client.get_sync_status() != SyncStatus::Completed {
            if started.elapsed() >= timeout {
                return Err(TimeSyncError::Timeout(timeout));
            }
            thread::sleep(POLL);
        }
        info!("sntp: synchronised in {:?}", started.elapsed());
        Ok(())
    }
}
