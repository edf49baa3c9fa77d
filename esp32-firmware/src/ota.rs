//! The inactive OTA partition as the firmware update target.

use esp_idf_svc::ota::{EspOta, EspOtaUpdate};
use log::*;
use moe_telemetry::error::UpdateError;
use moe_telemetry::update::firmware::{SlotWriter, UpdateTarget};

pub struct EspTarget;

struct OtaSlot<'a> {
    update: EspOtaUpdate<'a>,
    offset: u64,
}

impl SlotWriter for OtaSlot<'_> {
    fn write(&mut self, data: &[u8]) -> Result<(), UpdateError> {
        self.update.write(data).map_err(|e| UpdateError::Write {
            offset: self.offset,
            reason: e.to_string(),
        })?;
        self.offset += data.len() as u64;
        Ok(())
    }
}

impl UpdateTarget for EspTarget {
    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn SlotWriter) -> Result<u64, UpdateError>,
    ) -> Result<u64, UpdateError> {
        let mut ota = EspOta::new().map_err(|e| UpdateError::Begin(e.to_string()))?;
        let update = ota
            .initiate_update()
            .map_err(|e| UpdateError::Begin(e.to_string()))?;
        let mut slot = OtaSlot { update, offset: 0 };

        match body(&mut slot) {
            Ok(written) => {
                slot.update
                    .complete()
                    .map_err(|e| UpdateError::Finish(e.to_string()))?;
                info!("ota: {} byte image set for next boot", written);
                Ok(written)
            }
            Err(e) => {
                if let Err(abort) = slot.update.abort() {
                    warn!("ota: abort failed: {}", abort);
                }
                Err(e)
            }
        }
    }
}

/// Confirms the running image so the bootloader does not roll it back.
pub fn mark_running_valid() {
    let marked = EspOta::new().and_then(|mut ota| {
        let running = ota.get_running_slot()?;
        info!("ota: running from {}", running.label);
        ota.mark_running_slot_valid()
    });
    if let Err(e) = marked {
        warn!("ota: could not mark running image valid: {}", e);
    }
}
