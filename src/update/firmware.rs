//! Firmware upload into the inactive image slot.
//!
//! Start opens the slot, each Write appends at exactly the offset reached so
//! far, End finalises. The running image is only replaced by a successful End,
//! so any failure before it leaves the device bootable on the old firmware.

use std::io::{ErrorKind, Read};

use log::*;

use crate::error::UpdateError;

/// First byte of every ESP application image.
pub const IMAGE_MAGIC: u8 = 0xE9;

const CHUNK_SIZE: usize = 1024;

pub trait SlotWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), UpdateError>;
}

/// The inactive flash slot. One transaction per upload: `body` fills the slot
/// and the slot is finalised only if `body` returns `Ok`, otherwise aborted.
pub trait UpdateTarget: Send + Sync {
    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn SlotWriter) -> Result<u64, UpdateError>,
    ) -> Result<u64, UpdateError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadPhase {
    Writing,
    Finished,
    Failed,
}

pub struct FirmwareUpload<'w> {
    slot: &'w mut dyn SlotWriter,
    written: u64,
    phase: UploadPhase,
}

impl<'w> FirmwareUpload<'w> {
    pub fn start(slot: &'w mut dyn SlotWriter) -> Self {
        info!("update: firmware upload started");
        Self {
            slot,
            written: 0,
            phase: UploadPhase::Writing,
        }
    }

    pub fn phase(&self) -> UploadPhase {
        self.phase
    }

    pub fn write(&mut self, offset: u64, chunk: &[u8]) -> Result<(), UpdateError> {
        if self.phase != UploadPhase::Writing {
            return Err(UpdateError::Closed);
        }
        if offset != self.written {
            self.phase = UploadPhase::Failed;
            return Err(UpdateError::OutOfOrder {
                expected: self.written,
                got: offset,
            });
        }
        if let Err(e) = self.slot.write(chunk) {
            self.phase = UploadPhase::Failed;
            return Err(e);
        }
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn finish(&mut self) -> Result<u64, UpdateError> {
        match self.phase {
            UploadPhase::Writing if self.written == 0 => {
                self.phase = UploadPhase::Failed;
                Err(UpdateError::Empty)
            }
            UploadPhase::Writing => {
                self.phase = UploadPhase::Finished;
                info!("update: {} bytes written", self.written);
                Ok(self.written)
            }
            _ => Err(UpdateError::Closed),
        }
    }
}

/// Streams `image` into `target`. Returns the image size once finalised.
pub fn install_firmware(target: &dyn UpdateTarget, image: &mut dyn Read) -> Result<u64, UpdateError> {
    target.transaction(&mut |slot: &mut dyn SlotWriter| {
        let mut upload = FirmwareUpload::start(slot);
        let mut buf = [0u8; CHUNK_SIZE];
        let mut offset = 0u64;
        loop {
            let n = match image.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(UpdateError::Body(e)),
            };
            upload.write(offset, &buf[..n])?;
            offset += n as u64;
        }
        upload.finish()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryTarget;

    fn image(len: usize) -> Vec<u8> {
        let mut image = vec![IMAGE_MAGIC];
        image.extend((0..len - 1).map(|i| (i % 251) as u8));
        image
    }

    #[test]
    fn complete_upload_is_staged() {
        let target = MemoryTarget::new(b"old".to_vec());
        let fw = image(5000);
        let written = install_firmware(&target, &mut fw.as_slice()).unwrap();
        assert_eq!(written, 5000);
        assert_eq!(target.next_boot_image(), Some(fw));
        assert_eq!(target.running_image(), b"old");
    }

    #[test]
    fn write_failure_leaves_nothing_staged() {
        let target = MemoryTarget::new(b"old".to_vec());
        target.fail_writes_at(Some(2048));
        let err = install_firmware(&target, &mut image(5000).as_slice()).unwrap_err();
        assert!(matches!(err, UpdateError::Write { offset: 2048, .. }));
        assert_eq!(target.next_boot_image(), None);
        assert_eq!(target.running_image(), b"old");
    }

    #[test]
    fn bad_header_fails_at_end() {
        let target = MemoryTarget::new(Vec::new());
        let err = install_firmware(&target, &mut &b"not firmware"[..]).unwrap_err();
        assert!(matches!(err, UpdateError::Finish(_)));
        assert_eq!(target.next_boot_image(), None);
    }

    #[test]
    fn empty_image_is_rejected() {
        let target = MemoryTarget::new(Vec::new());
        assert!(matches!(
            install_firmware(&target, &mut &b""[..]),
            Err(UpdateError::Empty)
        ));
    }

    #[test]
    fn offsets_must_be_contiguous() {
        struct Sink(Vec<u8>);
        impl SlotWriter for Sink {
            fn write(&mut self, data: &[u8]) -> Result<(), UpdateError> {
                self.0.extend_from_slice(data);
                Ok(())
            }
        }

        let mut sink = Sink(Vec::new());
        let mut upload = FirmwareUpload::start(&mut sink);
        upload.write(0, b"abc").unwrap();
        assert!(matches!(
            upload.write(10, b"def"),
            Err(UpdateError::OutOfOrder {
                expected: 3,
                got: 10
            })
        ));
        assert_eq!(upload.phase(), UploadPhase::Failed);
        assert!(matches!(upload.write(3, b"def"), Err(UpdateError::Closed)));
        assert!(matches!(upload.finish(), Err(UpdateError::Closed)));
    }
}
