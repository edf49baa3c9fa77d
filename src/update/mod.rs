//! Background service: status, mode control, firmware and logo upload.
//!
//! The service owns nothing but its listener. Requests run on the binder's
//! worker threads, so the foreground loop is never blocked by it. Only the
//! foreground starts or stops it.

pub mod firmware;
mod routes;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::*;

pub use routes::UpdateRoutes;

use crate::error::ListenerError;
use crate::listener::{ListenerOwner, ListenerSlot};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ServiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ServiceState::Starting,
            2 => ServiceState::Running,
            3 => ServiceState::Stopping,
            _ => ServiceState::Stopped,
        }
    }
}

pub struct UpdateService {
    state: AtomicU8,
    slot: Arc<ListenerSlot>,
    routes: Arc<UpdateRoutes>,
}

impl UpdateService {
    pub fn new(slot: Arc<ListenerSlot>, routes: Arc<UpdateRoutes>) -> Self {
        Self {
            state: AtomicU8::new(ServiceState::Stopped as u8),
            slot,
            routes,
        }
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), ServiceState::Starting | ServiceState::Running)
    }

    /// Binds the shared port. A no-op unless stopped.
    pub fn start(&self) -> Result<(), ListenerError> {
        if self
            .state
            .compare_exchange(
                ServiceState::Stopped as u8,
                ServiceState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!("update: start ignored in {:?}", self.state());
            return Ok(());
        }

        match self.slot.bind(ListenerOwner::UpdateService, self.routes.clone()) {
            Ok(()) => {
                self.set_state(ServiceState::Running);
                info!("update: serving on port {}", self.slot.port());
                Ok(())
            }
            Err(e) => {
                self.set_state(ServiceState::Stopped);
                error!("update: could not start: {}", e);
                Err(e)
            }
        }
    }

    /// Closes the listener. In-flight requests finish on their own threads.
    pub fn stop(&self) {
        if self
            .state
            .compare_exchange(
                ServiceState::Running as u8,
                ServiceState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.slot.release(ListenerOwner::UpdateService);
        self.set_state(ServiceState::Stopped);
        info!("update: stopped");
    }

    fn set_state(&self, state: ServiceState) {
        self.state.store(state as u8, Ordering::Release);
    }
}
