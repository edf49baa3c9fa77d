//! The one shared listening port.
//!
//! Whoever binds through the slot owns the port until it releases it. A second
//! owner is refused with [`ListenerError::PortConflict`], so callers must
//! release the other side first.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::*;

use crate::error::ListenerError;
use crate::http::{HttpBinder, HttpHandler, Listener};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerOwner {
    UpdateService,
    Portal,
}

struct Active {
    owner: ListenerOwner,
    listeners: Vec<Box<dyn Listener>>,
}

pub struct ListenerSlot {
    port: u16,
    binder: Arc<dyn HttpBinder>,
    active: Mutex<Option<Active>>,
}

impl ListenerSlot {
    pub fn new(port: u16, binder: Arc<dyn HttpBinder>) -> Self {
        Self {
            port,
            binder,
            active: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn holder(&self) -> Option<ListenerOwner> {
        self.lock().as_ref().map(|a| a.owner)
    }

    pub fn bind(&self, owner: ListenerOwner, handler: Arc<dyn HttpHandler>) -> Result<(), ListenerError> {
        let mut active = self.lock();
        if let Some(current) = active.as_ref() {
            return Err(ListenerError::PortConflict {
                port: self.port,
                holder: current.owner,
            });
        }
        let listener = self.binder.bind(self.port, handler)?;
        info!("listener: port {} bound by {:?}", self.port, owner);
        *active = Some(Active {
            owner,
            listeners: vec![listener],
        });
        Ok(())
    }

    /// Ties an extra socket (the captive DNS responder) to the current owner's
    /// lifetime. Refused, and closed, if `owner` does not hold the slot.
    pub fn attach(&self, owner: ListenerOwner, listener: Box<dyn Listener>) -> bool {
        let mut active = self.lock();
        match active.as_mut() {
            Some(a) if a.owner == owner => {
                a.listeners.push(listener);
                true
            }
            _ => {
                listener.close();
                false
            }
        }
    }

    /// Closes everything `owner` holds. Returns whether it held the slot.
    pub fn release(&self, owner: ListenerOwner) -> bool {
        let mut active = self.lock();
        match active.take() {
            Some(a) if a.owner == owner => {
                for listener in a.listeners {
                    listener.close();
                }
                info!("listener: port {} released by {:?}", self.port, owner);
                true
            }
            other => {
                *active = other;
                false
            }
        }
    }

    /// Closes whatever is bound.
    pub fn release_all(&self) {
        if let Some(a) = self.lock().take() {
            for listener in a.listeners {
                listener.close();
            }
            info!("listener: port {} released by {:?}", self.port, a.owner);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
