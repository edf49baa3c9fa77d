use std::time::Duration;

use thiserror::Error;

use crate::listener::ListenerOwner;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Radio(#[from] RadioError),
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    TimeSync(#[from] TimeSyncError),
}

/// Durable storage could not be read or written. Reads degrade to defaults.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("radio driver: {0}")]
    Driver(String),
    #[error("invalid network name {0:?}")]
    InvalidSsid(String),
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("could not open update slot: {0}")]
    Begin(String),
    #[error("write at offset {offset} failed: {reason}")]
    Write { offset: u64, reason: String },
    #[error("chunk at offset {got} out of order, expected {expected}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("upload already closed")]
    Closed,
    #[error("empty firmware image")]
    Empty,
    #[error("could not finalize image: {0}")]
    Finish(String),
    #[error("request body: {0}")]
    Body(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("port {port} is held by {holder:?}")]
    PortConflict { port: u16, holder: ListenerOwner },
    #[error("could not bind port {port}: {reason}")]
    Bind { port: u16, reason: String },
}

#[derive(Debug, Error)]
pub enum TimeSyncError {
    #[error("time sync did not complete within {0:?}")]
    Timeout(Duration),
    #[error("time source unavailable: {0}")]
    Unavailable(String),
}
