//! Transport-neutral request handling.
//!
//! Route tables are plain data so each binder (ESP-IDF httpd on the device,
//! axum on the host) can register them its own way.

use std::borrow::Cow;
use std::io::{self, Read};
use std::sync::Arc;

use common::ErrorBody;
use serde::Serialize;

use crate::error::ListenerError;
use crate::platform::RestartCause;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub method: Method,
    pub path: &'static str,
}

impl Route {
    pub const fn get(path: &'static str) -> Self {
        Self {
            method: Method::Get,
            path,
        }
    }

    pub const fn post(path: &'static str) -> Self {
        Self {
            method: Method::Post,
            path,
        }
    }
}

pub struct Request<'a> {
    pub method: Method,
    pub path: &'a str,
    pub content_type: Option<&'a str>,
    pub body: &'a mut dyn Read,
}

impl Request<'_> {
    /// Reads the whole body, refusing anything longer than `limit`.
    pub fn read_body(&mut self, limit: usize) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        (&mut *self.body)
            .take(limit as u64 + 1)
            .read_to_end(&mut buf)?;
        if buf.len() > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("body exceeds {} bytes", limit),
            ));
        }
        Ok(buf)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Cow<'static, [u8]>,
}

impl Response {
    pub fn new(status: u16, content_type: &'static str, body: impl Into<Cow<'static, [u8]>>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }

    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(status, "application/json", body),
            Err(e) => Self::error(500, &e.to_string()),
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        let body = ErrorBody {
            error: message.to_string(),
        };
        let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
        Self::new(status, "application/json", bytes)
    }

    pub fn text(status: u16, text: &'static str) -> Self {
        Self::new(status, "text/plain", text.as_bytes())
    }

    pub fn html(body: String) -> Self {
        Self::new(200, "text/html; charset=utf-8", body.into_bytes())
    }

    pub fn not_found() -> Self {
        Self::error(404, "not found")
    }
}

/// What to do once the response has reached the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Followup {
    None,
    Restart(RestartCause),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub response: Response,
    pub followup: Followup,
}

impl Reply {
    pub fn then_restart(response: Response, cause: RestartCause) -> Self {
        Self {
            response,
            followup: Followup::Restart(cause),
        }
    }
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Self {
            response,
            followup: Followup::None,
        }
    }
}

pub trait HttpHandler: Send + Sync {
    fn routes(&self) -> &'static [Route];

    /// Whether requests matching no route should still reach [`handle`](Self::handle).
    fn captures_unmatched(&self) -> bool {
        false
    }

    fn handle(&self, request: Request<'_>) -> Reply;

    /// Called by the binder after the response has been written.
    fn complete(&self, followup: Followup);
}

/// An open listening socket. Closing it frees the port.
pub trait Listener: Send {
    fn close(self: Box<Self>);
}

pub trait HttpBinder: Send + Sync {
    fn bind(&self, port: u16, handler: Arc<dyn HttpHandler>) -> Result<Box<dyn Listener>, ListenerError>;
}

/// The media type without parameters, lowercased.
pub fn media_type(content_type: Option<&str>) -> Option<String> {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
}
