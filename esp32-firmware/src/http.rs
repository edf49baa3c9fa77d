//! Binds core route tables on the ESP-IDF httpd.

use std::io;
use std::sync::Arc;

use embedded_svc::http::server::Request as EspRequest;
use embedded_svc::http::Headers;
use embedded_svc::io::{Read as _, Write as _};
use esp_idf_svc::http::server::{Configuration, EspHttpConnection, EspHttpServer};
use esp_idf_svc::http::Method as EspMethod;
use log::*;
use moe_telemetry::error::ListenerError;
use moe_telemetry::http::{HttpBinder, HttpHandler, Listener, Method, Reply, Request, Response};

const STACK_SIZE: usize = 16 * 1024;

pub struct EspBinder;

/// Adapts the connection to `std::io::Read` for the core handlers.
struct Body<'r, R>(&'r mut R);

impl<R: embedded_svc::io::Read> io::Read for Body<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0
            .read(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:?}", e)))
    }
}

fn serve(
    handler: &dyn HttpHandler,
    method: Method,
    mut req: EspRequest<&mut EspHttpConnection<'_>>,
) -> anyhow::Result<()> {
    let path = req.uri().split('?').next().unwrap_or("/").to_string();
    let content_type = req.header("Content-Type").map(str::to_owned);
    let routed = handler
        .routes()
        .iter()
        .any(|r| r.method == method && r.path == path);

    let reply: Reply = if routed || handler.captures_unmatched() {
        let mut body = Body(&mut req);
        handler.handle(Request {
            method,
            path: &path,
            content_type: content_type.as_deref(),
            body: &mut body,
        })
    } else {
        Response::not_found().into()
    };

    {
        let response = &reply.response;
        req.into_response(response.status, None, &[("Content-Type", response.content_type)])?
            .write_all(&response.body)?;
    }
    handler.complete(reply.followup);
    Ok(())
}

struct EspListener {
    port: u16,
    _server: EspHttpServer<'static>,
}

impl Listener for EspListener {
    fn close(self: Box<Self>) {
        let port = self.port;
        drop(self);
        info!("http: port {} closed", port);
    }
}

impl HttpBinder for EspBinder {
    fn bind(&self, port: u16, handler: Arc<dyn HttpHandler>) -> Result<Box<dyn Listener>, ListenerError> {
        let bind_error = |e: &dyn std::fmt::Display| ListenerError::Bind {
            port,
            reason: e.to_string(),
        };
        let conf = Configuration {
            http_port: port,
            stack_size: STACK_SIZE,
            uri_match_wildcard: true,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&conf).map_err(|e| bind_error(&e))?;

        for (esp_method, method) in [(EspMethod::Get, Method::Get), (EspMethod::Post, Method::Post)] {
            let handler = handler.clone();
            server
                .fn_handler::<anyhow::Error, _>("/*", esp_method, move |req| {
                    serve(handler.as_ref(), method, req)
                })
                .map_err(|e| bind_error(&e))?;
        }

        info!("http: listening on port {}", port);
        Ok(Box::new(EspListener {
            port,
            _server: server,
        }))
    }
}
