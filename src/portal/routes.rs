use std::net::Ipv4Addr;
use std::sync::mpsc::Sender;

use common::{Ack, SaveRequest, ScanRecord};
use log::*;

use crate::assets;
use crate::http::{media_type, Followup, HttpHandler, Method, Reply, Request, Response, Route};
use crate::multipart;
use crate::platform::RestartCause;
use crate::radio::WifiCredentials;
use crate::store::DurableStore;
use crate::wifi;

const ROUTES: &[Route] = &[
    Route::get("/"),
    Route::get("/scan"),
    Route::get("/logo.png"),
    Route::post("/save"),
    Route::post("/factory_reset"),
];

const SAVE_BODY_LIMIT: usize = 4096;
const SSID_MAX: usize = 32;
const PASS_MAX: usize = 64;

pub struct PortalRoutes {
    pub(crate) version: String,
    pub(crate) ap_ip: Ipv4Addr,
    pub(crate) networks: Vec<ScanRecord>,
    pub(crate) store: DurableStore,
    pub(crate) restarts: Sender<RestartCause>,
}

impl PortalRoutes {
    fn save(&self, request: &mut Request<'_>) -> Reply {
        let body = match request.read_body(SAVE_BODY_LIMIT) {
            Ok(body) => body,
            Err(e) => return Response::error(400, &e.to_string()).into(),
        };
        let save = match parse_save(request.content_type, &body) {
            Ok(save) => save,
            Err(message) => return Response::error(400, &message).into(),
        };
        if save.ssid.trim().is_empty() {
            return Response::error(400, "ssid required").into();
        }
        if save.ssid.len() > SSID_MAX || save.pass.len() > PASS_MAX {
            return Response::error(400, "ssid or password too long").into();
        }

        info!("portal: saving credentials for {:?}", save.ssid);
        let credentials = WifiCredentials {
            ssid: save.ssid,
            password: save.pass,
        };
        match wifi::save_credentials(&self.store, credentials) {
            Ok(()) => Reply::then_restart(
                Response::json(200, &Ack { ok: true }),
                RestartCause::CredentialsSaved,
            ),
            Err(e) => {
                error!("portal: could not store credentials: {}", e);
                Response::error(500, &e.to_string()).into()
            }
        }
    }

    fn factory_reset(&self) -> Reply {
        match wifi::erase_credentials(&self.store) {
            Ok(()) => Reply::then_restart(
                Response::json(200, &Ack { ok: true }),
                RestartCause::FactoryReset,
            ),
            Err(e) => Response::error(500, &e.to_string()).into(),
        }
    }

    /// Any unknown URL bounces the client to the setup page.
    fn captive_redirect(&self) -> Response {
        let url = format!("http://{}/", self.ap_ip);
        Response::html(format!(
            "<!DOCTYPE html><html><head><meta http-equiv=\"refresh\" content=\"0; url={url}\"></head>\
             <body><a href=\"{url}\">Continue to setup</a></body></html>"
        ))
    }
}

/// Accepts JSON, urlencoded and multipart bodies alike.
fn parse_save(content_type: Option<&str>, body: &[u8]) -> Result<SaveRequest, String> {
    if media_type(content_type).as_deref() == Some("application/json") {
        return serde_json::from_slice(body).map_err(|e| format!("invalid json: {}", e));
    }
    let mut fields = multipart::form_fields(content_type, body).map_err(|e| e.to_string())?;
    Ok(SaveRequest {
        ssid: fields.remove("ssid").unwrap_or_default(),
        pass: fields.remove("pass").unwrap_or_default(),
    })
}

impl HttpHandler for PortalRoutes {
    fn routes(&self) -> &'static [Route] {
        ROUTES
    }

    fn captures_unmatched(&self) -> bool {
        true
    }

    fn handle(&self, mut request: Request<'_>) -> Reply {
        debug!("portal: {:?} {}", request.method, request.path);
        match (request.method, request.path) {
            (Method::Get, "/") => {
                let ip = self.ap_ip.to_string();
                assets::page("portal.html", &[("VERSION", &self.version), ("AP_IP", &ip)]).into()
            }
            (Method::Get, "/scan") => Response::json(200, &self.networks).into(),
            (Method::Get, "/logo.png") => assets::logo(&self.store).into(),
            (Method::Post, "/save") => self.save(&mut request),
            (Method::Post, "/factory_reset") => self.factory_reset(),
            _ => self.captive_redirect().into(),
        }
    }

    fn complete(&self, followup: Followup) {
        if let Followup::Restart(cause) = followup {
            if self.restarts.send(cause).is_err() {
                warn!("portal: restart {:?} dropped, portal already gone", cause);
            }
        }
    }
}
