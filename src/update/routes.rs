use std::io::Read;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use common::{Ack, DeviceInfo, Identity, ModeRequest, ModeState};
use log::*;

use super::firmware::{install_firmware, UpdateTarget};
use crate::assets::{self, LogoRejected, LOGO_LIMIT};
use crate::clock::Clock;
use crate::error::UpdateError;
use crate::http::{Followup, HttpHandler, Method, Reply, Request, Response, Route};
use crate::metrics::{DoorState, MetricsCache};
use crate::mode::ModeController;
use crate::multipart::{self, Multipart};
use crate::platform::{restart_later, RestartCause, System};
use crate::radio::{format_mac, Radio};
use crate::retained::OperatingMode;
use crate::store::DurableStore;
use crate::wifi;

const ROUTES: &[Route] = &[
    Route::get("/"),
    Route::get("/logo.png"),
    Route::post("/upload_logo"),
    Route::get("/update/identity"),
    Route::get("/update/device_info"),
    Route::get("/update/mode"),
    Route::post("/update/mode"),
    Route::post("/update"),
    Route::post("/factory_reset"),
];

const MODE_BODY_LIMIT: usize = 256;

pub struct UpdateRoutes {
    pub(crate) version: String,
    pub(crate) store: DurableStore,
    pub(crate) mode: Arc<ModeController>,
    pub(crate) metrics: Arc<MetricsCache>,
    pub(crate) radio: Arc<dyn Radio>,
    pub(crate) target: Arc<dyn UpdateTarget>,
    pub(crate) system: Arc<dyn System>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) restart_delay: Duration,
}

impl UpdateRoutes {
    fn mode_state(&self) -> Response {
        Response::json(
            200,
            &ModeState {
                continuous: self.mode.mode().is_continuous(),
            },
        )
    }

    /// Applies the mode before answering, so the reply is the effective value.
    fn set_mode(&self, request: &mut Request<'_>) -> Response {
        let body = match request.read_body(MODE_BODY_LIMIT) {
            Ok(body) => body,
            Err(e) => return Response::error(400, &e.to_string()),
        };
        let wanted: ModeRequest = match serde_json::from_slice(&body) {
            Ok(wanted) => wanted,
            Err(e) => return Response::error(400, &format!("invalid mode request: {}", e)),
        };
        let mode = OperatingMode::from_continuous(wanted.continuous);
        info!("update: mode change to {:?} requested", mode);
        if let Err(e) = self.mode.set_mode(mode) {
            warn!("update: mode applied but not persisted: {}", e);
        }
        self.mode_state()
    }

    fn device_info(&self) -> Response {
        let metrics = self.metrics.snapshot();
        let link = self.radio.link_info();
        Response::json(
            200,
            &DeviceInfo {
                version: self.version.clone(),
                temperature: metrics.temperature,
                humidity: metrics.humidity,
                battery: metrics.battery_pct,
                door: metrics.door.map(DoorState::as_u8),
                ip: link.ip.unwrap_or(Ipv4Addr::UNSPECIFIED).to_string(),
                mac: format_mac(self.radio.mac_address()),
                ssid: link.ssid,
                rssi: link.rssi,
            },
        )
    }

    fn upload_firmware(&self, request: &mut Request<'_>) -> Reply {
        let Some(boundary) = request.content_type.and_then(multipart::boundary) else {
            warn!("update: firmware upload without multipart boundary");
            return Response::text(400, "FAIL").into();
        };
        let mut parts = Multipart::new(&mut *request.body, &boundary);
        let result = match parts.next_file() {
            Ok(Some(part)) => {
                info!(
                    "update: receiving {}",
                    part.filename.as_deref().unwrap_or("firmware")
                );
                install_firmware(self.target.as_ref(), &mut parts)
            }
            Ok(None) => Err(UpdateError::Empty),
            Err(e) => Err(UpdateError::Body(e)),
        };

        match result {
            Ok(size) => {
                info!("update: {} byte image verified", size);
                Reply::then_restart(Response::text(200, "OK"), RestartCause::FirmwareInstalled)
            }
            Err(e) => {
                error!("update: firmware upload failed, keeping current image: {}", e);
                Response::text(500, "FAIL").into()
            }
        }
    }

    fn upload_logo(&self, request: &mut Request<'_>) -> Response {
        let Some(boundary) = request.content_type.and_then(multipart::boundary) else {
            return Response::error(400, "expected multipart/form-data");
        };
        let mut parts = Multipart::new(&mut *request.body, &boundary);
        let mut png = Vec::new();
        match parts.next_file() {
            Ok(Some(_)) => {}
            Ok(None) => return Response::error(400, "no file in upload"),
            Err(e) => return Response::error(400, &e.to_string()),
        }
        if let Err(e) = (&mut parts).take(LOGO_LIMIT as u64 + 1).read_to_end(&mut png) {
            return Response::error(400, &e.to_string());
        }
        match assets::validate_logo(&png) {
            Err(LogoRejected::TooLarge) => {
                return Response::error(413, &format!("logo larger than {} bytes", LOGO_LIMIT))
            }
            Err(LogoRejected::NotPng) => return Response::error(415, "logo must be a PNG"),
            Ok(()) => {}
        }
        match assets::store_logo(&self.store, png) {
            Ok(()) => Response::json(200, &Ack { ok: true }),
            Err(e) => Response::error(500, &e.to_string()),
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
}

impl HttpHandler for UpdateRoutes {
    fn routes(&self) -> &'static [Route] {
        ROUTES
    }

    fn handle(&self, mut request: Request<'_>) -> Reply {
        debug!("update: {:?} {}", request.method, request.path);
        match (request.method, request.path) {
            (Method::Get, "/") => assets::page("update.html", &[("VERSION", &self.version)]).into(),
            (Method::Get, "/logo.png") => assets::logo(&self.store).into(),
            (Method::Post, "/upload_logo") => self.upload_logo(&mut request).into(),
            (Method::Get, "/update/identity") => Response::json(
                200,
                &Identity {
                    version: self.version.clone(),
                },
            )
            .into(),
            (Method::Get, "/update/device_info") => self.device_info().into(),
            (Method::Get, "/update/mode") => self.mode_state().into(),
            (Method::Post, "/update/mode") => self.set_mode(&mut request).into(),
            (Method::Post, "/update") => self.upload_firmware(&mut request),
            (Method::Post, "/factory_reset") => self.factory_reset(),
            _ => Response::not_found().into(),
        }
    }

    fn complete(&self, followup: Followup) {
        if let Followup::Restart(cause) = followup {
            restart_later(self.system.clone(), self.clock.clone(), self.restart_delay, cause);
        }
    }
}
