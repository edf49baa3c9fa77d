//! Provisioning portal: open access point, captive DNS and the setup form.
//!
//! Once running, the portal owns the device until a save or reset restarts it.

pub mod dns;
mod routes;

use std::sync::mpsc;
use std::sync::Arc;

use log::*;

pub use dns::CaptiveDns;
pub use routes::PortalRoutes;

use crate::context::DeviceContext;
use crate::listener::ListenerOwner;
use crate::platform::RestartCause;
use crate::radio::access_point_name;

pub struct ProvisioningPortal {
    ctx: Arc<DeviceContext>,
}

impl ProvisioningPortal {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self { ctx }
    }

    pub fn run(self) -> ! {
        let ctx = &self.ctx;
        let platform = &ctx.platform;
        info!("portal: starting");

        let networks = match platform.radio.scan() {
            Ok(networks) => {
                info!("portal: {} networks in range", networks.len());
                networks
            }
            Err(e) => {
                warn!("portal: scan failed, offering an empty list: {}", e);
                Vec::new()
            }
        };

        if ctx.update.is_active() {
            info!("portal: stopping update service to free port {}", ctx.listeners.port());
            ctx.update.stop();
        }

        let name = access_point_name(&ctx.config.ap_prefix, platform.radio.mac_address());
        let ip = match platform.radio.start_access_point(&name) {
            Ok(ip) => ip,
            Err(e) => {
                error!("portal: access point {} failed: {}", name, e);
                self.restart(RestartCause::PortalUnavailable)
            }
        };

        let (tx, rx) = mpsc::channel();
        let routes = Arc::new(PortalRoutes {
            version: ctx.config.firmware_version.clone(),
            ap_ip: ip,
            networks,
            store: ctx.store.clone(),
            restarts: tx,
        });
        if let Err(e) = ctx.listeners.bind(ListenerOwner::Portal, routes) {
            error!("portal: {}", e);
            self.restart(RestartCause::PortalUnavailable)
        }

        match CaptiveDns::start(ip, ctx.config.dns_port) {
            Ok(dns) => {
                ctx.listeners.attach(ListenerOwner::Portal, Box::new(dns));
            }
            Err(e) => warn!("portal: captive dns unavailable, setup page only: {}", e),
        }

        info!("portal: {} serving http://{}/", name, ip);
        let cause = rx.recv().unwrap_or(RestartCause::PortalUnavailable);
        self.restart(cause)
    }

    fn restart(&self, cause: RestartCause) -> ! {
        info!("portal: leaving ({:?})", cause);
        self.ctx.platform.clock.sleep(self.ctx.config.restart_delay());
        self.ctx.platform.system.restart(cause)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::http::Method;
    use crate::listener::ListenerOwner;
    use crate::platform::RestartCause;
    use crate::sim::{catch_restart, poll_until, Bench};

    #[test]
    fn portal_frees_update_port_and_restarts_on_save() {
        let bench = Bench::new();
        bench.ctx.update.start().unwrap();

        let ctx = bench.ctx.clone();
        let portal = std::thread::spawn(move || catch_restart(|| ctx.portal().run()));

        let binder = bench.binder.clone();
        let reply = poll_until(Duration::from_secs(2), || {
            (bench.ctx.listeners.holder() == Some(ListenerOwner::Portal))
                .then(|| {
                    binder.request(
                        Method::Post,
                        "/save",
                        Some("application/x-www-form-urlencoded"),
                        b"ssid=home&pass=secret",
                    )
                })
                .flatten()
        })
        .expect("portal never took the port");
        assert_eq!(reply.response.status, 200);

        let cause = portal.join().unwrap();
        assert_eq!(cause, Some(RestartCause::CredentialsSaved));
        assert!(!bench.ctx.update.is_active());
        assert_eq!(bench.radio.access_point().as_deref(), Some("MOE_Telemetry_BEEF"));
    }

    #[test]
    fn portal_restarts_when_port_cannot_be_bound() {
        let bench = Bench::new();
        bench.binder.refuse_binds(true);
        let cause = catch_restart(|| bench.ctx.portal().run());
        assert_eq!(cause, Some(RestartCause::PortalUnavailable));
    }
}
