use std::sync::Arc;
use std::time::Duration;

use common::{Ack, DeviceInfo, ModeState};
use moe_telemetry::error::ListenerError;
use moe_telemetry::http::{Followup, HttpHandler, Method, Reply, Request, Response, Route};
use moe_telemetry::listener::ListenerOwner;
use moe_telemetry::platform::RestartCause;
use moe_telemetry::power::SleepDecision;
use moe_telemetry::radio::WifiCredentials;
use moe_telemetry::sim::Bench;
use moe_telemetry::store::keys;
use moe_telemetry::update::firmware::IMAGE_MAGIC;
use moe_telemetry::update::ServiceState;
use moe_telemetry::{wifi, OperatingMode};

const BOUNDARY: &str = "----moe-boundary-7e3f";

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Provisioned, associated, update service listening.
fn online() -> Bench {
    init();
    let bench = Bench::new();
    wifi::save_credentials(
        &bench.ctx.store,
        WifiCredentials {
            ssid: "home".into(),
            password: "secret".into(),
        },
    )
    .unwrap();
    assert_eq!(
        bench.ctx.wifi.connect(bench.ctx.config.association_timeout()),
        wifi::ConnectOutcome::Connected
    );
    bench.ctx.update.start().unwrap();
    bench
}

fn upload(field: &str, filename: &str, content: &[u8]) -> (String, Vec<u8>) {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={BOUNDARY}"), body)
}

struct Idle;

impl HttpHandler for Idle {
    fn routes(&self) -> &'static [Route] {
        &[]
    }

    fn handle(&self, _request: Request<'_>) -> Reply {
        Response::not_found().into()
    }

    fn complete(&self, _followup: Followup) {}
}

fn json<T: serde::de::DeserializeOwned>(reply: &Reply) -> T {
    serde_json::from_slice(&reply.response.body).unwrap()
}

#[test]
fn no_credentials_means_not_provisioned_and_no_access_point() {
    init();
    let bench = Bench::new();
    let outcome = bench.ctx.wifi.connect(Duration::from_secs(8));
    assert_eq!(outcome, wifi::ConnectOutcome::NotProvisioned);
    assert_eq!(bench.radio.access_point(), None);
    assert_eq!(bench.radio.association_attempts(), 0);
}

#[test]
fn only_one_listener_holds_the_port() {
    let bench = online();
    assert_eq!(bench.ctx.listeners.holder(), Some(ListenerOwner::UpdateService));

    let err = bench
        .ctx
        .listeners
        .bind(ListenerOwner::Portal, Arc::new(Idle))
        .unwrap_err();
    assert!(matches!(
        err,
        ListenerError::PortConflict {
            holder: ListenerOwner::UpdateService,
            ..
        }
    ));

    bench.ctx.update.stop();
    assert_eq!(bench.ctx.update.state(), ServiceState::Stopped);
    assert_eq!(bench.ctx.listeners.holder(), None);
    assert_eq!(bench.binder.open_count(), 0);
}

#[test]
fn mode_set_then_get_agree() {
    let bench = online();
    let reply = bench
        .request(Method::Post, "/update/mode", Some("application/json"), br#"{"continuous":true}"#)
        .unwrap();
    assert_eq!(reply.response.status, 200);
    assert_eq!(json::<ModeState>(&reply), ModeState { continuous: true });

    let reply = bench.request(Method::Get, "/update/mode", None, b"").unwrap();
    assert_eq!(json::<ModeState>(&reply), ModeState { continuous: true });
    assert!(bench.ctx.store.get(keys::MODE_CONTINUOUS, false));
    assert_eq!(bench.ctx.retained.mode(), OperatingMode::Continuous);
    assert!(!bench.radio.power_save());
}

#[test]
fn mode_accepts_numeric_flag_and_rejects_garbage() {
    let bench = online();
    let reply = bench
        .request(Method::Post, "/update/mode", Some("application/json"), br#"{"continuous":1}"#)
        .unwrap();
    assert_eq!(json::<ModeState>(&reply), ModeState { continuous: true });

    let reply = bench
        .request(Method::Post, "/update/mode", Some("application/json"), br#"{"continuous":"yes"}"#)
        .unwrap();
    assert_eq!(reply.response.status, 400);
    assert_eq!(bench.ctx.mode.mode(), OperatingMode::Continuous);
}

#[test]
fn entering_normal_sleeps_within_the_request() {
    let bench = online();
    bench.ctx.mode.set_mode(OperatingMode::Continuous).unwrap();
    assert!(bench.power.plans().is_empty());

    let reply = bench
        .request(Method::Post, "/update/mode", Some("application/json"), br#"{"continuous":false}"#)
        .unwrap();
    assert_eq!(json::<ModeState>(&reply), ModeState { continuous: false });

    let plans = bench.power.plans();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].timer, Duration::from_secs(600));
    assert!(bench.ctx.power.has_powered_down());
    assert!(bench.radio.is_shut_down());
    assert_eq!(
        bench.ctx.retained.last_sleep_start(),
        Some(bench.ctx.platform.clock.unix_time())
    );
}

#[test]
fn sleep_cycles_chain_across_wakes() {
    init();
    let bench = Bench::new();
    bench.ctx.store.set(keys::SLEEP_INTERVAL_MINUTES, 10).unwrap();
    assert!(matches!(bench.ctx.power.maybe_sleep(), SleepDecision::Slept(p) if p.timer == Duration::from_secs(600)));

    bench.clock.advance(Duration::from_secs(550));
    let woken = bench.wake();
    match woken.ctx.power.maybe_sleep() {
        SleepDecision::Slept(plan) => assert_eq!(plan.timer, Duration::from_secs(50)),
        other => panic!("expected sleep, got {:?}", other),
    }

    woken.clock.advance(Duration::from_secs(700));
    let late = woken.wake();
    match late.ctx.power.maybe_sleep() {
        SleepDecision::Slept(plan) => assert_eq!(plan.timer, Duration::ZERO),
        other => panic!("expected sleep, got {:?}", other),
    }
}

#[test]
fn durable_mode_wins_over_retained_copy_on_wake() {
    init();
    let bench = Bench::new();
    bench.ctx.retained.set_mode(OperatingMode::Continuous);
    let woken = bench.wake();
    assert_eq!(woken.ctx.mode.mode(), OperatingMode::Normal);
}

#[test]
fn firmware_upload_installs_and_restarts() {
    let bench = online();
    let mut image = vec![IMAGE_MAGIC];
    image.extend((0..5000u32).map(|i| (i % 253) as u8));
    let (ct, body) = upload("firmware", "moe.bin", &image);

    let reply = bench.request(Method::Post, "/update", Some(ct.as_str()), &body).unwrap();
    assert_eq!(reply.response.status, 200);
    assert_eq!(reply.response.body.as_ref(), b"OK");
    assert_eq!(
        bench.system.wait_for_restart(Duration::from_secs(2)),
        Some(RestartCause::FirmwareInstalled)
    );
    assert_eq!(bench.target.next_boot_image(), Some(image));
}

#[test]
fn failed_firmware_write_keeps_running_image() {
    let bench = online();
    bench.target.fail_writes_at(Some(2048));
    let mut image = vec![IMAGE_MAGIC];
    image.extend(std::iter::repeat(0x5a).take(4096));
    let (ct, body) = upload("firmware", "moe.bin", &image);

    let reply = bench.request(Method::Post, "/update", Some(ct.as_str()), &body).unwrap();
    assert_eq!(reply.response.status, 500);
    assert_eq!(reply.response.body.as_ref(), b"FAIL");
    assert_eq!(bench.system.wait_for_restart(Duration::from_millis(200)), None);
    assert_eq!(bench.target.next_boot_image(), None);
    assert_eq!(bench.target.running_image()[0], IMAGE_MAGIC);
}

#[test]
fn logo_upload_then_fetch() {
    let bench = online();
    let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
    png.extend_from_slice(&[0u8; 300]);
    let (ct, body) = upload("logo", "logo.png", &png);

    let reply = bench.request(Method::Post, "/upload_logo", Some(ct.as_str()), &body).unwrap();
    assert_eq!(json::<Ack>(&reply), Ack { ok: true });

    let reply = bench.request(Method::Get, "/logo.png", None, b"").unwrap();
    assert_eq!(reply.response.content_type, "image/png");
    assert_eq!(reply.response.body.as_ref(), png.as_slice());

    let (ct, body) = upload("logo", "logo.gif", b"GIF89a....");
    let reply = bench.request(Method::Post, "/upload_logo", Some(ct.as_str()), &body).unwrap();
    assert_eq!(reply.response.status, 415);
}

#[test]
fn device_info_reports_cached_metrics_and_link() {
    let bench = online();
    bench
        .ctx
        .metrics
        .set_device_metrics(Some(19.04), None, Some(77), None);
    let reply = bench.request(Method::Get, "/update/device_info", None, b"").unwrap();
    let info: DeviceInfo = json(&reply);
    assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    assert_eq!(info.temperature, Some(19.0));
    assert_eq!(info.humidity, None);
    assert_eq!(info.battery, Some(77));
    assert_eq!(info.ip, "192.168.1.50");
    assert_eq!(info.mac, "24:6F:28:11:BE:EF");
    assert_eq!(info.ssid, "home");
    assert_eq!(info.rssi, -48);
}

#[test]
fn factory_reset_erases_and_restarts() {
    let bench = online();
    let reply = bench.request(Method::Post, "/factory_reset", None, b"").unwrap();
    assert_eq!(json::<Ack>(&reply), Ack { ok: true });
    assert_eq!(
        bench.system.wait_for_restart(Duration::from_secs(2)),
        Some(RestartCause::FactoryReset)
    );
    assert_eq!(wifi::load_credentials(&bench.ctx.store), None);
}

#[test]
fn force_ap_flag_is_consumed_once() {
    let bench = online();
    wifi::request_portal(&bench.ctx.store).unwrap();
    let timeout = bench.ctx.config.association_timeout();
    assert_eq!(bench.ctx.wifi.connect(timeout), wifi::ConnectOutcome::NotProvisioned);
    assert_eq!(bench.ctx.wifi.connect(timeout), wifi::ConnectOutcome::Connected);
}
