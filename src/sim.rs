//! In-memory platform pieces.
//!
//! Used by the unit tests and by `sim-server` wherever the host has no real
//! equivalent (radio, flash slot).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use common::ScanRecord;

use crate::clock::{Clock, TimeSource};
use crate::config::Config;
use crate::context::{DeviceContext, Platform};
use crate::error::{ListenerError, RadioError, StoreError, TimeSyncError, UpdateError};
use crate::http::{HttpBinder, HttpHandler, Listener, Method, Reply, Request};
use crate::platform::{RestartCause, System};
use crate::power::{PinLevel, PowerControl, SleepPlan};
use crate::radio::{LinkInfo, Radio, WifiCredentials};
use crate::retained::RetainedCell;
use crate::store::{Kind, StorageBackend, Value};
use crate::update::firmware::{SlotWriter, UpdateTarget, IMAGE_MAGIC};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<(String, String), Value>>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every session fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("flash offline".into()));
        }
        Ok(())
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, namespace: &str, key: &str, kind: Kind) -> Result<Option<Value>, StoreError> {
        self.check()?;
        let entries = lock(&self.entries);
        Ok(entries
            .get(&(namespace.to_string(), key.to_string()))
            .filter(|v| v.kind() == kind)
            .cloned())
    }

    fn write(&self, namespace: &str, key: &str, value: &Value) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.entries).insert((namespace.to_string(), key.to_string()), value.clone());
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(lock(&self.entries)
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    fn take(&self, namespace: &str, key: &str, kind: Kind) -> Result<Option<Value>, StoreError> {
        self.check()?;
        let mut entries = lock(&self.entries);
        Ok(entries
            .remove(&(namespace.to_string(), key.to_string()))
            .filter(|v| v.kind() == kind))
    }
}

/// Time that only moves when slept through or advanced.
pub struct ManualClock {
    base: Instant,
    epoch: u64,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new(unix_secs: u64) -> Self {
        Self {
            base: Instant::now(),
            epoch: unix_secs,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.offset) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *lock(&self.offset)
    }

    fn unix_time(&self) -> u64 {
        self.epoch + lock(&self.offset).as_secs()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// A time source that is always in sync.
pub struct InstantTime;

impl TimeSource for InstantTime {
    fn sync(&self, _timeout: Duration) -> Result<(), TimeSyncError> {
        Ok(())
    }
}

/// Time sync that can be told to time out.
#[derive(Default)]
pub struct SwitchableTime {
    unreachable: AtomicBool,
}

impl SwitchableTime {
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

impl TimeSource for SwitchableTime {
    fn sync(&self, timeout: Duration) -> Result<(), TimeSyncError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TimeSyncError::Timeout(timeout));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct SimNetwork {
    ssid: String,
    password: String,
    rssi: i8,
}

#[derive(Default)]
struct SimRadioState {
    associated: Option<String>,
    access_point: Option<String>,
    power_save: bool,
    shut_down: bool,
    attempts: usize,
}

pub const SIM_AP_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);
pub const SIM_STATION_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

/// A radio that sees a fixed set of networks and associates instantly when the
/// password matches.
pub struct SimRadio {
    mac: [u8; 6],
    networks: Vec<SimNetwork>,
    state: Mutex<SimRadioState>,
    fail_shutdown: AtomicBool,
}

impl SimRadio {
    pub fn new(mac: [u8; 6]) -> Self {
        Self {
            mac,
            networks: Vec::new(),
            state: Mutex::new(SimRadioState::default()),
            fail_shutdown: AtomicBool::new(false),
        }
    }

    /// An empty password makes the network open.
    pub fn with_network(mut self, ssid: &str, password: &str, rssi: i8) -> Self {
        self.networks.push(SimNetwork {
            ssid: ssid.to_string(),
            password: password.to_string(),
            rssi,
        });
        self
    }

    pub fn fail_shutdown(&self, fail: bool) {
        self.fail_shutdown.store(fail, Ordering::SeqCst);
    }

    pub fn access_point(&self) -> Option<String> {
        lock(&self.state).access_point.clone()
    }

    pub fn association_attempts(&self) -> usize {
        lock(&self.state).attempts
    }

    pub fn power_save(&self) -> bool {
        lock(&self.state).power_save
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.state).shut_down
    }
}

impl Radio for SimRadio {
    fn begin_association(&self, credentials: &WifiCredentials) -> Result<(), RadioError> {
        let mut state = lock(&self.state);
        state.attempts += 1;
        state.shut_down = false;
        state.access_point = None;
        state.associated = self
            .networks
            .iter()
            .find(|n| n.ssid == credentials.ssid && n.password == credentials.password)
            .map(|n| n.ssid.clone());
        Ok(())
    }

    fn is_associated(&self) -> bool {
        lock(&self.state).associated.is_some()
    }

    fn set_power_save(&self, enabled: bool) -> Result<(), RadioError> {
        lock(&self.state).power_save = enabled;
        Ok(())
    }

    fn scan(&self) -> Result<Vec<ScanRecord>, RadioError> {
        Ok(self
            .networks
            .iter()
            .map(|n| ScanRecord {
                ssid: n.ssid.clone(),
                rssi: n.rssi,
                open: n.password.is_empty(),
            })
            .collect())
    }

    fn start_access_point(&self, ssid: &str) -> Result<Ipv4Addr, RadioError> {
        if ssid.is_empty() || ssid.len() > 32 {
            return Err(RadioError::InvalidSsid(ssid.to_string()));
        }
        let mut state = lock(&self.state);
        state.associated = None;
        state.shut_down = false;
        state.access_point = Some(ssid.to_string());
        Ok(SIM_AP_ADDRESS)
    }

    fn shutdown(&self) -> Result<(), RadioError> {
        if self.fail_shutdown.load(Ordering::SeqCst) {
            return Err(RadioError::Driver("wifi stop timed out".into()));
        }
        let mut state = lock(&self.state);
        state.associated = None;
        state.access_point = None;
        state.shut_down = true;
        Ok(())
    }

    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    fn link_info(&self) -> LinkInfo {
        let state = lock(&self.state);
        match &state.associated {
            Some(ssid) => LinkInfo {
                ip: Some(SIM_STATION_ADDRESS),
                ssid: ssid.clone(),
                rssi: self
                    .networks
                    .iter()
                    .find(|n| &n.ssid == ssid)
                    .map_or(0, |n| n.rssi),
            },
            None => LinkInfo::default(),
        }
    }
}

/// An update slot in RAM. Finalising checks the image magic byte the way the
/// bootloader would.
pub struct MemoryTarget {
    running: Vec<u8>,
    next_boot: Mutex<Option<Vec<u8>>>,
    fail_at: Mutex<Option<u64>>,
}

impl MemoryTarget {
    pub fn new(running: Vec<u8>) -> Self {
        Self {
            running,
            next_boot: Mutex::new(None),
            fail_at: Mutex::new(None),
        }
    }

    /// Makes writes fail once the slot would grow past `offset` bytes.
    pub fn fail_writes_at(&self, offset: Option<u64>) {
        *lock(&self.fail_at) = offset;
    }

    pub fn running_image(&self) -> &[u8] {
        &self.running
    }

    /// The finalised image the next boot would run, if any.
    pub fn next_boot_image(&self) -> Option<Vec<u8>> {
        lock(&self.next_boot).clone()
    }
}

struct MemorySlot {
    data: Vec<u8>,
    fail_at: Option<u64>,
}

impl SlotWriter for MemorySlot {
    fn write(&mut self, data: &[u8]) -> Result<(), UpdateError> {
        let offset = self.data.len() as u64;
        if let Some(limit) = self.fail_at {
            if offset + data.len() as u64 > limit {
                return Err(UpdateError::Write {
                    offset,
                    reason: "flash write failed".into(),
                });
            }
        }
        self.data.extend_from_slice(data);
        Ok(())
    }
}

impl UpdateTarget for MemoryTarget {
    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn SlotWriter) -> Result<u64, UpdateError>,
    ) -> Result<u64, UpdateError> {
        let mut slot = MemorySlot {
            data: Vec::new(),
            fail_at: *lock(&self.fail_at),
        };
        let written = body(&mut slot)?;
        if slot.data.first() != Some(&IMAGE_MAGIC) {
            return Err(UpdateError::Finish("image header invalid".into()));
        }
        *lock(&self.next_boot) = Some(slot.data);
        Ok(written)
    }
}

/// Records every power-down instead of performing it.
pub struct RecordingPower {
    level: Mutex<PinLevel>,
    plans: Mutex<Vec<SleepPlan>>,
}

impl RecordingPower {
    pub fn new(level: PinLevel) -> Self {
        Self {
            level: Mutex::new(level),
            plans: Mutex::new(Vec::new()),
        }
    }

    pub fn set_level(&self, level: PinLevel) {
        *lock(&self.level) = level;
    }

    pub fn plans(&self) -> Vec<SleepPlan> {
        lock(&self.plans).clone()
    }
}

impl PowerControl for RecordingPower {
    fn pin_level(&self, _pin: u8) -> PinLevel {
        *lock(&self.level)
    }

    fn power_down(&self, plan: &SleepPlan) {
        lock(&self.plans).push(*plan);
    }
}

struct Bound {
    port: u16,
    handler: Arc<dyn HttpHandler>,
    open: Arc<AtomicBool>,
}

/// Keeps handlers in a list instead of opening sockets; requests are
/// delivered by calling [`request`](RecordingBinder::request).
#[derive(Default)]
pub struct RecordingBinder {
    bound: Mutex<Vec<Bound>>,
    refuse: AtomicBool,
}

struct RecordedListener {
    open: Arc<AtomicBool>,
}

impl Listener for RecordedListener {
    fn close(self: Box<Self>) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl RecordingBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_binds(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        lock(&self.bound)
            .iter()
            .filter(|b| b.open.load(Ordering::SeqCst))
            .count()
    }

    pub fn total_binds(&self) -> usize {
        lock(&self.bound).len()
    }

    /// Sends one request to the most recently bound open handler, then runs
    /// its completion like a real server does after flushing the response.
    pub fn request(
        &self,
        method: Method,
        path: &str,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Option<Reply> {
        let handler = lock(&self.bound)
            .iter()
            .rev()
            .find(|b| b.open.load(Ordering::SeqCst))
            .map(|b| b.handler.clone())?;
        let routed = handler
            .routes()
            .iter()
            .any(|r| r.method == method && r.path == path);
        if !routed && !handler.captures_unmatched() {
            return None;
        }
        let mut body = body;
        let reply = handler.handle(Request {
            method,
            path,
            content_type,
            body: &mut body,
        });
        handler.complete(reply.followup);
        Some(reply)
    }

    pub fn bound_ports(&self) -> Vec<u16> {
        lock(&self.bound).iter().map(|b| b.port).collect()
    }
}

impl HttpBinder for RecordingBinder {
    fn bind(&self, port: u16, handler: Arc<dyn HttpHandler>) -> Result<Box<dyn Listener>, ListenerError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ListenerError::Bind {
                port,
                reason: "address in use".into(),
            });
        }
        let open = Arc::new(AtomicBool::new(true));
        lock(&self.bound).push(Bound {
            port,
            handler,
            open: open.clone(),
        });
        Ok(Box::new(RecordedListener { open }))
    }
}

/// Panic payload raised by [`RestartTrap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartRequested(pub RestartCause);

/// A [`System`] whose restart unwinds the calling thread instead of resetting.
#[derive(Default)]
pub struct RestartTrap {
    causes: Mutex<Vec<RestartCause>>,
}

impl RestartTrap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn causes(&self) -> Vec<RestartCause> {
        lock(&self.causes).clone()
    }

    /// Waits in real time for a restart issued from another thread.
    pub fn wait_for_restart(&self, timeout: Duration) -> Option<RestartCause> {
        poll_until(timeout, || lock(&self.causes).last().copied())
    }
}

impl System for RestartTrap {
    fn restart(&self, cause: RestartCause) -> ! {
        lock(&self.causes).push(cause);
        panic::panic_any(RestartRequested(cause))
    }
}

/// Runs `f` and reports the restart it ended in, if any.
pub fn catch_restart<F: FnOnce()>(f: F) -> Option<RestartCause> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => None,
        Err(payload) => match payload.downcast::<RestartRequested>() {
            Ok(restart) => Some(restart.0),
            Err(other) => panic::resume_unwind(other),
        },
    }
}

/// Polls `f` in real time until it yields a value or `timeout` passes.
pub fn poll_until<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = f() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub const BENCH_MAC: [u8; 6] = [0x24, 0x6f, 0x28, 0x11, 0xbe, 0xef];

/// A whole device on in-memory parts, with handles to each part.
pub struct Bench {
    pub ctx: Arc<DeviceContext>,
    pub backend: Arc<MemoryBackend>,
    pub radio: Arc<SimRadio>,
    pub binder: Arc<RecordingBinder>,
    pub target: Arc<MemoryTarget>,
    pub power: Arc<RecordingPower>,
    pub system: Arc<RestartTrap>,
    pub clock: Arc<ManualClock>,
    pub time: Arc<SwitchableTime>,
}

impl Bench {
    /// Cold boot with an empty store. The radio sees `home` (password
    /// `secret`) and the open `cafe`.
    pub fn new() -> Self {
        let radio = SimRadio::new(BENCH_MAC)
            .with_network("home", "secret", -48)
            .with_network("cafe", "", -71);
        let config = Config {
            dns_port: 0,
            ..Config::default()
        };
        Self::assemble(
            config,
            Arc::new(MemoryBackend::new()),
            Arc::new(radio),
            Arc::new(ManualClock::new(1_700_000_000)),
            Box::leak(Box::new(RetainedCell::new())),
        )
    }

    /// Wake from deep sleep: same flash, retained memory and clock, no sockets.
    pub fn wake(&self) -> Self {
        Self::assemble(
            self.ctx.config.clone(),
            self.backend.clone(),
            self.radio.clone(),
            self.clock.clone(),
            self.ctx.retained,
        )
    }

    fn assemble(
        config: Config,
        backend: Arc<MemoryBackend>,
        radio: Arc<SimRadio>,
        clock: Arc<ManualClock>,
        retained: &'static RetainedCell,
    ) -> Self {
        let binder = Arc::new(RecordingBinder::new());
        let target = Arc::new(MemoryTarget::new(vec![IMAGE_MAGIC, 0x01, 0x02, 0x03]));
        let power = Arc::new(RecordingPower::new(PinLevel::Low));
        let system = Arc::new(RestartTrap::new());
        let time = Arc::new(SwitchableTime::default());
        let platform = Platform {
            backend: backend.clone(),
            radio: radio.clone(),
            binder: binder.clone(),
            target: target.clone(),
            power: power.clone(),
            system: system.clone(),
            clock: clock.clone(),
            time: time.clone(),
        };
        Self {
            ctx: DeviceContext::assemble(config, platform, retained),
            backend,
            radio,
            binder,
            target,
            power,
            system,
            clock,
            time,
        }
    }

    pub fn request(&self, method: Method, path: &str, content_type: Option<&str>, body: &[u8]) -> Option<Reply> {
        self.binder.request(method, path, content_type, body)
    }
}

impl Default for Bench {
    fn default() -> Self {
        Self::new()
    }
}
