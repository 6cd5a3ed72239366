//! In-process fakes for the controller's collaborators.

#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use arot_client::engine::{Engine, EngineError};
use arot_client::probe::{ConnectivityProbe, ProbeError, ProbeRoute, ProbeSuccess};
use arot_client::quota::{TrafficSample, TrafficSource};
use arot_client::session::{
    Collaborators, ControllerSettings, SessionController, SessionEvent, SessionHandle, SessionState,
};
use arot_client::sysproxy::{ProxyError, SystemProxy};
use arot_client::verifier::{TokenVerifier, VerifyResult};
use arot_core::config::LocalProxyConfig;

pub const TOKEN_PAGE: &str = "https://tokens.test/vpn";
pub const WAIT: Duration = Duration::from_secs(5);

/// Engine that never spawns anything.
#[derive(Default)]
pub struct FakeEngine {
    running: AtomicBool,
    missing: AtomicBool,
    broken: AtomicBool,
    exits_on_start: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    start_delay: Duration,
}

impl FakeEngine {
    pub fn with_start_delay(start_delay: Duration) -> Self {
        Self {
            start_delay,
            ..Self::default()
        }
    }

    pub fn set_missing(&self, missing: bool) {
        self.missing.store(missing, Ordering::SeqCst);
    }

    /// Make `start` fail as if the engine rejected its config.
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    /// Make `start` succeed but leave no live process behind.
    pub fn set_exits_on_start(&self, exits: bool) {
        self.exits_on_start.store(exits, Ordering::SeqCst);
    }

    /// Simulate the engine dying on its own.
    pub fn crash(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn start(&self, _mode: arot_core::TunnelMode) -> Result<(), EngineError> {
        if self.missing.load(Ordering::SeqCst) {
            return Err(EngineError::NotFound {
                searched: vec![PathBuf::from("/nowhere/sing-box")],
            });
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(EngineError::StartupFailed {
                detail: "exited with status 1: decode config: unknown field".into(),
            });
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.start_delay).await;
        let alive = !self.exits_on_start.load(Ordering::SeqCst);
        self.running.store(alive, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Records every successful write instead of touching OS settings. A failed
/// write leaves the recorded state untouched.
#[derive(Default)]
pub struct RecordingProxy {
    writes: Mutex<Vec<bool>>,
    fail_enable: AtomicBool,
    fail_disable: AtomicBool,
}

impl RecordingProxy {
    /// Start from a proxy some earlier run left switched on.
    pub fn left_enabled() -> Self {
        let proxy = Self::default();
        proxy.writes.lock().unwrap().push(true);
        proxy
    }

    pub fn set_fail_enable(&self, fail: bool) {
        self.fail_enable.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_disable(&self, fail: bool) {
        self.fail_disable.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<bool> {
        self.writes.lock().unwrap().clone()
    }

    /// The OS state after the last write.
    pub fn enabled(&self) -> bool {
        self.writes.lock().unwrap().last().copied().unwrap_or(false)
    }

    pub fn ever_enabled(&self) -> bool {
        self.writes().contains(&true)
    }
}

#[async_trait]
impl SystemProxy for RecordingProxy {
    async fn set_enabled(&self, enabled: bool) -> Result<(), ProxyError> {
        let fail = if enabled {
            &self.fail_enable
        } else {
            &self.fail_disable
        };
        if fail.load(Ordering::SeqCst) {
            return Err(ProxyError::Backend(format!("write of enabled={enabled} refused")));
        }
        self.writes.lock().unwrap().push(enabled);
        Ok(())
    }
}

/// Answers by token prefix: `bad*` is expired, `invalid*` is refused,
/// `offline*` has no network, anything else passes.
pub struct ScriptedVerifier {
    pub delay: Duration,
    pub calls: AtomicUsize,
}

#[async_trait]
impl TokenVerifier for ScriptedVerifier {
    async fn verify(&self, token: &str) -> VerifyResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if token.starts_with("bad") {
            VerifyResult::Rejected("token expired".into())
        } else if token.starts_with("invalid") {
            VerifyResult::Rejected("Invalid Token".into())
        } else if token.starts_with("offline") {
            VerifyResult::NoNetwork
        } else {
            VerifyResult::Ok
        }
    }
}

pub struct StaticProbe {
    pub ok: bool,
}

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn probe(&self, _route: &ProbeRoute) -> Result<ProbeSuccess, ProbeError> {
        if self.ok {
            Ok(ProbeSuccess {
                origin: Some("198.51.100.1".into()),
            })
        } else {
            Err(ProbeError::Status(502))
        }
    }
}

pub struct FixedTraffic(pub u64);

impl TrafficSource for FixedTraffic {
    fn sample(&mut self) -> TrafficSample {
        TrafficSample {
            down_bytes: self.0,
            up_bytes: 0,
        }
    }
}

pub struct Options {
    pub proxy_left_enabled: bool,
    pub verify_delay: Duration,
    pub start_delay: Duration,
    pub probe_ok: bool,
    pub strict_probe: bool,
    pub limit_bytes: u64,
    pub bytes_per_tick: u64,
    pub tick: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            proxy_left_enabled: false,
            verify_delay: Duration::from_millis(5),
            start_delay: Duration::ZERO,
            probe_ok: true,
            strict_probe: false,
            limit_bytes: u64::MAX,
            bytes_per_tick: 1024,
            tick: Duration::from_millis(10),
        }
    }
}

pub struct Harness {
    pub handle: SessionHandle,
    pub task: JoinHandle<()>,
    pub engine: Arc<FakeEngine>,
    pub proxy: Arc<RecordingProxy>,
    pub verifier: Arc<ScriptedVerifier>,
}

impl Harness {
    pub fn new(options: Options) -> Self {
        let engine = Arc::new(FakeEngine::with_start_delay(options.start_delay));
        let proxy = Arc::new(if options.proxy_left_enabled {
            RecordingProxy::left_enabled()
        } else {
            RecordingProxy::default()
        });
        let verifier = Arc::new(ScriptedVerifier {
            delay: options.verify_delay,
            calls: AtomicUsize::new(0),
        });
        let per_tick = options.bytes_per_tick;

        let collaborators = Collaborators {
            verifier: Arc::clone(&verifier) as Arc<dyn TokenVerifier>,
            engine: Arc::clone(&engine) as Arc<dyn Engine>,
            proxy: Arc::clone(&proxy) as Arc<dyn SystemProxy>,
            probe: Arc::new(StaticProbe {
                ok: options.probe_ok,
            }),
            traffic: Arc::new(move || Box::new(FixedTraffic(per_tick)) as Box<dyn TrafficSource>),
        };
        let settings = ControllerSettings {
            quota_limit_bytes: options.limit_bytes,
            quota_tick: options.tick,
            probe_settle: Duration::ZERO,
            strict_probe: options.strict_probe,
            local_proxy: LocalProxyConfig::default(),
            token_page_url: TOKEN_PAGE.into(),
            event_capacity: 1024,
        };
        let (handle, task) = SessionController::spawn(collaborators, settings);
        Self {
            handle,
            task,
            engine,
            proxy,
            verifier,
        }
    }

    /// Wait (bounded) for the given state.
    pub async fn reach(&self, target: SessionState) {
        tokio::time::timeout(WAIT, self.handle.wait_for(|s| *s == target))
            .await
            .unwrap_or_else(|_| {
                panic!("timed out waiting for {target}, at {}", self.handle.state())
            })
            .unwrap();
    }

    /// Wait (bounded) until no transition is under way.
    pub async fn settle(&self) -> SessionState {
        tokio::time::timeout(WAIT, self.handle.wait_for(|s| s.is_settled()))
            .await
            .unwrap()
            .unwrap()
    }
}

/// Everything currently buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
