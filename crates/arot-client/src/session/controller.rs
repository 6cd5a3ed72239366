//! The session controller.
//!
//! A single task owns all session state. Commands from handles and reports
//! from background tasks arrive on one ordered channel, so transitions never
//! interleave. Every background task is tagged with the attempt that spawned
//! it; reports from an older attempt, or ones no longer valid in the current
//! state, are dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use arot_core::TunnelMode;
use arot_core::config::{Config, LocalProxyConfig};

use super::establish::{Establish, EstablishOutcome};
use super::types::{FailureReason, Session, SessionError, SessionEvent, SessionState, UserHint};
use crate::engine::Engine;
use crate::privileges;
use crate::probe::{ConnectivityProbe, ProbeRoute};
use crate::quota::{QuotaEvent, QuotaMonitor, TrafficSource};
use crate::sysproxy::SystemProxy;
use crate::verifier::{TokenVerifier, VerifyResult};

/// Creates a fresh traffic source for every session.
pub type TrafficFactory = Arc<dyn Fn() -> Box<dyn TrafficSource> + Send + Sync>;

/// The services the controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub verifier: Arc<dyn TokenVerifier>,
    pub engine: Arc<dyn Engine>,
    pub proxy: Arc<dyn SystemProxy>,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub traffic: TrafficFactory,
}

/// Tunables taken from [`Config`].
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub quota_limit_bytes: u64,
    pub quota_tick: Duration,
    pub probe_settle: Duration,
    pub strict_probe: bool,
    pub local_proxy: LocalProxyConfig,
    /// Sent with every re-issue notification.
    pub token_page_url: String,
    pub event_capacity: usize,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            quota_limit_bytes: config.quota.limit_bytes,
            quota_tick: config.quota.tick(),
            probe_settle: config.probe.settle(),
            strict_probe: config.probe.strict,
            local_proxy: config.local_proxy.clone(),
            token_page_url: config.issuer.token_page_url.clone(),
            event_capacity: 64,
        }
    }
}

enum Message {
    Connect {
        token: String,
        mode: TunnelMode,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Task {
        attempt: u64,
        event: TaskEvent,
    },
}

#[derive(Debug)]
enum TaskEvent {
    Verified(VerifyResult),
    Established(EstablishOutcome),
    Quota(QuotaEvent),
}

/// Spawns the controller task.
pub struct SessionController;

impl SessionController {
    /// Start the controller. It runs until [`SessionHandle::shutdown`] is
    /// called or every handle is dropped; either way the tunnel is torn down
    /// before the task ends.
    pub fn spawn(
        collaborators: Collaborators,
        settings: ControllerSettings,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));

        let actor = Actor {
            collab: collaborators,
            settings,
            inbox: tx.downgrade(),
            state_tx,
            events: events.clone(),
            state: SessionState::Disconnected,
            session: None,
            attempt: 0,
            cancel: None,
            establish: None,
            monitor: None,
        };
        let task = tokio::spawn(actor.run(rx));

        let handle = SessionHandle {
            tx,
            state: state_rx,
            events,
        };
        (handle, task)
    }
}

/// Cloneable front door to the controller.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Start a session. Returns once verification has been kicked off; watch
    /// the state or the event stream for the result.
    pub async fn connect(
        &self,
        token: impl Into<String>,
        mode: TunnelMode,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Connect {
            token: token.into(),
            mode,
            reply,
        })?;
        rx.await.map_err(|_| SessionError::ControllerStopped)?
    }

    /// Cancel an attempt in progress or close the connected session. Returns
    /// after teardown has finished. Succeeds when already disconnected.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Disconnect { reply })?;
        rx.await.map_err(|_| SessionError::ControllerStopped)
    }

    /// Tear everything down and stop the controller.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Shutdown { reply })?;
        rx.await.map_err(|_| SessionError::ControllerStopped)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<SessionState, SessionError>
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut rx = self.state.clone();
        rx.wait_for(predicate)
            .await
            .map(|state| *state)
            .map_err(|_| SessionError::ControllerStopped)
    }

    fn send(&self, message: Message) -> Result<(), SessionError> {
        self.tx
            .send(message)
            .map_err(|_| SessionError::ControllerStopped)
    }
}

struct Actor {
    collab: Collaborators,
    settings: ControllerSettings,
    /// Weak so that dropping every handle ends the controller.
    inbox: mpsc::WeakUnboundedSender<Message>,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    state: SessionState,
    session: Option<Session>,
    attempt: u64,
    /// Cancels every background task of the current attempt.
    cancel: Option<CancellationToken>,
    establish: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        // Nothing is connected yet, so the OS proxy must be off.
        self.disable_proxy().await;

        while let Some(message) = rx.recv().await {
            match message {
                Message::Connect { token, mode, reply } => {
                    let _ = reply.send(self.on_connect(token, mode));
                }
                Message::Disconnect { reply } => {
                    self.on_disconnect().await;
                    let _ = reply.send(());
                }
                Message::Shutdown { reply } => {
                    info!(state = %self.state, "Session controller shutting down");
                    self.teardown().await;
                    self.set_state(SessionState::Disconnected);
                    let _ = reply.send(());
                    return;
                }
                Message::Task { attempt, event } => {
                    if attempt == self.attempt {
                        self.on_task(event).await;
                    } else {
                        debug!(
                            attempt,
                            current = self.attempt,
                            ?event,
                            "Dropping stale task report"
                        );
                    }
                }
            }
        }

        if self.state != SessionState::Disconnected {
            info!(state = %self.state, "All handles dropped, closing session");
            self.teardown().await;
            self.set_state(SessionState::Disconnected);
        }
    }

    fn on_connect(&mut self, token: String, mode: TunnelMode) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::Busy { state: self.state });
        }
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(SessionError::EmptyToken);
        }
        if mode == TunnelMode::Tun && privileges::is_elevated() == Some(false) {
            warn!("Tun mode usually requires administrator privileges");
        }

        let session = Session::new(token, mode);
        info!(token = %session.redacted_token(), %mode, "Connect requested");
        let token = session.token.clone();

        self.attempt += 1;
        self.cancel = Some(CancellationToken::new());
        self.session = Some(session);
        self.set_state(SessionState::Verifying);

        let attempt = self.attempt;
        let verifier = Arc::clone(&self.collab.verifier);
        if let Some(tx) = self.inbox.upgrade() {
            // Not cancellable; a late result is dropped as stale.
            tokio::spawn(async move {
                let result = verifier.verify(&token).await;
                let _ = tx.send(Message::Task {
                    attempt,
                    event: TaskEvent::Verified(result),
                });
            });
        }
        Ok(())
    }

    async fn on_disconnect(&mut self) {
        match self.state {
            SessionState::Disconnected | SessionState::Disconnecting => {
                debug!(state = %self.state, "Nothing to disconnect");
            }
            SessionState::Verifying | SessionState::Connecting | SessionState::Connected => {
                info!(state = %self.state, "Disconnect requested");
                self.close(None).await;
            }
        }
    }

    async fn on_task(&mut self, event: TaskEvent) {
        match (self.state, event) {
            (SessionState::Verifying, TaskEvent::Verified(result)) => {
                match FailureReason::from_verify(result) {
                    None => self.begin_establish(),
                    Some(reason) => self.fail(reason).await,
                }
            }
            (SessionState::Connecting, TaskEvent::Established(outcome)) => {
                self.establish = None;
                match outcome {
                    EstablishOutcome::Up => self.on_tunnel_up(),
                    EstablishOutcome::Failed(reason) => self.fail(reason).await,
                    EstablishOutcome::Cancelled => self.close(None).await,
                }
            }
            (SessionState::Connected, TaskEvent::Quota(QuotaEvent::Usage(report))) => {
                if let Some(session) = self.session.as_mut() {
                    session.bytes_used = report.used_bytes;
                }
                self.emit(SessionEvent::Usage(report));
            }
            (SessionState::Connected, TaskEvent::Quota(QuotaEvent::Exhausted(report))) => {
                self.monitor = None;
                self.close(Some(SessionEvent::QuotaExhausted {
                    used_bytes: report.used_bytes,
                    limit_bytes: report.limit_bytes,
                }))
                .await;
            }
            (SessionState::Connected, TaskEvent::Quota(QuotaEvent::EngineCrashed)) => {
                self.monitor = None;
                let reason = FailureReason::EngineDied;
                let hint = reason.hint();
                self.close(Some(SessionEvent::Failed { reason, hint })).await;
            }
            (state, event) => {
                debug!(%state, ?event, "Ignoring task report");
            }
        }
    }

    fn begin_establish(&mut self) {
        let (Some(session), Some(cancel)) = (self.session.as_ref(), self.cancel.as_ref()) else {
            return;
        };
        let mode = session.mode;
        let job = Establish {
            engine: Arc::clone(&self.collab.engine),
            proxy: Arc::clone(&self.collab.proxy),
            probe: Arc::clone(&self.collab.probe),
            mode,
            route: ProbeRoute::for_mode(mode, &self.settings.local_proxy),
            settle: self.settings.probe_settle,
            strict_probe: self.settings.strict_probe,
        };
        let cancel = cancel.clone();
        let attempt = self.attempt;
        let tx = self.inbox.upgrade();

        self.set_state(SessionState::Connecting);
        self.establish = Some(tokio::spawn(async move {
            let outcome = job.run(cancel).await;
            if let Some(tx) = tx {
                let _ = tx.send(Message::Task {
                    attempt,
                    event: TaskEvent::Established(outcome),
                });
            }
        }));
    }

    fn on_tunnel_up(&mut self) {
        let Some(cancel) = self.cancel.as_ref() else {
            return;
        };
        let monitor = QuotaMonitor::new(
            self.settings.quota_limit_bytes,
            self.settings.quota_tick,
            Arc::clone(&self.collab.engine),
            (self.collab.traffic)(),
        );
        let attempt = self.attempt;
        let inbox = self.inbox.clone();
        self.monitor = Some(monitor.spawn(cancel.clone(), move |event| {
            inbox.upgrade().is_some_and(|tx| {
                tx.send(Message::Task {
                    attempt,
                    event: TaskEvent::Quota(event),
                })
                .is_ok()
            })
        }));
        self.set_state(SessionState::Connected);
    }

    /// Leave Verifying or Connecting after a failure.
    async fn fail(&mut self, reason: FailureReason) {
        warn!(state = %self.state, %reason, "Session attempt failed");
        self.teardown().await;
        let hint = reason.hint();
        self.emit(SessionEvent::Failed { reason, hint });
        if hint == UserHint::Reissue {
            self.emit_reissue();
        }
        self.set_state(SessionState::Disconnected);
    }

    /// Orderly close through Disconnecting, optionally announcing why.
    async fn close(&mut self, notice: Option<SessionEvent>) {
        self.set_state(SessionState::Disconnecting);
        self.teardown().await;
        if let Some(event) = notice {
            let reissue = matches!(event, SessionEvent::QuotaExhausted { .. });
            self.emit(event);
            if reissue {
                self.emit_reissue();
            }
        }
        self.set_state(SessionState::Disconnected);
    }

    /// Release everything the session holds. Each step runs even if an
    /// earlier one failed.
    async fn teardown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        // The establish task may be mid-way through enabling the proxy; it
        // must be finished before the proxy is switched off.
        if let Some(task) = self.establish.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Establish task ended abnormally");
            }
        }
        if let Some(task) = self.monitor.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Quota monitor ended abnormally");
            }
        }
        self.disable_proxy().await;
        self.collab.engine.stop().await;

        if let Some(session) = self.session.take() {
            info!(
                token = %session.redacted_token(),
                mode = %session.mode,
                bytes_used = session.bytes_used,
                "Session closed"
            );
        }
    }

    async fn disable_proxy(&self) {
        if let Err(e) = self.collab.proxy.set_enabled(false).await {
            warn!(error = %e, "Failed to disable system proxy");
        }
    }

    fn emit_reissue(&self) {
        self.emit(SessionEvent::ReissueRequired {
            url: self.settings.token_page_url.clone(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        info!(from = %self.state, to = %state, "Session state changed");
        self.state = state;
        // Event first, so a watcher that sees the new state finds it queued.
        self.emit(SessionEvent::StateChanged {
            state,
            mode: self.session.as_ref().map(|s| s.mode),
        });
        self.state_tx.send_replace(state);
    }
}
