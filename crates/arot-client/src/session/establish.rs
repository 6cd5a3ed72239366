//! Tunnel establishment: start the engine, point the OS at it, probe.
//!
//! Runs on its own task so the controller keeps serving commands. The cancel
//! token is checked after every step that can take a while; on cancellation
//! the engine is stopped here and the proxy is left for the controller's
//! teardown. The proxy is written on the way in for both modes: enabled for
//! proxy mode, cleared for tun mode.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use arot_core::TunnelMode;

use super::types::FailureReason;
use crate::engine::Engine;
use crate::probe::{ConnectivityProbe, ProbeRoute};
use crate::sysproxy::SystemProxy;

/// How establishment ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EstablishOutcome {
    Up,
    Failed(FailureReason),
    Cancelled,
}

pub(crate) struct Establish {
    pub engine: Arc<dyn Engine>,
    pub proxy: Arc<dyn SystemProxy>,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub mode: TunnelMode,
    pub route: ProbeRoute,
    pub settle: Duration,
    /// Fail the tunnel on a failed probe even when the engine is alive.
    pub strict_probe: bool,
}

impl Establish {
    pub async fn run(self, cancel: CancellationToken) -> EstablishOutcome {
        if !self.mode.uses_system_proxy() {
            // A killed earlier run may have left the OS pointing at our listener.
            if let Err(e) = self.proxy.set_enabled(false).await {
                warn!(error = %e, "Failed to clear system proxy");
            }
        }

        if let Err(e) = self.engine.start(self.mode).await {
            warn!(error = %e, mode = %self.mode, "Engine failed to start");
            return EstablishOutcome::Failed(e.into());
        }
        if cancel.is_cancelled() {
            return self.abandon().await;
        }

        if self.mode.uses_system_proxy() {
            if let Err(e) = self.proxy.set_enabled(true).await {
                warn!(error = %e, "Failed to enable system proxy");
                self.engine.stop().await;
                return EstablishOutcome::Failed(FailureReason::ProxyFailed(e.to_string()));
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return self.abandon().await,
            () = tokio::time::sleep(self.settle) => {}
        }

        let probed = self.probe.probe(&self.route).await;
        if cancel.is_cancelled() {
            return self.abandon().await;
        }

        match probed {
            Ok(success) => {
                info!(origin = ?success.origin, mode = %self.mode, "Tunnel verified");
                EstablishOutcome::Up
            }
            Err(e) if self.strict_probe => {
                warn!(error = %e, "Connectivity probe failed");
                self.engine.stop().await;
                EstablishOutcome::Failed(FailureReason::ProbeFailed(e.to_string()))
            }
            Err(e) if self.engine.is_running() => {
                warn!(error = %e, "Connectivity probe failed, engine still running");
                EstablishOutcome::Up
            }
            Err(e) => {
                warn!(error = %e, "Connectivity probe failed and engine exited");
                EstablishOutcome::Failed(FailureReason::EngineDied)
            }
        }
    }

    async fn abandon(&self) -> EstablishOutcome {
        info!(mode = %self.mode, "Tunnel establishment cancelled");
        self.engine.stop().await;
        EstablishOutcome::Cancelled
    }
}
