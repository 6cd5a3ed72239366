//! AROT client library.
//!
//! Drives a personal VPN session: verifies the user's token with the issuer,
//! supervises the sing-box engine, switches the OS proxy in proxy mode, and
//! enforces the per-session bandwidth budget.

pub mod engine;
pub mod privileges;
pub mod probe;
pub mod quota;
pub mod session;
pub mod sysproxy;
pub mod verifier;

use std::sync::Arc;

use tokio::task::JoinHandle;

use arot_core::Config;

use crate::engine::ProcessSupervisor;
use crate::probe::HttpProbe;
use crate::quota::{SimulatedTraffic, TrafficSource};
use crate::session::{Collaborators, ControllerSettings, SessionController, SessionHandle};
use crate::sysproxy::{ProxySettings, platform_proxy};
use crate::verifier::{HttpTokenVerifier, VerifierError};

/// Production collaborators for `config`.
pub fn collaborators(config: &Config) -> Result<Collaborators, VerifierError> {
    Ok(Collaborators {
        verifier: Arc::new(HttpTokenVerifier::new(&config.issuer)?),
        engine: Arc::new(ProcessSupervisor::new(config.clone())),
        proxy: platform_proxy(ProxySettings::from_local(&config.local_proxy)),
        probe: Arc::new(HttpProbe::from_config(&config.probe)),
        traffic: Arc::new(|| Box::new(SimulatedTraffic) as Box<dyn TrafficSource>),
    })
}

/// Start a session controller wired to the real engine, proxy and issuer.
pub fn start(config: &Config) -> Result<(SessionHandle, JoinHandle<()>), VerifierError> {
    let collab = collaborators(config)?;
    Ok(SessionController::spawn(
        collab,
        ControllerSettings::from_config(config),
    ))
}
