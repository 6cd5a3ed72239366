//! sing-box engine supervision.
//!
//! The engine is an opaque external program. This module only knows how to
//! find it, hand it a configuration file, and keep track of whether it is
//! still alive.

pub mod locator;
pub mod supervisor;

use async_trait::async_trait;
use std::path::PathBuf;

use arot_core::TunnelMode;

pub use locator::EngineLocator;
pub use supervisor::ProcessSupervisor;

/// Process-level control over the tunnel engine.
///
/// Implemented by [`ProcessSupervisor`]; the session controller only talks to
/// the engine through this trait so tests can substitute a fake.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Write a fresh config for `mode` and launch the engine. Any running
    /// instance is stopped first.
    async fn start(&self, mode: TunnelMode) -> Result<(), EngineError>;

    /// Terminate the engine and remove its config file. Safe to call when
    /// nothing is running.
    async fn stop(&self);

    /// Whether an engine process exists and has not exited. Never blocks.
    fn is_running(&self) -> bool;
}

/// Errors from starting the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("sing-box binary not found (searched {} location(s))", .searched.len())]
    NotFound { searched: Vec<PathBuf> },

    #[error("sing-box failed to start: {detail}")]
    StartupFailed { detail: String },
}
