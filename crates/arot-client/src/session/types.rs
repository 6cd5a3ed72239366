//! Session types shared between the controller and its observers.

use std::fmt;
use std::path::PathBuf;

use arot_core::TunnelMode;

use crate::engine::EngineError;
use crate::quota::UsageReport;
use crate::verifier::{VerifyResult, reason_needs_reissue};

/// Lifecycle state. Exactly one is current at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Verifying,
    Connecting,
    Connected,
    Disconnecting,
}

impl SessionState {
    /// States with no transition already under way.
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Disconnected | Self::Connected)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Verifying => "verifying",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The active session. Owned by the controller; cleared on teardown so the
/// token never outlives the connection.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub token: String,
    pub mode: TunnelMode,
    pub bytes_used: u64,
}

impl Session {
    pub const fn new(token: String, mode: TunnelMode) -> Self {
        Self {
            token,
            mode,
            bytes_used: 0,
        }
    }

    /// The first few characters of the token, safe to log.
    pub fn redacted_token(&self) -> String {
        let prefix: String = self.token.chars().take(4).collect();
        format!("{prefix}***")
    }
}

/// Why a session ended without the user asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NoNetwork,
    ServerError { status: u16 },
    Rejected(String),
    EngineNotFound { searched: Vec<PathBuf> },
    EngineStartupFailed { detail: String },
    /// The engine was alive at connect time and exited later.
    EngineDied,
    ProxyFailed(String),
    ProbeFailed(String),
}

/// What the user should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserHint {
    /// Obtain a new token from the issuer's page.
    Reissue,
    /// Put the engine binary where it can be found.
    InstallEngine,
    Retry,
}

impl FailureReason {
    pub fn hint(&self) -> UserHint {
        match self {
            Self::Rejected(reason) if reason_needs_reissue(reason) => UserHint::Reissue,
            Self::EngineNotFound { .. } => UserHint::InstallEngine,
            _ => UserHint::Retry,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoNetwork => f.write_str("No internet connection"),
            Self::ServerError { status } => write!(f, "Server Error ({status})"),
            Self::Rejected(reason) => f.write_str(reason),
            Self::EngineNotFound { searched } => {
                write!(f, "sing-box not found (searched {} locations)", searched.len())
            }
            Self::EngineStartupFailed { detail } => write!(f, "sing-box failed to start: {detail}"),
            Self::EngineDied => f.write_str("Tunnel engine stopped unexpectedly"),
            Self::ProxyFailed(e) => write!(f, "Failed to configure system proxy: {e}"),
            Self::ProbeFailed(e) => write!(f, "Connectivity check failed: {e}"),
        }
    }
}

impl FailureReason {
    /// Map a non-Ok verification outcome. `None` for [`VerifyResult::Ok`].
    pub fn from_verify(result: VerifyResult) -> Option<Self> {
        match result {
            VerifyResult::Ok => None,
            VerifyResult::NoNetwork => Some(Self::NoNetwork),
            VerifyResult::ServerError { status } => Some(Self::ServerError { status }),
            VerifyResult::Rejected(reason) => Some(Self::Rejected(reason)),
        }
    }
}

impl From<EngineError> for FailureReason {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound { searched } => Self::EngineNotFound { searched },
            EngineError::StartupFailed { detail } => Self::EngineStartupFailed { detail },
        }
    }
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
        mode: Option<TunnelMode>,
    },
    Usage(UsageReport),
    Failed {
        reason: FailureReason,
        hint: UserHint,
    },
    /// The bandwidth budget ran out and the session was closed.
    QuotaExhausted { used_bytes: u64, limit_bytes: u64 },
    /// The user needs a new token; `url` is where to get one.
    ReissueRequired { url: String },
}

/// Command rejections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("a session is already {state}")]
    Busy { state: SessionState },

    #[error("token is empty")]
    EmptyToken,

    #[error("session controller has stopped")]
    ControllerStopped,
}
