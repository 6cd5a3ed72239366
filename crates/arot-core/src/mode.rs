//! Tunnel mode selection.

use serde::{Deserialize, Serialize};

/// How traffic reaches the engine for a session.
///
/// Chosen at connect time and fixed for the lifetime of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// All OS traffic goes through the engine's virtual interface.
    #[default]
    Tun,
    /// Only traffic sent to the local SOCKS/HTTP listeners is tunnelled.
    /// The OS system proxy is pointed at the HTTP listener while connected.
    Proxy,
}

impl TunnelMode {
    /// Whether the OS system proxy must be enabled while connected in this mode.
    pub const fn uses_system_proxy(self) -> bool {
        matches!(self, Self::Proxy)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tun => "tun",
            Self::Proxy => "proxy",
        }
    }
}

impl std::fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
