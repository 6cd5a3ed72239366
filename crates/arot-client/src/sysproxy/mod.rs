//! OS-level system proxy reconciliation.
//!
//! The controller never diffs against a cached state: every call writes the
//! requested state so the OS converges even if something else touched it.

#[cfg(target_os = "linux")]
pub mod gnome;
#[cfg(windows)]
pub mod windows;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use arot_core::config::LocalProxyConfig;

/// Proxy address and bypass list written when enabling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    /// Hosts that skip the proxy, in Windows `ProxyOverride` syntax.
    pub bypass: Vec<String>,
}

impl ProxySettings {
    /// Point the OS at the engine's local HTTP listener.
    pub fn from_local(local: &LocalProxyConfig) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: local.http_port,
            bypass: local.bypass.clone(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Bypass entries joined the way the Windows registry expects.
    pub fn bypass_list(&self) -> String {
        self.bypass.join(";")
    }
}

/// Errors from writing proxy settings.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("System proxy backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Writer for the OS HTTP proxy setting.
#[async_trait]
pub trait SystemProxy: Send + Sync {
    /// Enable (address + bypass list + flag) or disable (flag only).
    /// Idempotent and unconditional.
    async fn set_enabled(&self, enabled: bool) -> Result<(), ProxyError>;
}

/// Backend for platforms without a supported proxy store. Only logs.
#[derive(Debug, Clone)]
pub struct NoopProxy {
    settings: ProxySettings,
}

impl NoopProxy {
    pub const fn new(settings: ProxySettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SystemProxy for NoopProxy {
    async fn set_enabled(&self, enabled: bool) -> Result<(), ProxyError> {
        info!(
            enabled,
            address = %self.settings.address(),
            "System proxy not managed on this platform; configure it manually"
        );
        Ok(())
    }
}

/// The proxy backend for the current platform. Linux without `gsettings`
/// gets the logging backend.
pub fn platform_proxy(settings: ProxySettings) -> Arc<dyn SystemProxy> {
    #[cfg(windows)]
    {
        Arc::new(windows::RegistryProxy::new(settings))
    }
    #[cfg(target_os = "linux")]
    {
        match gnome::GsettingsProxy::detect(settings.clone()) {
            Some(proxy) => Arc::new(proxy),
            None => {
                info!("gsettings not found; the system proxy will not be managed");
                Arc::new(NoopProxy::new(settings))
            }
        }
    }
    #[cfg(not(any(windows, target_os = "linux")))]
    {
        Arc::new(NoopProxy::new(settings))
    }
}
