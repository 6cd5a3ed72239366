//! Post-start connectivity probe.
//!
//! A single GET against an IP echo endpoint. In tun mode the request goes
//! straight out and the OS routes it through the virtual interface; in proxy
//! mode it goes through the local SOCKS listener.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use arot_core::TunnelMode;
use arot_core::config::{LocalProxyConfig, ProbeConfig};

/// How the probe request leaves the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeRoute {
    Direct,
    Socks(String),
}

impl ProbeRoute {
    pub fn for_mode(mode: TunnelMode, local: &LocalProxyConfig) -> Self {
        match mode {
            TunnelMode::Tun => Self::Direct,
            TunnelMode::Proxy => Self::Socks(local.socks_url()),
        }
    }
}

/// What a successful probe observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeSuccess {
    /// Public address reported by the echo endpoint, if it sent one.
    pub origin: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to build probe client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("probe request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("probe endpoint returned HTTP {0}")]
    Status(u16),

    #[error("probe response is not JSON: {0}")]
    Body(String),
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self, route: &ProbeRoute) -> Result<ProbeSuccess, ProbeError>;
}

#[derive(Debug, Deserialize)]
struct EchoBody {
    origin: Option<String>,
}

/// reqwest-backed probe.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(config.url.clone(), config.timeout())
    }

    fn client(&self, route: &ProbeRoute) -> Result<reqwest::Client, ProbeError> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let builder = reqwest::Client::builder().timeout(self.timeout);
        let builder = match route {
            // Never pick up the system proxy we may have just installed.
            ProbeRoute::Direct => builder.no_proxy(),
            ProbeRoute::Socks(url) => {
                builder.proxy(reqwest::Proxy::all(url.as_str()).map_err(ProbeError::Client)?)
            }
        };
        builder.build().map_err(ProbeError::Client)
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self, route: &ProbeRoute) -> Result<ProbeSuccess, ProbeError> {
        let client = self.client(route)?;
        let response = client
            .get(&self.url)
            .send()
            .await
            .map_err(ProbeError::Request)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        let body = response.text().await.map_err(ProbeError::Request)?;
        let echo: EchoBody =
            serde_json::from_str(&body).map_err(|e| ProbeError::Body(e.to_string()))?;

        debug!(origin = ?echo.origin, ?route, "Connectivity probe succeeded");
        Ok(ProbeSuccess {
            origin: echo.origin,
        })
    }
}
