//! sing-box configuration document generation.
//!
//! The engine is driven entirely by the JSON document produced here. Building
//! is pure: the same credentials and mode always yield the same document.
//! Persisting it is the supervisor's job.

use serde::{Deserialize, Serialize};

use crate::config::{Config, LocalProxyConfig, ServerConfig, TunConfig};
use crate::error::Result;
use crate::mode::TunnelMode;

/// Tag of the VLESS outbound carrying tunnelled traffic.
pub const PROXY_OUTBOUND_TAG: &str = "proxy";
/// Tag of the pass-through outbound used for private destinations.
pub const DIRECT_OUTBOUND_TAG: &str = "direct";

const LOOPBACK: &str = "127.0.0.1";

/// Top-level engine configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineDocument {
    pub log: LogSection,
    pub dns: DnsSection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub route: RouteSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogSection {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsSection {
    pub servers: Vec<DnsServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsServer {
    pub tag: String,
    pub address: String,
}

/// Inbound listeners. Which ones appear depends on the tunnel mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Tun {
        tag: String,
        address: Vec<String>,
        mtu: u32,
        auto_route: bool,
        strict_route: bool,
        stack: String,
        sniff: bool,
    },
    Socks {
        tag: String,
        listen: String,
        listen_port: u16,
        sniff: bool,
    },
    Http {
        tag: String,
        listen: String,
        listen_port: u16,
        sniff: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Vless {
        tag: String,
        server: String,
        server_port: u16,
        uuid: String,
        flow: String,
        tcp_fast_open: bool,
        tls: TlsBlock,
    },
    Direct {
        tag: String,
    },
}

/// TLS settings of the VLESS outbound, with uTLS fingerprinting and REALITY.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsBlock {
    pub enabled: bool,
    pub server_name: String,
    pub utls: UtlsBlock,
    pub reality: RealityBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UtlsBlock {
    pub enabled: bool,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RealityBlock {
    pub enabled: bool,
    pub public_key: String,
    pub short_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteSection {
    pub auto_detect_interface: bool,
    pub rules: Vec<RouteRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RouteRule {
    /// Answer DNS queries locally instead of forwarding them.
    HijackDns { protocol: String, action: String },
    /// Keep private destinations off the tunnel.
    PrivateDirect { ip_is_private: bool, outbound: String },
}

impl EngineDocument {
    /// Serialize the document the way it is written to disk.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Builds engine documents from injected credentials.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfigBuilder<'a> {
    server: &'a ServerConfig,
    local: &'a LocalProxyConfig,
    tun: &'a TunConfig,
    log_level: &'a str,
}

impl<'a> EngineConfigBuilder<'a> {
    pub const fn new(
        server: &'a ServerConfig,
        local: &'a LocalProxyConfig,
        tun: &'a TunConfig,
        log_level: &'a str,
    ) -> Self {
        Self {
            server,
            local,
            tun,
            log_level,
        }
    }

    pub fn from_config(config: &'a Config) -> Self {
        Self::new(
            &config.server,
            &config.local_proxy,
            &config.tun,
            &config.engine.log_level,
        )
    }

    /// Build the document for `mode`.
    pub fn build(&self, mode: TunnelMode) -> EngineDocument {
        EngineDocument {
            log: LogSection {
                level: self.log_level.to_string(),
            },
            dns: DnsSection {
                servers: vec![
                    DnsServer {
                        tag: "remote".into(),
                        address: "8.8.8.8".into(),
                    },
                    DnsServer {
                        tag: "local".into(),
                        address: "8.8.4.4".into(),
                    },
                ],
            },
            inbounds: self.inbounds(mode),
            outbounds: vec![
                self.vless_outbound(),
                Outbound::Direct {
                    tag: DIRECT_OUTBOUND_TAG.into(),
                },
            ],
            route: RouteSection {
                auto_detect_interface: true,
                rules: vec![
                    RouteRule::HijackDns {
                        protocol: "dns".into(),
                        action: "hijack-dns".into(),
                    },
                    RouteRule::PrivateDirect {
                        ip_is_private: true,
                        outbound: DIRECT_OUTBOUND_TAG.into(),
                    },
                ],
            },
        }
    }

    fn inbounds(&self, mode: TunnelMode) -> Vec<Inbound> {
        match mode {
            TunnelMode::Tun => vec![Inbound::Tun {
                tag: "tun-in".into(),
                address: vec![self.tun.address.clone()],
                mtu: self.tun.mtu,
                auto_route: true,
                strict_route: true,
                stack: self.tun.stack.clone(),
                sniff: true,
            }],
            TunnelMode::Proxy => vec![
                Inbound::Socks {
                    tag: "socks-in".into(),
                    listen: LOOPBACK.into(),
                    listen_port: self.local.socks_port,
                    sniff: true,
                },
                Inbound::Http {
                    tag: "http-in".into(),
                    listen: LOOPBACK.into(),
                    listen_port: self.local.http_port,
                    sniff: true,
                },
            ],
        }
    }

    fn vless_outbound(&self) -> Outbound {
        Outbound::Vless {
            tag: PROXY_OUTBOUND_TAG.into(),
            server: self.server.address.clone(),
            server_port: self.server.port,
            uuid: self.server.uuid.clone(),
            flow: self.server.flow.clone(),
            tcp_fast_open: true,
            tls: TlsBlock {
                enabled: true,
                server_name: self.server.server_name.clone(),
                utls: UtlsBlock {
                    enabled: true,
                    fingerprint: self.server.fingerprint.clone(),
                },
                reality: RealityBlock {
                    enabled: true,
                    public_key: self.server.public_key.clone(),
                    short_id: self.server.short_id.clone(),
                },
            },
        }
    }
}
