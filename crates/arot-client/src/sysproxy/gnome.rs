//! GNOME proxy settings via `gsettings`.

use std::ffi::OsStr;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{ProxyError, ProxySettings, SystemProxy};

const PROXY_SCHEMA: &str = "org.gnome.system.proxy";
const HTTP_SCHEMA: &str = "org.gnome.system.proxy.http";
const HTTPS_SCHEMA: &str = "org.gnome.system.proxy.https";

/// Drives `org.gnome.system.proxy` through the `gsettings` CLI.
#[derive(Debug, Clone)]
pub struct GsettingsProxy {
    settings: ProxySettings,
    program: String,
}

impl GsettingsProxy {
    /// Use `gsettings` from `PATH`, if there is one. KDE and headless systems
    /// usually have none.
    pub fn detect(settings: ProxySettings) -> Option<Self> {
        let program = find_program("gsettings", std::env::var_os("PATH").as_deref())?;
        debug!(program = %program.display(), "Found gsettings");
        Some(Self {
            settings,
            program: program.to_string_lossy().into_owned(),
        })
    }

    async fn set(&self, schema: &str, key: &str, value: &str) -> Result<(), ProxyError> {
        debug!(schema, key, value, "gsettings set");
        let output = Command::new(&self.program)
            .args(["set", schema, key, value])
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProxyError::Backend(format!(
                "gsettings set {schema} {key} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl SystemProxy for GsettingsProxy {
    async fn set_enabled(&self, enabled: bool) -> Result<(), ProxyError> {
        if enabled {
            let port = self.settings.port.to_string();
            for schema in [HTTP_SCHEMA, HTTPS_SCHEMA] {
                self.set(schema, "host", &self.settings.host).await?;
                self.set(schema, "port", &port).await?;
            }
            self.set(
                PROXY_SCHEMA,
                "ignore-hosts",
                &ignore_hosts(&self.settings.bypass),
            )
            .await?;
        }
        // Mode flips last so the proxy only turns on once host/port are in place.
        self.set(PROXY_SCHEMA, "mode", if enabled { "manual" } else { "none" })
            .await?;
        info!(enabled, address = %self.settings.address(), "System proxy updated");
        Ok(())
    }
}

/// Translate Windows-style bypass entries into a GVariant string array.
///
/// `127.*` style prefixes become CIDR blocks and `<local>` is dropped.
pub fn ignore_hosts(bypass: &[String]) -> String {
    let entries: Vec<String> = bypass
        .iter()
        .filter(|entry| entry.as_str() != "<local>")
        .map(|entry| format!("'{}'", wildcard_to_cidr(entry)))
        .collect();
    format!("[{}]", entries.join(", "))
}

fn wildcard_to_cidr(entry: &str) -> String {
    let Some(prefix) = entry.strip_suffix(".*") else {
        return entry.to_string();
    };
    let octets: Vec<&str> = prefix.split('.').collect();
    let numeric = octets.iter().all(|o| o.parse::<u8>().is_ok());
    if !numeric || octets.is_empty() || octets.len() > 3 {
        return entry.to_string();
    }
    let mut full = octets.clone();
    full.resize(4, "0");
    format!("{}/{}", full.join("."), octets.len() * 8)
}

/// First file called `name` in the directories of `path_var`.
fn find_program(name: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    std::env::split_paths(path_var?)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
