//! WinINet proxy settings in the current user's registry hive.

use async_trait::async_trait;
use tracing::info;
use winreg::RegKey;
use winreg::enums::{HKEY_CURRENT_USER, KEY_WRITE};

use super::{ProxyError, ProxySettings, SystemProxy};

const INTERNET_SETTINGS: &str = r"Software\Microsoft\Windows\CurrentVersion\Internet Settings";

/// Writes `ProxyEnable`, `ProxyServer` and `ProxyOverride` under
/// `HKCU\...\Internet Settings`.
#[derive(Debug, Clone)]
pub struct RegistryProxy {
    settings: ProxySettings,
}

impl RegistryProxy {
    pub const fn new(settings: ProxySettings) -> Self {
        Self { settings }
    }

    fn write(settings: &ProxySettings, enabled: bool) -> Result<(), ProxyError> {
        let hkcu = RegKey::predef(HKEY_CURRENT_USER);
        let key = hkcu.open_subkey_with_flags(INTERNET_SETTINGS, KEY_WRITE)?;
        if enabled {
            key.set_value("ProxyServer", &settings.address())?;
            key.set_value("ProxyOverride", &settings.bypass_list())?;
        }
        key.set_value("ProxyEnable", &u32::from(enabled))?;
        Ok(())
    }
}

#[async_trait]
impl SystemProxy for RegistryProxy {
    async fn set_enabled(&self, enabled: bool) -> Result<(), ProxyError> {
        let settings = self.settings.clone();
        tokio::task::spawn_blocking(move || Self::write(&settings, enabled))
            .await
            .map_err(|e| ProxyError::Backend(format!("registry task failed: {e}")))??;
        info!(enabled, address = %self.settings.address(), "System proxy updated");
        Ok(())
    }
}
