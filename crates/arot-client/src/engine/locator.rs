//! Engine binary discovery.

use std::path::{Path, PathBuf};

use arot_core::config::EngineSettings;
use tracing::debug;

/// Ordered list of places the engine binary may live.
#[derive(Debug, Clone)]
pub struct EngineLocator {
    candidates: Vec<PathBuf>,
}

impl EngineLocator {
    pub const fn new(candidates: Vec<PathBuf>) -> Self {
        Self { candidates }
    }

    /// Standard search order:
    /// 1. `engine.binary_path` when configured
    /// 2. bundled install directory (`<exe dir>/engine/`)
    /// 3. next to the executable
    /// 4. per-user install directory (`<data dir>/AROT/`)
    pub fn from_settings(settings: &EngineSettings) -> Self {
        let file_name = binary_file_name(&settings.binary_name);
        let mut candidates = Vec::new();

        if let Some(explicit) = &settings.binary_path {
            candidates.push(explicit.clone());
        }
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            candidates.push(exe_dir.join("engine").join(&file_name));
            candidates.push(exe_dir.join(&file_name));
        }
        if let Some(data_dir) = dirs::data_dir() {
            candidates.push(data_dir.join("AROT").join(&file_name));
        }

        Self { candidates }
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// First candidate that exists as a regular file.
    pub fn locate(&self) -> Option<PathBuf> {
        let found = self.candidates.iter().find(|p| p.is_file()).cloned();
        match &found {
            Some(path) => debug!(path = %path.display(), "Found engine binary"),
            None => debug!(searched = self.candidates.len(), "Engine binary not found"),
        }
        found
    }
}

/// Platform file name for the engine binary (`sing-box.exe` on Windows).
pub fn binary_file_name(name: &str) -> String {
    format!("{name}{}", std::env::consts::EXE_SUFFIX)
}
