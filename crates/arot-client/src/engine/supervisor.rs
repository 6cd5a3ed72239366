//! sing-box process lifecycle manager.
//!
//! Manages config file persistence, spawning, startup verification, and
//! graceful shutdown of the engine process.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use arot_core::{Config, EngineConfigBuilder, TunnelMode};

use super::{Engine, EngineError, EngineLocator};

/// Number of stderr lines kept for startup diagnostics.
const STDERR_TAIL_LINES: usize = 20;
/// Longest diagnostic excerpt surfaced in a startup error.
const STARTUP_DETAIL_CHARS: usize = 200;
/// Upper bound on waiting for the stderr reader after an early exit.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Supervisor for the single engine process.
pub struct ProcessSupervisor {
    config: Config,
    locator: EngineLocator,
    /// Binary path, resolved on the first successful lookup.
    binary: OnceLock<PathBuf>,
    config_path: PathBuf,
    start_grace: Duration,
    stop_timeout: Duration,
    running: Mutex<Option<RunningEngine>>,
    /// Serializes start/stop so they never interleave.
    lifecycle: tokio::sync::Mutex<()>,
}

struct RunningEngine {
    child: Child,
    stderr_tail: StderrTail,
    readers: Vec<JoinHandle<()>>,
}

impl ProcessSupervisor {
    /// Create a supervisor using the standard binary search locations.
    pub fn new(config: Config) -> Self {
        let locator = EngineLocator::from_settings(&config.engine);
        Self::with_locator(config, locator)
    }

    /// Create a supervisor with an explicit set of binary candidates.
    pub fn with_locator(config: Config, locator: EngineLocator) -> Self {
        Self {
            config_path: config.engine.config_path(),
            start_grace: config.engine.start_grace(),
            stop_timeout: config.engine.stop_timeout(),
            config,
            locator,
            binary: OnceLock::new(),
            running: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Override the startup grace interval and graceful-stop timeout.
    #[must_use]
    pub fn with_timeouts(mut self, start_grace: Duration, stop_timeout: Duration) -> Self {
        self.start_grace = start_grace;
        self.stop_timeout = stop_timeout;
        self
    }

    /// Location of the ephemeral engine config file.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// OS process id of the running engine, if any.
    pub fn pid(&self) -> Option<u32> {
        self.lock_running().as_ref().and_then(|e| e.child.id())
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<RunningEngine>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve_binary(&self) -> Result<PathBuf, EngineError> {
        if let Some(path) = self.binary.get() {
            return Ok(path.clone());
        }
        let path = self.locator.locate().ok_or_else(|| {
            error!(
                searched = ?self.locator.candidates(),
                "sing-box binary not found"
            );
            EngineError::NotFound {
                searched: self.locator.candidates().to_vec(),
            }
        })?;
        Ok(self.binary.get_or_init(|| path).clone())
    }

    async fn write_config(&self, mode: TunnelMode) -> Result<(), EngineError> {
        let document = EngineConfigBuilder::from_config(&self.config).build(mode);
        let json = document
            .to_json_pretty()
            .map_err(|e| EngineError::StartupFailed {
                detail: format!("Failed to serialize engine config: {e}"),
            })?;
        tokio::fs::write(&self.config_path, json)
            .await
            .map_err(|e| EngineError::StartupFailed {
                detail: format!(
                    "Failed to write engine config {}: {e}",
                    self.config_path.display()
                ),
            })?;
        debug!(path = %self.config_path.display(), %mode, "Engine config written");
        Ok(())
    }

    fn spawn(&self, binary: &Path) -> Result<RunningEngine, EngineError> {
        let mut cmd = Command::new(binary);
        cmd.arg("run")
            .arg("-c")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|e| EngineError::StartupFailed {
            detail: format!("Failed to spawn {}: {e}", binary.display()),
        })?;
        let pid = child.id().unwrap_or_default();

        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_stdout(stdout, pid)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_stderr(
                stderr,
                pid,
                Arc::clone(&stderr_tail),
            )));
        }

        Ok(RunningEngine {
            child,
            stderr_tail,
            readers,
        })
    }

    /// Exit status of the engine if it has already terminated.
    fn exited_status(&self) -> Option<ExitStatus> {
        let mut running = self.lock_running();
        let engine = running.as_mut()?;
        match engine.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Failed to poll engine status");
                None
            }
        }
    }

    async fn stop_locked(&self) {
        let engine = self.lock_running().take();

        if let Some(mut engine) = engine {
            let pid = engine.child.id();
            debug!(?pid, "Terminating engine");
            request_termination(&mut engine.child);

            match tokio::time::timeout(self.stop_timeout, engine.child.wait()).await {
                Ok(Ok(status)) => info!(?pid, %status, "Engine exited"),
                Ok(Err(e)) => {
                    warn!(?pid, error = %e, "Error waiting for engine, killing");
                    engine.child.kill().await.ok();
                }
                Err(_) => {
                    warn!(?pid, "Timeout waiting for graceful shutdown, killing");
                    engine.child.kill().await.ok();
                }
            }
            for reader in engine.readers {
                reader.abort();
            }
        }

        self.remove_config().await;
    }

    async fn remove_config(&self) {
        match tokio::fs::remove_file(&self.config_path).await {
            Ok(()) => debug!(path = %self.config_path.display(), "Engine config removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.config_path.display(),
                error = %e,
                "Failed to remove engine config"
            ),
        }
    }

    /// Collect diagnostics from an engine that died during the grace period.
    async fn reap_failed_start(&self, status: ExitStatus) -> EngineError {
        let engine = self.lock_running().take();
        let mut tail = String::new();

        if let Some(engine) = engine {
            // Let the stderr reader drain what the engine printed before exiting.
            for reader in engine.readers {
                let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, reader).await;
            }
            let lines = engine
                .stderr_tail
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned()
                .collect::<Vec<_>>();
            tail = lines.join("\n");
        }
        self.remove_config().await;

        error!(%status, stderr = %tail, "sing-box exited during startup");
        let detail = if tail.trim().is_empty() {
            format!("process exited with {status}")
        } else {
            truncate_chars(tail.trim(), STARTUP_DETAIL_CHARS)
        };
        EngineError::StartupFailed { detail }
    }
}

#[async_trait]
impl Engine for ProcessSupervisor {
    async fn start(&self, mode: TunnelMode) -> Result<(), EngineError> {
        let _guard = self.lifecycle.lock().await;

        if self.is_running() {
            warn!("Engine already running, stopping it before restart");
        }
        self.stop_locked().await;

        let binary = self.resolve_binary()?;
        self.write_config(mode).await?;

        info!(
            binary = %binary.display(),
            config = %self.config_path.display(),
            %mode,
            "Starting sing-box"
        );
        let engine = match self.spawn(&binary) {
            Ok(engine) => engine,
            Err(e) => {
                self.remove_config().await;
                return Err(e);
            }
        };
        let pid = engine.child.id();
        *self.lock_running() = Some(engine);

        // Bad configs and port conflicts make the engine exit right away, so a
        // successful spawn alone proves nothing.
        tokio::time::sleep(self.start_grace).await;
        if let Some(status) = self.exited_status() {
            return Err(self.reap_failed_start(status).await);
        }

        info!(?pid, "sing-box started");
        Ok(())
    }

    async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked().await;
    }

    fn is_running(&self) -> bool {
        let mut running = self.lock_running();
        running
            .as_mut()
            .is_some_and(|engine| matches!(engine.child.try_wait(), Ok(None)))
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(mut engine) = self.lock_running().take() {
            warn!("Supervisor dropped with engine running, killing it");
            engine.child.start_kill().ok();
        }
        let _ = std::fs::remove_file(&self.config_path);
    }
}

/// Ask the engine to exit: SIGTERM on Unix, a hard kill elsewhere.
fn request_termination(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!(pid, error = %e, "Failed to send SIGTERM");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = child.start_kill() {
            warn!(error = %e, "Failed to terminate engine");
        }
    }
}

async fn forward_stdout<R>(stdout: R, pid: u32)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(pid, "sing-box: {}", line);
    }
    debug!(pid, "stdout reader finished");
}

async fn forward_stderr<R>(stderr: R, pid: u32, tail: StderrTail)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(pid, "sing-box stderr: {}", line);
        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    debug!(pid, "stderr reader finished");
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
