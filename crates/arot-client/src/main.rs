//! AROT client
//!
//! Headless front end for the session controller: connects with the given
//! token, reports progress, and tears the tunnel down on Ctrl+C or SIGTERM.

use std::future::Future;
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use arot_client::session::{FailureReason, SessionEvent, SessionState, UserHint};
use arot_core::TunnelMode;
use arot_core::config::load_config;
use arot_core::tracing_init::{default_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "arot")]
#[command(version, about = "AROT VPN client")]
struct Args {
    /// Access token from the issuer's token page
    #[arg(long, env = "AROT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Route only applications that honour the system proxy instead of
    /// creating a tun interface
    #[arg(long)]
    proxy_mode: bool,

    /// Settings file layered over the global one
    #[arg(long, env = "AROT_CONFIG")]
    config: Option<PathBuf>,

    /// Start quietly: only warnings and errors unless `RUST_LOG` says otherwise
    #[arg(long)]
    minimized: bool,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, default_value = "info", env = "AROT_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "AROT_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.minimized { "warn" } else { args.log_level.as_str() };
    init_tracing(&default_filter(level), args.log_json);

    let config = load_config(args.config.as_deref())?;
    let mode = if args.proxy_mode {
        TunnelMode::Proxy
    } else {
        TunnelMode::Tun
    };
    let Some(token) = args.token.filter(|t| !t.trim().is_empty()) else {
        anyhow::bail!(
            "no token given; pass --token or set AROT_TOKEN (get one at {})",
            config.issuer.token_page_url
        );
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        %mode,
        server = %config.server.address,
        "Starting arot"
    );

    let (session, controller) = arot_client::start(&config)?;
    let mut events = session.subscribe();
    session.connect(token, mode).await?;

    let failure = follow_session(&mut events, shutdown_signal()).await;

    // Idempotent; also covers the case where the session ended on its own.
    if let Err(e) = session.shutdown().await {
        warn!(error = %e, "Session controller already stopped");
    }
    controller.await?;
    info!("Shutdown complete");

    if let Some(reason) = failure {
        anyhow::bail!("session failed: {reason}");
    }
    Ok(())
}

/// Resolves with the signal's name on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => Some(signal),
                Err(e) => {
                    warn!(error = %e, "Cannot listen for SIGTERM");
                    None
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "Ctrl+C",
            Some(()) = async {
                match sigterm.as_mut() {
                    Some(signal) => signal.recv().await,
                    None => std::future::pending().await,
                }
            } => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl+C"
    }
}

/// Log session events until the session ends or `stop` resolves. Returns the
/// failure that ended the session, if any.
async fn follow_session<S>(
    events: &mut broadcast::Receiver<SessionEvent>,
    stop: S,
) -> Option<FailureReason>
where
    S: Future<Output = &'static str> + Send,
{
    // Pinned once so a signal between two events is not lost.
    tokio::pin!(stop);
    let mut failure = None;
    loop {
        tokio::select! {
            signal = &mut stop => {
                info!(signal, "Received signal, disconnecting");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::StateChanged { state: SessionState::Disconnected, .. }) => break,
                Ok(SessionEvent::StateChanged { state, mode }) => {
                    info!(%state, mode = ?mode, "Session state");
                }
                Ok(SessionEvent::Usage(report)) => {
                    info!(
                        used_bytes = report.used_bytes,
                        limit_bytes = report.limit_bytes,
                        percent = format_args!("{:.1}", report.percent),
                        down_rate = report.down_rate,
                        up_rate = report.up_rate,
                        "Usage"
                    );
                }
                Ok(SessionEvent::Failed { reason, hint }) => {
                    match hint {
                        UserHint::InstallEngine => {
                            error!(%reason, "Install sing-box next to arot or set AROT_ENGINE_BIN");
                        }
                        UserHint::Reissue | UserHint::Retry => error!(%reason, "Session failed"),
                    }
                    failure = Some(reason);
                }
                Ok(SessionEvent::QuotaExhausted { used_bytes, limit_bytes }) => {
                    warn!(used_bytes, limit_bytes, "Bandwidth limit reached, session closed");
                }
                Ok(SessionEvent::ReissueRequired { url }) => {
                    warn!(%url, "A new token is required");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
    failure
}
