//! Per-session bandwidth accounting and engine liveness watch.
//!
//! Byte counts come from a [`TrafficSource`]. The shipped source is
//! simulated; a real one would read counters from the engine.

use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;

const KIB: u64 = 1024;

/// Bytes moved during one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSample {
    pub down_bytes: u64,
    pub up_bytes: u64,
}

impl TrafficSample {
    pub const fn total(self) -> u64 {
        self.down_bytes.saturating_add(self.up_bytes)
    }
}

/// Supplies per-tick traffic counters.
pub trait TrafficSource: Send {
    fn sample(&mut self) -> TrafficSample;
}

/// Random traffic in the range a light browsing session produces.
#[derive(Debug, Default)]
pub struct SimulatedTraffic;

impl TrafficSource for SimulatedTraffic {
    fn sample(&mut self) -> TrafficSample {
        let mut rng = rand::rng();
        TrafficSample {
            down_bytes: rng.random_range(40 * KIB..=120 * KIB),
            up_bytes: rng.random_range(10 * KIB..=40 * KIB),
        }
    }
}

/// Snapshot published after every tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageReport {
    pub used_bytes: u64,
    pub limit_bytes: u64,
    /// Share of the budget consumed, capped at 100.
    pub percent: f64,
    /// Bytes per second over the last tick.
    pub down_rate: u64,
    pub up_rate: u64,
}

impl UsageReport {
    #[allow(clippy::cast_precision_loss)]
    fn new(used_bytes: u64, limit_bytes: u64, sample: TrafficSample, tick: Duration) -> Self {
        let percent = if limit_bytes == 0 {
            100.0
        } else {
            (used_bytes as f64 / limit_bytes as f64 * 100.0).min(100.0)
        };
        let tick_ms = u64::try_from(tick.as_millis()).unwrap_or(u64::MAX).max(1);
        Self {
            used_bytes,
            limit_bytes,
            percent,
            down_rate: sample.down_bytes.saturating_mul(1000) / tick_ms,
            up_rate: sample.up_bytes.saturating_mul(1000) / tick_ms,
        }
    }

    pub const fn is_exhausted(&self) -> bool {
        self.used_bytes >= self.limit_bytes
    }
}

/// Events emitted by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaEvent {
    Usage(UsageReport),
    /// Emitted once, right after the usage report that crossed the limit.
    Exhausted(UsageReport),
    /// The engine process is gone although nobody asked it to stop.
    EngineCrashed,
}

/// Accumulates usage for one session and watches the engine.
pub struct QuotaMonitor {
    limit_bytes: u64,
    tick: Duration,
    engine: Arc<dyn Engine>,
    source: Box<dyn TrafficSource>,
}

impl QuotaMonitor {
    pub fn new(
        limit_bytes: u64,
        tick: Duration,
        engine: Arc<dyn Engine>,
        source: Box<dyn TrafficSource>,
    ) -> Self {
        Self {
            limit_bytes,
            tick,
            engine,
            source,
        }
    }

    /// Run on a background task until cancelled, exhausted, or the engine
    /// dies. `emit` returns `false` once nobody is listening.
    pub fn spawn<F>(self, cancel: CancellationToken, emit: F) -> JoinHandle<()>
    where
        F: Fn(QuotaEvent) -> bool + Send + 'static,
    {
        tokio::spawn(self.run(cancel, emit))
    }

    async fn run<F>(mut self, cancel: CancellationToken, emit: F)
    where
        F: Fn(QuotaEvent) -> bool + Send + 'static,
    {
        let mut used: u64 = 0;
        let mut timer = tokio::time::interval(self.tick);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(used_bytes = used, "Quota monitor cancelled");
                    return;
                }
                _ = timer.tick() => {}
            }

            if !self.engine.is_running() {
                warn!(used_bytes = used, "Engine exited unexpectedly");
                emit(QuotaEvent::EngineCrashed);
                return;
            }

            let sample = self.source.sample();
            used = used.saturating_add(sample.total());
            let report = UsageReport::new(used, self.limit_bytes, sample, self.tick);

            if !emit(QuotaEvent::Usage(report)) {
                return;
            }
            if report.is_exhausted() {
                info!(
                    used_bytes = used,
                    limit_bytes = self.limit_bytes,
                    "Session quota exhausted"
                );
                emit(QuotaEvent::Exhausted(report));
                return;
            }
        }
    }
}
