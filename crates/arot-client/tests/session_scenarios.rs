#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end session flows against in-process fakes.

mod common;

use std::time::Duration;

use arot_client::engine::Engine;
use arot_client::session::{FailureReason, SessionError, SessionEvent, SessionState, UserHint};
use arot_core::TunnelMode;

use common::{Harness, Options, TOKEN_PAGE, drain};

fn states(events: &[SessionEvent]) -> Vec<SessionState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

fn failures(events: &[SessionEvent]) -> Vec<(FailureReason, UserHint)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Failed { reason, hint } => Some((reason.clone(), *hint)),
            _ => None,
        })
        .collect()
}

fn reissue_urls(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ReissueRequired { url } => Some(url.clone()),
            _ => None,
        })
        .collect()
}

// =========================================================================
// Happy paths
// =========================================================================

#[tokio::test]
async fn tun_session_connects_and_disconnects_cleanly() {
    let h = Harness::new(Options::default());
    let mut events = h.handle.subscribe();

    h.handle.connect("valid-token", TunnelMode::Tun).await.unwrap();
    h.reach(SessionState::Connected).await;
    assert!(h.engine.is_running());
    assert!(!h.proxy.ever_enabled(), "tun mode never enables the proxy");

    h.handle.disconnect().await.unwrap();
    assert_eq!(h.handle.state(), SessionState::Disconnected);
    assert!(!h.engine.is_running());
    assert_eq!(h.proxy.writes().last(), Some(&false));

    assert_eq!(
        states(&drain(&mut events)),
        vec![
            SessionState::Verifying,
            SessionState::Connecting,
            SessionState::Connected,
            SessionState::Disconnecting,
            SessionState::Disconnected,
        ]
    );
}

#[tokio::test]
async fn proxy_session_enables_proxy_only_while_connected() {
    let h = Harness::new(Options::default());

    h.handle.connect("valid-token", TunnelMode::Proxy).await.unwrap();
    h.reach(SessionState::Connected).await;
    assert!(h.proxy.enabled());

    h.handle.disconnect().await.unwrap();
    assert!(!h.proxy.enabled());
    assert!(!h.engine.is_running());
}

#[tokio::test]
async fn tun_session_clears_proxy_left_enabled_by_earlier_run() {
    let h = Harness::new(Options {
        proxy_left_enabled: true,
        ..Options::default()
    });

    h.handle.connect("valid-token", TunnelMode::Tun).await.unwrap();
    h.reach(SessionState::Connected).await;
    assert!(!h.proxy.enabled(), "writes: {:?}", h.proxy.writes());
    assert!(h.engine.is_running());

    h.handle.disconnect().await.unwrap();
    assert!(!h.proxy.enabled());
}

#[tokio::test]
async fn controller_start_clears_proxy_left_enabled() {
    let h = Harness::new(Options {
        proxy_left_enabled: true,
        ..Options::default()
    });

    // Any command round-trip proves the startup reconcile has run.
    h.handle.disconnect().await.unwrap();
    assert_eq!(h.proxy.writes(), vec![true, false]);
    assert!(!h.proxy.enabled());
}

#[tokio::test]
async fn usage_is_reported_while_connected() {
    let h = Harness::new(Options {
        bytes_per_tick: 100,
        ..Options::default()
    });
    let mut events = h.handle.subscribe();

    h.handle.connect("valid-token", TunnelMode::Tun).await.unwrap();
    h.reach(SessionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    h.handle.disconnect().await.unwrap();

    let used: Vec<u64> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Usage(report) => Some(report.used_bytes),
            _ => None,
        })
        .collect();
    assert!(!used.is_empty());
    assert!(used.windows(2).all(|w| w[0] < w[1]), "usage is monotonic: {used:?}");
}

// =========================================================================
// Verification failures
// =========================================================================

#[tokio::test]
async fn expired_token_requests_reissue_and_never_starts_engine() {
    let h = Harness::new(Options::default());
    let mut events = h.handle.subscribe();

    h.handle.connect("bad-token", TunnelMode::Tun).await.unwrap();
    h.reach(SessionState::Disconnected).await;

    let events = drain(&mut events);
    assert_eq!(
        failures(&events),
        vec![(
            FailureReason::Rejected("token expired".into()),
            UserHint::Reissue
        )]
    );
    assert_eq!(reissue_urls(&events), vec![TOKEN_PAGE.to_string()]);
    assert_eq!(h.engine.starts(), 0);
    assert!(!h.proxy.ever_enabled());
}

#[tokio::test]
async fn invalid_token_fails_without_reissue() {
    let h = Harness::new(Options::default());
    let mut events = h.handle.subscribe();

    h.handle.connect("invalid-token", TunnelMode::Proxy).await.unwrap();
    h.reach(SessionState::Disconnected).await;

    let events = drain(&mut events);
    assert_eq!(failures(&events)[0].1, UserHint::Retry);
    assert!(reissue_urls(&events).is_empty());
}

#[tokio::test]
async fn no_network_is_a_retryable_failure() {
    let h = Harness::new(Options::default());
    let mut events = h.handle.subscribe();

    h.handle.connect("offline-token", TunnelMode::Tun).await.unwrap();
    h.reach(SessionState::Disconnected).await;

    assert_eq!(
        failures(&drain(&mut events)),
        vec![(FailureReason::NoNetwork, UserHint::Retry)]
    );
}

// =========================================================================
// Tunnel failures
// =========================================================================

#[tokio::test]
async fn missing_engine_in_proxy_mode_keeps_proxy_off() {
    let h = Harness::new(Options::default());
    h.engine.set_missing(true);
    let mut events = h.handle.subscribe();

    h.handle.connect("valid-token", TunnelMode::Proxy).await.unwrap();
    h.reach(SessionState::Disconnected).await;

    let events = drain(&mut events);
    let failed = failures(&events);
    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0].0, FailureReason::EngineNotFound { .. }));
    assert_eq!(failed[0].1, UserHint::InstallEngine);
    assert!(!h.proxy.ever_enabled());
    assert_eq!(h.proxy.writes().last(), Some(&false));
}

#[tokio::test]
async fn broken_engine_fails_with_retry_hint() {
    let h = Harness::new(Options::default());
    h.engine.set_broken(true);
    let mut events = h.handle.subscribe();

    h.handle.connect("valid-token", TunnelMode::Proxy).await.unwrap();
    h.reach(SessionState::Disconnected).await;

    let failed = failures(&drain(&mut events));
    assert_eq!(failed.len(), 1);
    let FailureReason::EngineStartupFailed { detail } = &failed[0].0 else {
        panic!("expected startup failure, got {:?}", failed[0].0);
    };
    assert!(detail.contains("decode config"));
    assert_eq!(failed[0].1, UserHint::Retry);
    assert!(!h.proxy.ever_enabled());
    assert!(!h.engine.is_running());
}

#[tokio::test]
async fn proxy_enable_failure_stops_engine() {
    let h = Harness::new(Options::default());
    h.proxy.set_fail_enable(true);
    let mut events = h.handle.subscribe();

    h.handle.connect("valid-token", TunnelMode::Proxy).await.unwrap();
    h.reach(SessionState::Disconnected).await;

    let events = drain(&mut events);
    let failed = failures(&events);
    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0].0, FailureReason::ProxyFailed(_)));
    assert_eq!(failed[0].1, UserHint::Retry);
    assert!(!states(&events).contains(&SessionState::Connected));
    assert_eq!(h.engine.starts(), 1);
    assert!(h.engine.stops() >= 1);
    assert!(!h.engine.is_running());
    assert!(!h.proxy.enabled());
}

#[tokio::test]
async fn engine_gone_after_failed_check_is_reported_as_died() {
    let h = Harness::new(Options {
        probe_ok: false,
        ..Options::default()
    });
    h.engine.set_exits_on_start(true);
    let mut events = h.handle.subscribe();

    h.handle.connect("valid-token", TunnelMode::Proxy).await.unwrap();
    h.reach(SessionState::Disconnected).await;

    let events = drain(&mut events);
    assert_eq!(
        failures(&events),
        vec![(FailureReason::EngineDied, UserHint::Retry)]
    );
    assert!(!states(&events).contains(&SessionState::Connected));
    assert!(!h.proxy.enabled(), "proxy enabled during establish must be reverted");
}

#[tokio::test]
async fn teardown_continues_when_proxy_cannot_be_disabled() {
    let h = Harness::new(Options::default());

    h.handle.connect("valid-token", TunnelMode::Proxy).await.unwrap();
    h.reach(SessionState::Connected).await;
    h.proxy.set_fail_disable(true);
    let stops_before = h.engine.stops();

    h.handle.disconnect().await.unwrap();

    assert_eq!(h.handle.state(), SessionState::Disconnected);
    assert!(h.engine.stops() > stops_before, "engine stop still attempted");
    assert!(!h.engine.is_running());

    // The controller is usable again once the OS cooperates.
    h.proxy.set_fail_disable(false);
    h.handle.connect("valid-token", TunnelMode::Tun).await.unwrap();
    h.reach(SessionState::Connected).await;
    assert!(!h.proxy.enabled());
    h.handle.disconnect().await.unwrap();
}

#[tokio::test]
async fn strict_probe_failure_tears_down() {
    let h = Harness::new(Options {
        probe_ok: false,
        strict_probe: true,
        ..Options::default()
    });
    let mut events = h.handle.subscribe();

    h.handle.connect("valid-token", TunnelMode::Proxy).await.unwrap();
    h.reach(SessionState::Disconnected).await;

    let failed = failures(&drain(&mut events));
    assert!(matches!(failed[0].0, FailureReason::ProbeFailed(_)));
    assert!(!h.engine.is_running());
    assert!(!h.proxy.enabled());
}

#[tokio::test]
async fn lenient_probe_failure_still_connects() {
    let h = Harness::new(Options {
        probe_ok: false,
        ..Options::default()
    });

    h.handle.connect("valid-token", TunnelMode::Tun).await.unwrap();
    h.reach(SessionState::Connected).await;
    h.handle.disconnect().await.unwrap();
}

// =========================================================================
// Quota and crashes
// =========================================================================

#[tokio::test]
async fn quota_exhaustion_emits_once_then_disconnects() {
    let h = Harness::new(Options {
        limit_bytes: 1000,
        bytes_per_tick: 300,
        ..Options::default()
    });
    let mut events = h.handle.subscribe();

    h.handle.connect("valid-token", TunnelMode::Proxy).await.unwrap();
    // Connected is only transient here; wait for the session to end on its own.
    h.reach(SessionState::Disconnected).await;

    let events = drain(&mut events);
    let exhausted: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::QuotaExhausted { .. }))
        .collect();
    assert_eq!(
        exhausted,
        vec![&SessionEvent::QuotaExhausted {
            used_bytes: 1200,
            limit_bytes: 1000
        }]
    );
    assert!(states(&events).contains(&SessionState::Connected));
    assert_eq!(reissue_urls(&events), vec![TOKEN_PAGE.to_string()]);
    assert!(!h.engine.is_running());
    assert!(!h.proxy.enabled());
}

#[tokio::test]
async fn engine_crash_is_detected_within_a_tick() {
    let h = Harness::new(Options::default());
    let mut events = h.handle.subscribe();

    h.handle.connect("valid-token", TunnelMode::Proxy).await.unwrap();
    h.reach(SessionState::Connected).await;

    h.engine.crash();
    tokio::time::timeout(
        Duration::from_millis(500),
        h.handle.wait_for(|s| *s == SessionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();

    let failed = failures(&drain(&mut events));
    assert_eq!(failed, vec![(FailureReason::EngineDied, UserHint::Retry)]);
    assert!(!h.proxy.enabled());
    assert!(h.engine.stops() >= 1);
}

// =========================================================================
// Commands while busy
// =========================================================================

#[tokio::test]
async fn connect_while_verifying_is_rejected() {
    let h = Harness::new(Options {
        verify_delay: Duration::from_millis(200),
        ..Options::default()
    });

    h.handle.connect("valid-token", TunnelMode::Tun).await.unwrap();
    let err = h.handle.connect("other", TunnelMode::Proxy).await.unwrap_err();
    assert_eq!(
        err,
        SessionError::Busy {
            state: SessionState::Verifying
        }
    );
    h.handle.disconnect().await.unwrap();
}

#[tokio::test]
async fn empty_token_is_rejected() {
    let h = Harness::new(Options::default());
    assert_eq!(
        h.handle.connect("   ", TunnelMode::Tun).await,
        Err(SessionError::EmptyToken)
    );
    assert_eq!(h.handle.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn cancel_during_verification_ignores_late_result() {
    let h = Harness::new(Options {
        verify_delay: Duration::from_millis(50),
        ..Options::default()
    });

    h.handle.connect("valid-token", TunnelMode::Proxy).await.unwrap();
    h.handle.disconnect().await.unwrap();
    assert_eq!(h.handle.state(), SessionState::Disconnected);

    // Let the abandoned verification finish.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(h.handle.state(), SessionState::Disconnected);
    assert_eq!(h.engine.starts(), 0);
    assert!(!h.proxy.ever_enabled());
}

#[tokio::test]
async fn cancel_during_connect_stops_engine() {
    let h = Harness::new(Options {
        start_delay: Duration::from_millis(100),
        ..Options::default()
    });

    h.handle.connect("valid-token", TunnelMode::Proxy).await.unwrap();
    h.reach(SessionState::Connecting).await;
    h.handle.disconnect().await.unwrap();

    assert_eq!(h.handle.state(), SessionState::Disconnected);
    assert!(!h.engine.is_running());
    assert!(!h.proxy.enabled());
}

#[tokio::test]
async fn disconnect_when_idle_is_a_no_op() {
    let h = Harness::new(Options::default());
    h.handle.disconnect().await.unwrap();
    let writes = h.proxy.writes();
    assert_eq!(writes, vec![false], "only the startup reconcile");

    h.handle.disconnect().await.unwrap();
    assert_eq!(h.handle.state(), SessionState::Disconnected);
    assert_eq!(h.proxy.writes(), writes);
    assert_eq!(h.engine.stops(), 0);
}

#[tokio::test]
async fn reconnect_after_disconnect_starts_fresh_session() {
    let h = Harness::new(Options::default());

    h.handle.connect("valid-token", TunnelMode::Proxy).await.unwrap();
    h.reach(SessionState::Connected).await;
    h.handle.disconnect().await.unwrap();

    h.handle.connect("valid-token", TunnelMode::Tun).await.unwrap();
    h.reach(SessionState::Connected).await;
    assert!(!h.proxy.enabled());
    assert_eq!(h.engine.starts(), 2);
    h.handle.disconnect().await.unwrap();
}

// =========================================================================
// Controller lifetime
// =========================================================================

#[tokio::test]
async fn shutdown_tears_down_and_stops_controller() {
    let h = Harness::new(Options::default());

    h.handle.connect("valid-token", TunnelMode::Proxy).await.unwrap();
    h.reach(SessionState::Connected).await;
    h.handle.shutdown().await.unwrap();
    h.task.await.unwrap();

    assert!(!h.engine.is_running());
    assert!(!h.proxy.enabled());
}

#[tokio::test]
async fn commands_after_shutdown_report_stopped_controller() {
    let h = Harness::new(Options::default());
    h.handle.shutdown().await.unwrap();
    assert_eq!(
        h.handle.connect("valid-token", TunnelMode::Tun).await,
        Err(SessionError::ControllerStopped)
    );
}
