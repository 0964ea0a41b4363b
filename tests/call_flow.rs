//! End-to-end: echter Relay auf einem freien Port, zwei Endpoints mit
//! Loopback-Plattform.

use rendezvous_lib::call_engine::{CallError, EndReason, LoopbackPlatform, Notification, Phase};
use rendezvous_lib::config::{CallConfig, RelayConfig};
use rendezvous_lib::signaling::{serve, CallKind, RelayRouter};
use rendezvous_lib::CallApp;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> (CallConfig, Arc<RelayRouter>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Arc::new(RelayRouter::new());

    let server_router = Arc::clone(&router);
    tokio::spawn(async move {
        let config = RelayConfig::default();
        let _ = serve(listener, server_router, &config).await;
    });

    let config = CallConfig {
        signaling_url: format!("ws://{}/ws", addr),
        ..CallConfig::default()
    };
    (config, router)
}

async fn endpoint(config: &CallConfig, platform: &LoopbackPlatform) -> CallApp {
    CallApp::connect(config, platform.clone()).await.unwrap()
}

async fn wait_for(
    rx: &mut broadcast::Receiver<Notification>,
    predicate: impl Fn(&Notification) -> bool,
) -> Notification {
    timeout(WAIT, async {
        loop {
            let notification = rx.recv().await.expect("notification channel closed");
            if predicate(&notification) {
                return notification;
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

async fn wait_until(condition: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

fn is_active(n: &Notification) -> bool {
    *n == Notification::PhaseChanged(Phase::Active)
}

#[tokio::test]
async fn test_endpoints_get_distinct_ids() {
    let (config, router) = start_relay().await;
    let platform = LoopbackPlatform::new();

    let x = endpoint(&config, &platform).await;
    let y = endpoint(&config, &platform).await;

    assert_ne!(x.endpoint_id(), y.endpoint_id());
    assert!(router.is_registered(x.endpoint_id()));
    assert!(router.is_registered(y.endpoint_id()));
    assert!(x.is_connected());
}

#[tokio::test]
async fn test_audio_call_rings_then_connects() {
    let (config, _router) = start_relay().await;
    let x_platform = LoopbackPlatform::new();
    let y_platform = LoopbackPlatform::new();
    let x = endpoint(&config, &x_platform).await;
    let y = endpoint(&config, &y_platform).await;
    let mut x_events = x.subscribe();
    let mut y_events = y.subscribe();

    x.start_call(y.endpoint_id(), CallKind::Audio).await.unwrap();

    let incoming = wait_for(&mut y_events, |n| {
        matches!(n, Notification::IncomingCall { .. })
    })
    .await;
    assert_eq!(
        incoming,
        Notification::IncomingCall {
            from: x.endpoint_id().to_string(),
            kind: CallKind::Audio,
        }
    );
    assert_eq!(y.phase(), Phase::Ringing);
    assert!(matches!(x.phase(), Phase::Dialing | Phase::Negotiating));

    y.accept().await.unwrap();
    wait_for(&mut x_events, is_active).await;
    wait_for(&mut y_events, is_active).await;

    assert_eq!(x.state().peer.as_deref(), Some(y.endpoint_id()));
    assert_eq!(y.state().peer.as_deref(), Some(x.endpoint_id()));
    assert_eq!(y_platform.ledger().remote_descriptions.len(), 1);
    wait_until(|| x_platform.ledger().remote_descriptions.len() == 1).await;
}

#[tokio::test]
async fn test_reject_returns_caller_to_idle() {
    let (config, _router) = start_relay().await;
    let x_platform = LoopbackPlatform::new();
    let x = endpoint(&config, &x_platform).await;
    let y = endpoint(&config, &LoopbackPlatform::new()).await;
    let mut x_events = x.subscribe();
    let mut y_events = y.subscribe();

    x.start_call(y.endpoint_id(), CallKind::Video).await.unwrap();
    wait_for(&mut y_events, |n| {
        matches!(n, Notification::IncomingCall { .. })
    })
    .await;

    y.reject().await.unwrap();
    assert_eq!(y.phase(), Phase::Idle);

    let ended = wait_for(&mut x_events, |n| {
        matches!(n, Notification::CallEnded { .. })
    })
    .await;
    assert_eq!(
        ended,
        Notification::CallEnded {
            peer: Some(y.endpoint_id().to_string()),
            reason: EndReason::RemoteReject,
        }
    );
    assert_eq!(x.phase(), Phase::Idle);
    wait_until(|| x_platform.ledger().is_balanced()).await;
}

#[tokio::test]
async fn test_early_candidates_are_applied_in_order() {
    let (config, _router) = start_relay().await;
    let x_platform = LoopbackPlatform::new().with_local_candidates(3);
    let y_platform = LoopbackPlatform::new();
    let x = endpoint(&config, &x_platform).await;
    let y = endpoint(&config, &y_platform).await;
    let mut y_events = y.subscribe();

    // Candidates von X treffen ein, während Y noch klingelt
    x.start_call(y.endpoint_id(), CallKind::Audio).await.unwrap();
    wait_for(&mut y_events, |n| {
        matches!(n, Notification::IncomingCall { .. })
    })
    .await;

    y.accept().await.unwrap();
    wait_for(&mut y_events, is_active).await;
    wait_until(|| y_platform.ledger().applied_candidates.len() == 3).await;

    let applied = y_platform.ledger().applied_candidates;
    for (n, candidate) in applied.iter().enumerate() {
        assert!(
            candidate.contains(&format!(" {} typ host", 50000 + n)),
            "candidate {} out of order: {}",
            n,
            candidate
        );
    }
}

#[tokio::test]
async fn test_hangup_tears_down_both_sides() {
    let (config, _router) = start_relay().await;
    let x_platform = LoopbackPlatform::new();
    let y_platform = LoopbackPlatform::new();
    let x = endpoint(&config, &x_platform).await;
    let y = endpoint(&config, &y_platform).await;
    let mut x_events = x.subscribe();
    let mut y_events = y.subscribe();

    x.start_call(y.endpoint_id(), CallKind::Audio).await.unwrap();
    wait_for(&mut y_events, |n| {
        matches!(n, Notification::IncomingCall { .. })
    })
    .await;
    y.accept().await.unwrap();
    wait_for(&mut x_events, is_active).await;

    x.hangup().await.unwrap();
    assert_eq!(x.phase(), Phase::Idle);

    let ended = wait_for(&mut y_events, |n| {
        matches!(n, Notification::CallEnded { .. })
    })
    .await;
    assert_eq!(
        ended,
        Notification::CallEnded {
            peer: Some(x.endpoint_id().to_string()),
            reason: EndReason::RemoteHangup,
        }
    );
    assert_eq!(y.phase(), Phase::Idle);

    wait_until(|| x_platform.ledger().is_balanced()).await;
    wait_until(|| y_platform.ledger().is_balanced()).await;

    // Beide sind wieder frei für einen neuen Anruf
    y.start_call(x.endpoint_id(), CallKind::Audio).await.unwrap();
    wait_for(&mut x_events, |n| {
        matches!(n, Notification::IncomingCall { .. })
    })
    .await;
}

#[tokio::test]
async fn test_third_caller_gets_busy_reject() {
    let (config, _router) = start_relay().await;
    let x = endpoint(&config, &LoopbackPlatform::new()).await;
    let y = endpoint(&config, &LoopbackPlatform::new()).await;
    let z = endpoint(&config, &LoopbackPlatform::new()).await;
    let mut y_events = y.subscribe();
    let mut z_events = z.subscribe();

    x.start_call(y.endpoint_id(), CallKind::Audio).await.unwrap();
    wait_for(&mut y_events, |n| {
        matches!(n, Notification::IncomingCall { .. })
    })
    .await;

    z.start_call(y.endpoint_id(), CallKind::Audio).await.unwrap();
    let busy = wait_for(&mut y_events, |n| {
        matches!(n, Notification::BusyRejected { .. })
    })
    .await;
    assert_eq!(
        busy,
        Notification::BusyRejected {
            from: z.endpoint_id().to_string(),
        }
    );

    let ended = wait_for(&mut z_events, |n| {
        matches!(n, Notification::CallEnded { .. })
    })
    .await;
    assert!(matches!(
        ended,
        Notification::CallEnded {
            reason: EndReason::RemoteReject,
            ..
        }
    ));

    // Der erste Anruf klingelt weiter
    assert_eq!(y.phase(), Phase::Ringing);
    assert_eq!(y.state().peer.as_deref(), Some(x.endpoint_id()));
}

#[tokio::test]
async fn test_calling_yourself_is_refused() {
    let (config, _router) = start_relay().await;
    let x = endpoint(&config, &LoopbackPlatform::new()).await;

    assert_eq!(
        x.start_call(x.endpoint_id(), CallKind::Audio).await,
        Err(CallError::SelfCall)
    );
    assert_eq!(x.phase(), Phase::Idle);
}

#[tokio::test]
async fn test_unreachable_peer_times_out() {
    let (config, _router) = start_relay().await;
    let config = config.with_dial_timeout(Duration::from_millis(200));
    let x_platform = LoopbackPlatform::new();
    let x = endpoint(&config, &x_platform).await;
    let mut x_events = x.subscribe();

    x.start_call("nobody-home", CallKind::Audio).await.unwrap();

    let ended = wait_for(&mut x_events, |n| {
        matches!(n, Notification::CallEnded { .. })
    })
    .await;
    assert!(matches!(
        ended,
        Notification::CallEnded {
            reason: EndReason::DialTimeout,
            ..
        }
    ));
    assert_eq!(x.phase(), Phase::Idle);
    wait_until(|| x_platform.ledger().is_balanced()).await;
}

#[tokio::test]
async fn test_dropping_endpoint_ends_call_and_deregisters() {
    let (config, router) = start_relay().await;
    let x = endpoint(&config, &LoopbackPlatform::new()).await;
    let y = endpoint(&config, &LoopbackPlatform::new()).await;
    let mut x_events = x.subscribe();
    let mut y_events = y.subscribe();

    x.start_call(y.endpoint_id(), CallKind::Audio).await.unwrap();
    wait_for(&mut y_events, |n| {
        matches!(n, Notification::IncomingCall { .. })
    })
    .await;
    y.accept().await.unwrap();
    wait_for(&mut x_events, is_active).await;

    let x_id = x.endpoint_id().to_string();
    drop(x);

    let ended = wait_for(&mut y_events, |n| {
        matches!(n, Notification::CallEnded { .. })
    })
    .await;
    assert!(matches!(
        ended,
        Notification::CallEnded {
            reason: EndReason::RemoteHangup,
            ..
        }
    ));
    wait_until(|| !router.is_registered(&x_id)).await;
}
