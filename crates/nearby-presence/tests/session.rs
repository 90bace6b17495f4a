//! Presence sessions against the in-process hub.

use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use nearby_core::{Coordinate, GhostPolicy, Placement, PresenceUpdate};
use nearby_presence::{
    Channel, ConnectionState, LocalHub, PresenceSession, SessionConfig, Transport, TransportError,
};
use tokio::time::{Instant, sleep};

const TOPIC: &str = "map-presence";

fn config(user: &str) -> SessionConfig {
    let mut cfg = SessionConfig::new(user)
        .with_topic(TOPIC)
        .with_backoff(Duration::from_millis(20), Duration::from_millis(100));
    cfg.client_id = format!("client-{user}");
    cfg
}

fn at(lat: f64, lon: f64) -> PresenceUpdate {
    PresenceUpdate::placement(Placement {
        display_position: Some(Coordinate::new(lat, lon).unwrap()),
        snapped_venue_id: None,
    })
}

/// Poll until `cond` holds or three seconds pass.
async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn rosters_converge_across_clients() {
    let hub = LocalHub::new();
    let a = PresenceSession::start(hub.clone(), config("alice"));
    let b = PresenceSession::start(hub.clone(), config("bob"));
    assert!(eventually(|| a.is_connected() && b.is_connected()).await);

    a.update_presence(at(40.0, -73.0)).unwrap();
    b.update_presence(at(40.001, -73.0)).unwrap();

    assert!(eventually(|| a.roster().len() == 2 && b.roster().len() == 2).await);
    assert_eq!(*a.roster(), *b.roster());
    let alice = b.roster().get("alice").cloned().unwrap();
    assert_eq!(alice.display_position, Coordinate::new(40.0, -73.0).ok());
}

#[tokio::test]
async fn disconnect_keeps_roster_and_defers_publishes() {
    let hub = LocalHub::new();
    let a = PresenceSession::start(hub.clone(), config("alice"));
    let b = PresenceSession::start(hub.clone(), config("bob"));
    b.update_presence(at(40.001, -73.0)).unwrap();
    assert!(eventually(|| a.roster().contains("bob")).await);

    hub.set_available(false);
    assert!(hub.sever(TOPIC, "client-alice"));
    assert!(eventually(|| !a.is_connected()).await);
    assert!(a.roster().contains("bob"), "last roster should survive the drop");
    assert!(matches!(
        a.snapshot().last_error,
        Some(TransportError::Disconnected(_) | TransportError::Connect(_))
    ));

    // No channel: nothing reaches the hub
    a.update_presence(at(40.0, -73.0)).unwrap();
    sleep(Duration::from_millis(150)).await;
    assert!(!a.is_connected());
    assert!(hub.roster(TOPIC).iter().all(|r| r.user_id != "alice"));
    assert!(a.snapshot().own.has_position());

    hub.set_available(true);
    assert!(eventually(|| a.is_connected()).await);
    let home = Coordinate::new(40.0, -73.0).ok();
    assert!(
        eventually(|| hub
            .roster(TOPIC)
            .iter()
            .any(|r| r.user_id == "alice" && r.display_position == home))
        .await
    );
    assert!(eventually(|| b.roster().contains("alice")).await);
    assert!(a.snapshot().last_error.is_none());
}

#[tokio::test]
async fn initial_subscribe_failure_retries() {
    let hub = LocalHub::new();
    hub.set_available(false);
    let a = PresenceSession::start(hub.clone(), config("alice"));
    sleep(Duration::from_millis(60)).await;
    assert!(!a.is_connected());
    assert!(matches!(a.snapshot().last_error, Some(TransportError::Connect(_))));

    hub.set_available(true);
    assert!(eventually(|| a.is_connected()).await);
}

#[tokio::test]
async fn ghost_mode_removes_only_own_record() {
    let hub = LocalHub::new();
    let a = PresenceSession::start(hub.clone(), config("alice"));
    let b = PresenceSession::start(hub.clone(), config("bob"));
    let c = PresenceSession::start(hub.clone(), config("carol"));
    a.update_presence(at(40.0, -73.0)).unwrap();
    c.update_presence(at(40.002, -73.0)).unwrap();
    assert!(eventually(|| b.roster().contains("alice") && b.roster().contains("carol")).await);

    a.set_ghost(true).unwrap();
    assert!(eventually(|| !b.roster().contains("alice")).await);
    assert!(b.roster().contains("carol"));

    // Untrack policy: still subscribed, still watching
    assert!(a.is_connected());
    assert!(a.roster().contains("carol"));

    // Further moves stay private
    a.update_presence(at(40.01, -73.0)).unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(!b.roster().contains("alice"));

    a.set_ghost(false).unwrap();
    assert!(
        eventually(|| b
            .roster()
            .get("alice")
            .is_some_and(|r| r.display_position == Coordinate::new(40.01, -73.0).ok()))
        .await
    );
}

#[tokio::test]
async fn ghost_disconnect_policy_leaves_channel() {
    let hub = LocalHub::new();
    let a = PresenceSession::start(
        hub.clone(),
        config("alice").with_ghost_policy(GhostPolicy::Disconnect),
    );
    let b = PresenceSession::start(hub.clone(), config("bob"));
    a.update_presence(at(40.0, -73.0)).unwrap();
    b.update_presence(at(40.001, -73.0)).unwrap();
    assert!(eventually(|| b.roster().contains("alice") && a.roster().contains("bob")).await);

    a.set_ghost(true).unwrap();
    assert!(eventually(|| !a.is_connected() && hub.member_count(TOPIC) == 1).await);
    assert!(eventually(|| !b.roster().contains("alice")).await);
    assert!(a.roster().contains("bob"));

    // No reconnect attempts while ghosted
    sleep(Duration::from_millis(150)).await;
    assert!(!a.is_connected());

    a.set_ghost(false).unwrap();
    assert!(eventually(|| a.is_connected() && b.roster().contains("alice")).await);
}

#[tokio::test]
async fn start_in_ghost_never_publishes() {
    let hub = LocalHub::new();
    let mut cfg = config("alice");
    cfg.ghost = true;
    let a = PresenceSession::start(hub.clone(), cfg);
    a.update_presence(at(40.0, -73.0)).unwrap();
    assert!(eventually(|| a.is_connected()).await);
    sleep(Duration::from_millis(50)).await;
    assert!(hub.roster(TOPIC).is_empty());
    assert!(a.snapshot().ghost);
}

#[tokio::test]
async fn republish_moves_only_the_timestamp() {
    let hub = LocalHub::new();
    let a = PresenceSession::start(hub.clone(), config("alice"));
    assert!(eventually(|| a.is_connected()).await);

    a.update_presence(at(40.0, -73.0)).unwrap();
    assert!(eventually(|| hub.roster(TOPIC).len() == 1).await);
    let first = hub.roster(TOPIC).remove(0);

    a.update_presence(at(40.0, -73.0)).unwrap();
    assert!(eventually(|| hub.roster(TOPIC)[0].published_at > first.published_at).await);
    let second = hub.roster(TOPIC).remove(0);

    assert_eq!(second.display_position, first.display_position);
    assert_eq!(second.snapped_venue_id, first.snapped_venue_id);
    assert_eq!(second.status, first.status);
}

#[tokio::test]
async fn status_without_position_is_not_published() {
    let hub = LocalHub::new();
    let a = PresenceSession::start(hub.clone(), config("alice"));
    assert!(eventually(|| a.is_connected()).await);

    a.update_presence(PresenceUpdate::status("mood", "coffee")).unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(hub.roster(TOPIC).is_empty());

    a.update_presence(at(40.0, -73.0)).unwrap();
    assert!(
        eventually(|| hub
            .roster(TOPIC)
            .first()
            .is_some_and(|r| r.status.get("mood").map(String::as_str) == Some("coffee")))
        .await
    );
}

#[tokio::test]
async fn hiding_position_withdraws_record() {
    let hub = LocalHub::new();
    let a = PresenceSession::start(hub.clone(), config("alice"));
    a.update_presence(at(40.0, -73.0)).unwrap();
    assert!(eventually(|| hub.roster(TOPIC).len() == 1).await);

    a.update_presence(PresenceUpdate::placement(Placement::hidden())).unwrap();
    assert!(eventually(|| hub.roster(TOPIC).is_empty()).await);
    assert!(a.is_connected());
}

#[tokio::test]
async fn leave_withdraws_and_unsubscribes() {
    let hub = LocalHub::new();
    let a = PresenceSession::start(hub.clone(), config("alice"));
    let b = PresenceSession::start(hub.clone(), config("bob"));
    a.update_presence(at(40.0, -73.0)).unwrap();
    assert!(eventually(|| b.roster().contains("alice")).await);

    let handle = a.handle();
    a.leave().await;
    assert!(eventually(|| !b.roster().contains("alice") && hub.member_count(TOPIC) == 1).await);
    assert!(handle.update_presence(at(1.0, 1.0)).is_err());
}

#[tokio::test]
async fn snapshots_notify_watchers() {
    let hub = LocalHub::new();
    let a = PresenceSession::start(hub.clone(), config("alice"));
    let mut rx = a.subscribe();
    let start = rx.borrow_and_update().revision;

    a.update_presence(at(40.0, -73.0)).unwrap();
    tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| s.own.has_position()))
        .await
        .expect("timed out")
        .expect("session gone");
    assert!(rx.borrow().revision > start);
}

/// A hub that accepts the subscribe and then never answers.
struct StalledTransport;

impl Transport for StalledTransport {
    fn subscribe<'a>(
        &'a self,
        _topic: &'a str,
        _client_id: &'a str,
    ) -> BoxFuture<'a, Result<Channel, TransportError>> {
        futures_util::future::pending().boxed()
    }
}

#[tokio::test]
async fn stalled_subscribe_does_not_block_commands() {
    let a = PresenceSession::start(StalledTransport, config("alice"));
    assert!(eventually(|| a.snapshot().state == ConnectionState::Connecting).await);

    a.update_presence(at(40.0, -73.0)).unwrap();
    a.set_ghost(true).unwrap();
    assert!(eventually(|| a.snapshot().ghost && a.snapshot().own.has_position()).await);
    a.set_ghost(false).unwrap();
    assert!(eventually(|| !a.snapshot().ghost).await);
    assert_eq!(a.snapshot().state, ConnectionState::Connecting);

    tokio::time::timeout(Duration::from_secs(3), a.leave())
        .await
        .expect("leave blocked behind a pending subscribe");
}
