//! Location pipeline end to end: scripted sensor → engine → local hub.

use std::sync::Arc;
use std::time::Duration;

use nearby_core::{
    Coordinate, DirectorySnapshot, EngineConfig, PresenceRecord, PrivacyRadius, PrivacySettings,
    ProximityQuery, SessionOffset, Source, UserRecord, Venue, distance, fuzz, now_unix_millis,
    offset_by_meters,
};
use nearby_presence::{
    EngineOptions, LocalHub, LocationEngine, LocationError, PresenceSession, ScriptedLocation,
    SessionConfig,
};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tokio::time::{Instant, sleep};

const SEED: u64 = 7;

fn truth() -> Coordinate {
    Coordinate::new(40.0, -73.0).unwrap()
}

fn settings(radius: i64) -> PrivacySettings {
    PrivacySettings {
        radius_m: PrivacyRadius::new(radius).unwrap(),
        ghost_mode: false,
    }
}

fn options(radius: i64, interval_secs: u64) -> EngineOptions {
    EngineOptions::new("alice")
        .with_settings(settings(radius))
        .with_config(EngineConfig {
            publish_interval_secs: interval_secs,
            ..EngineConfig::default()
        })
        .with_seed(SEED)
}

fn session_offset() -> SessionOffset {
    SessionOffset::random(&mut SmallRng::seed_from_u64(SEED))
}

fn published(hub: &LocalHub, user: &str) -> Option<PresenceRecord> {
    hub.roster("map-presence").into_iter().find(|r| r.user_id == user)
}

fn published_at(hub: &LocalHub, user: &str) -> Option<Coordinate> {
    published(hub, user).and_then(|r| r.display_position)
}

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
async fn publishes_fuzzed_position_never_raw() {
    let hub = LocalHub::new();
    let loc = ScriptedLocation::fixed(truth());
    let engine = LocationEngine::start(hub.clone(), loc, options(100, 30));

    assert!(eventually(|| published(&hub, "alice").is_some()).await);
    let shown = published_at(&hub, "alice").unwrap();
    assert_eq!(shown, fuzz(truth(), 100, session_offset()).unwrap());
    assert_ne!(shown, truth());
    assert!(distance(shown, truth()).unwrap() <= 100.0 + 1e-3);
    assert!(engine.status().has_position);
    assert!(engine.status().is_connected);
}

#[tokio::test]
async fn snapped_publish_shows_venue_coordinate() {
    let hub = LocalHub::new();
    let venue_spot = offset_by_meters(truth(), 10.0, 0.0).unwrap();
    let venue = Venue::new("cafe", venue_spot, true, true);
    let loc = ScriptedLocation::fixed(truth());
    let opts = options(200, 30).with_venues(vec![venue]);
    let _engine = LocationEngine::start(hub.clone(), loc, opts);

    assert!(eventually(|| published(&hub, "alice").is_some()).await);
    let record = published(&hub, "alice").unwrap();
    assert_eq!(record.display_position, Some(venue_spot));
    assert_eq!(record.snapped_venue_id.as_deref(), Some("cafe"));
}

#[tokio::test(start_paused = true)]
async fn offset_is_stable_across_moves() {
    let hub = LocalHub::new();
    let loc = ScriptedLocation::fixed(truth());
    let _engine = LocationEngine::start(hub.clone(), loc.clone(), options(100, 1));
    assert!(eventually(|| published(&hub, "alice").is_some()).await);

    sleep(Duration::from_secs(2)).await;
    let moved = offset_by_meters(truth(), 300.0, 0.0).unwrap();
    loc.push(moved);

    let expected = fuzz(moved, 100, session_offset()).unwrap();
    assert!(eventually(|| published_at(&hub, "alice") == Some(expected)).await);
}

#[tokio::test(start_paused = true)]
async fn fixes_inside_interval_are_held_then_sent() {
    let hub = LocalHub::new();
    let loc = ScriptedLocation::fixed(truth());
    let _engine = LocationEngine::start(hub.clone(), loc.clone(), options(0, 30));
    assert!(eventually(|| published_at(&hub, "alice") == Some(truth())).await);

    let first = offset_by_meters(truth(), 50.0, 0.0).unwrap();
    let second = offset_by_meters(truth(), 80.0, 0.0).unwrap();
    loc.push(first);
    loc.push(second);
    sleep(Duration::from_secs(5)).await;
    assert_eq!(published_at(&hub, "alice"), Some(truth()));

    // trailing publish carries the latest fix
    sleep(Duration::from_secs(30)).await;
    assert!(eventually(|| published_at(&hub, "alice") == Some(second)).await);
}

#[tokio::test(start_paused = true)]
async fn radius_change_replaces_immediately() {
    let hub = LocalHub::new();
    let loc = ScriptedLocation::fixed(truth());
    let engine = LocationEngine::start(hub.clone(), loc, options(100, 30));
    assert!(eventually(|| published(&hub, "alice").is_some()).await);
    assert_ne!(published_at(&hub, "alice"), Some(truth()));

    engine.update_settings(settings(0));
    assert!(eventually(|| published_at(&hub, "alice") == Some(truth())).await);
}

#[tokio::test(start_paused = true)]
async fn venue_update_replaces_immediately() {
    let hub = LocalHub::new();
    let loc = ScriptedLocation::fixed(truth());
    let engine = LocationEngine::start(hub.clone(), loc, options(100, 30));
    assert!(eventually(|| published(&hub, "alice").is_some()).await);

    let spot = offset_by_meters(truth(), -10.0, 0.0).unwrap();
    engine.update_venues(vec![Venue::new("park", spot, true, true)]);
    let snapped = || published(&hub, "alice").and_then(|r| r.snapped_venue_id);
    assert!(eventually(|| snapped().as_deref() == Some("park")).await);
    assert_eq!(published_at(&hub, "alice"), Some(spot));
}

#[tokio::test]
async fn permission_denied_publishes_nothing() {
    let hub = LocalHub::new();
    let engine = LocationEngine::start(hub.clone(), ScriptedLocation::denied(), options(100, 30));

    assert!(eventually(|| engine.status().is_connected).await);
    sleep(Duration::from_millis(50)).await;
    assert!(!engine.status().has_position);
    assert!(hub.roster("map-presence").is_empty());
}

#[tokio::test]
async fn sensor_failure_withdraws_until_next_fix() {
    let hub = LocalHub::new();
    let loc = ScriptedLocation::fixed(truth());
    let engine = LocationEngine::start(hub.clone(), loc.clone(), options(0, 0));
    assert!(eventually(|| published(&hub, "alice").is_some()).await);
    assert!(eventually(|| loc.watchers_active() == 1).await);

    loc.fail(LocationError::Timeout);
    assert!(eventually(|| !engine.status().has_position).await);
    assert!(eventually(|| published(&hub, "alice").is_none()).await);

    loc.push(truth());
    assert!(eventually(|| published_at(&hub, "alice") == Some(truth())).await);
    assert!(engine.status().has_position);
}

#[tokio::test]
async fn ghost_setting_hides_from_others() {
    let hub = LocalHub::new();
    let loc = ScriptedLocation::fixed(truth());
    let engine = LocationEngine::start(hub.clone(), loc, options(100, 30));
    assert!(eventually(|| published(&hub, "alice").is_some()).await);

    engine.set_ghost(true);
    assert!(eventually(|| published(&hub, "alice").is_none()).await);
    assert!(engine.status().ghost);
    assert!(engine.status().is_connected);

    engine.set_ghost(false);
    assert!(eventually(|| published(&hub, "alice").is_some()).await);
}

#[tokio::test]
async fn stop_withdraws_and_releases_sensor() {
    let hub = LocalHub::new();
    let loc = ScriptedLocation::fixed(truth());
    let engine = LocationEngine::start(hub.clone(), loc.clone(), options(100, 30));
    assert!(eventually(|| published(&hub, "alice").is_some() && loc.watchers_active() == 1).await);

    engine.stop().await;
    assert_eq!(loc.watchers_active(), 0);
    assert!(eventually(|| hub.member_count("map-presence") == 0).await);
    assert!(hub.roster("map-presence").is_empty());
}

#[tokio::test]
async fn view_merges_live_and_cached() {
    let hub = LocalHub::new();
    let loc = ScriptedLocation::fixed(truth());
    let engine = LocationEngine::start(hub.clone(), loc, options(0, 30));

    let bob = PresenceSession::start(hub.clone(), SessionConfig::new("bob"));
    bob.update_presence(nearby_core::PresenceUpdate::placement(nearby_core::Placement {
        display_position: offset_by_meters(truth(), 100.0, 0.0).ok(),
        snapped_venue_id: None,
    }))
    .unwrap();
    assert!(
        eventually(|| {
            let roster = engine.session().roster();
            roster.contains("bob") && roster.contains("alice")
        })
        .await
    );

    let mut dave = UserRecord::new("dave", offset_by_meters(truth(), 0.0, 200.0).ok());
    dave.updated_at = 1;
    let mut ghost = UserRecord::new("eve", offset_by_meters(truth(), 0.0, 50.0).ok());
    ghost.ghost_mode = true;
    let directory = DirectorySnapshot {
        venues: vec![],
        users: vec![dave, ghost],
        refreshed_at: now_unix_millis(),
    };
    let query = ProximityQuery::new(truth(), 500.0).excluding("alice");

    let first = engine.view(&directory, &query).unwrap();
    assert!(!first.stale);
    let ids: Vec<_> = first.view.visible.iter().map(|u| (u.user_id.as_str(), u.source)).collect();
    assert_eq!(ids, vec![("bob", Source::Live), ("dave", Source::Cached)]);

    let again = engine.view(&directory, &query).unwrap();
    assert!(Arc::ptr_eq(&first.view, &again.view));

    let old = DirectorySnapshot {
        refreshed_at: 0,
        ..directory
    };
    assert!(engine.view(&old, &query).unwrap().stale);
}
