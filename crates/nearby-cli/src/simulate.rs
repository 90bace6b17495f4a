//! `nearby simulate`: several engines sharing one in-process hub.

use std::time::Duration;

use anyhow::Result;
use nearby_core::{
    Coordinate, DirectorySnapshot, EngineConfig, ProximityQuery, Venue, distance, now_unix_millis,
    offset_by_meters,
};
use nearby_presence::{EngineOptions, LocalHub, LocationEngine, ScriptedLocation};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time::{Instant, sleep};

const WALK_STEP_M: f64 = 20.0;
const SCATTER_M: f64 = 400.0;

struct Client {
    user_id: String,
    truth: Coordinate,
    location: ScriptedLocation,
    engine: LocationEngine,
}

pub async fn run(users: usize, steps: usize, seed: u64) -> Result<()> {
    anyhow::ensure!(users > 0, "need at least one user");

    let center = Coordinate::new(40.0, -73.0)?;
    let venues = vec![Venue::new("plaza", center, true, true).with_name("Central Plaza")];
    let hub = LocalHub::new();
    let mut rng = SmallRng::seed_from_u64(seed);

    let mut clients = Vec::with_capacity(users);
    for i in 0..users {
        let user_id = format!("user-{i}");
        // user-0 stands at the plaza so the snap path shows up
        let (north, east) = if i == 0 {
            (5.0, 0.0)
        } else {
            (
                rng.random_range(-SCATTER_M..SCATTER_M),
                rng.random_range(-SCATTER_M..SCATTER_M),
            )
        };
        let truth = offset_by_meters(center, north, east)?;
        let location = ScriptedLocation::fixed(truth);
        let options = EngineOptions::new(&user_id)
            .with_venues(venues.clone())
            .with_config(EngineConfig {
                publish_interval_secs: 0,
                ..EngineConfig::default()
            })
            .with_seed(seed.wrapping_add(i as u64 + 1));
        let engine = LocationEngine::start(hub.clone(), location.clone(), options);
        clients.push(Client {
            user_id,
            truth,
            location,
            engine,
        });
    }

    for step in 0..steps {
        for client in clients.iter_mut().skip(1) {
            client.truth = offset_by_meters(
                client.truth,
                rng.random_range(-WALK_STEP_M..WALK_STEP_M),
                rng.random_range(-WALK_STEP_M..WALK_STEP_M),
            )?;
            client.location.push(client.truth);
        }
        tracing::debug!(step, "simulation step");
        sleep(Duration::from_millis(20)).await;
    }

    let observer = clients[0].engine.session().clone();
    let converged = || {
        let roster = observer.roster();
        clients
            .iter()
            .all(|c| roster.get(&c.user_id) == Some(&c.engine.session().snapshot().own))
    };
    let deadline = Instant::now() + Duration::from_secs(3);
    while !converged() && Instant::now() < deadline {
        sleep(Duration::from_millis(20)).await;
    }
    if !converged() {
        tracing::warn!("rosters did not converge before the deadline");
    }

    let roster = observer.roster();
    println!("roster: {} member(s)", roster.len());
    for client in &clients {
        let Some(record) = roster.get(&client.user_id) else {
            println!("  {:<8} (not seen)", client.user_id);
            continue;
        };
        let Some(shown) = record.display_position else {
            println!("  {:<8} hidden", client.user_id);
            continue;
        };
        let moved = distance(client.truth, shown)?;
        match &record.snapped_venue_id {
            Some(venue) => {
                println!("  {:<8} {shown} {moved:>6.1} m from truth @ {venue}", client.user_id)
            }
            None => println!("  {:<8} {shown} {moved:>6.1} m from truth", client.user_id),
        }
    }

    let directory = DirectorySnapshot {
        venues,
        users: Vec::new(),
        refreshed_at: now_unix_millis(),
    };
    let query = ProximityQuery::new(center, 2.0 * SCATTER_M).excluding(clients[0].user_id.clone());
    let nearby = clients[0].engine.view(&directory, &query)?;
    println!("{} sees {} user(s) nearby", clients[0].user_id, nearby.view.visible.len());
    for venue in &nearby.view.venues {
        println!("  {:<8} {} here", venue.venue_id, venue.total_count);
    }

    for client in clients {
        client.engine.stop().await;
    }
    Ok(())
}
