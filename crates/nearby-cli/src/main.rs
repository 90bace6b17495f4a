mod server;
mod simulate;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use nearby_core::{
    Config, Coordinate, Fuzzer, PrivacyRadius, ProximityQuery, Roster, StatusFilter, compute_view,
    distance, millis_to_iso8601, nearest_eligible, now_unix_millis,
};
use nearby_presence::{
    EngineOptions, LocationEngine, ScriptedLocation, SessionSnapshot, SseTransport,
};
use nearby_store::{SettingsStore, Store, resolve_base_dir};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "nearby", about = "Privacy-preserving presence and proximity engine")]
struct Cli {
    /// Data directory (default: $NEARBY_DATA_DIR or ~/.nearby)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Copy)]
struct PositionArgs {
    /// Latitude in degrees
    #[arg(long, allow_negative_numbers = true)]
    lat: f64,

    /// Longitude in degrees
    #[arg(long, allow_negative_numbers = true)]
    lon: f64,
}

impl PositionArgs {
    fn coordinate(self) -> Result<Coordinate> {
        Coordinate::new(self.lat, self.lon).context("invalid position")
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the presence hub (HTTP + server-sent events)
    Serve {
        #[arg(long, default_value = "127.0.0.1:7070")]
        bind: SocketAddr,
    },

    /// Join a hub as a client at a fixed position and print roster changes
    Join {
        /// Hub base URL
        #[arg(long, default_value = "http://127.0.0.1:7070")]
        hub: String,

        /// User id to publish as
        #[arg(long)]
        user: String,

        #[command(flatten)]
        position: PositionArgs,

        /// Status facet to share, as key=value (repeatable)
        #[arg(long = "status", value_parser = parse_status)]
        status: Vec<(String, String)>,

        /// Leave after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        duration: Option<u64>,

        /// Seed for the session offset
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Show where a position would be displayed after fuzzing
    Fuzz {
        #[command(flatten)]
        position: PositionArgs,

        /// Privacy radius in meters (default: from settings)
        #[arg(long)]
        radius: Option<i64>,

        /// Seed for the session offset
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Resolve a position against the stored venues
    Snap {
        #[command(flatten)]
        position: PositionArgs,

        /// Snap threshold in meters (default: from settings)
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// List stored users and venue occupancy around a position
    Nearby {
        #[command(flatten)]
        position: PositionArgs,

        /// Query radius in meters
        #[arg(long, default_value_t = 500.0)]
        radius: f64,

        /// Only users whose status has key=value
        #[arg(long, value_parser = parse_status)]
        status: Option<(String, String)>,

        /// Fail instead of warning when the directory is stale
        #[arg(long)]
        strict: bool,

        /// Print the view as JSON
        #[arg(long)]
        json: bool,
    },

    /// Import venues and users from a JSON file
    Import {
        /// Input file path
        path: PathBuf,
    },

    /// Export venues and users to a JSON file
    Export {
        /// Output file path
        path: PathBuf,
    },

    /// Show or change privacy and engine settings
    Settings {
        /// Privacy radius in meters (0-200)
        #[arg(long)]
        radius: Option<i64>,

        /// Ghost mode
        #[arg(long, value_enum)]
        ghost: Option<Toggle>,

        /// Presence topic
        #[arg(long)]
        topic: Option<String>,

        /// Snap threshold in meters
        #[arg(long)]
        snap_threshold: Option<f64>,
    },

    /// Run several simulated clients against an in-process hub
    Simulate {
        #[arg(long, default_value_t = 3)]
        users: usize,

        #[arg(long, default_value_t = 5)]
        steps: usize,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn parse_status(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

fn open_settings(cli: &Cli) -> Result<SettingsStore> {
    let base_dir = resolve_base_dir(cli.data_dir.as_deref());
    SettingsStore::open(&base_dir).context("failed to open data directory")
}

fn open_directory(settings: &SettingsStore) -> Result<Store> {
    Store::open(&settings.directory_path()).context("failed to open directory store")
}

fn load_config(settings: &SettingsStore) -> Result<Config> {
    settings.load().context("failed to load settings")
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Serve { bind } => cmd_serve(*bind).await,
        Commands::Join {
            hub,
            user,
            position,
            status,
            duration,
            seed,
        } => cmd_join(&cli, hub, user, *position, status, *duration, *seed).await,
        Commands::Fuzz {
            position,
            radius,
            seed,
        } => cmd_fuzz(&cli, *position, *radius, *seed),
        Commands::Snap {
            position,
            threshold,
        } => cmd_snap(&cli, *position, *threshold),
        Commands::Nearby {
            position,
            radius,
            status,
            strict,
            json,
        } => cmd_nearby(&cli, *position, *radius, status.clone(), *strict, *json),
        Commands::Import { path } => cmd_import(&cli, path),
        Commands::Export { path } => cmd_export(&cli, path),
        Commands::Settings {
            radius,
            ghost,
            topic,
            snap_threshold,
        } => cmd_settings(&cli, *radius, *ghost, topic.clone(), *snap_threshold),
        Commands::Simulate { users, steps, seed } => simulate::run(*users, *steps, *seed).await,
    }
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("received Ctrl-C, shutting down");
                token.cancel();
            }
            Err(e) => tracing::warn!("cannot listen for Ctrl-C: {e}"),
        }
    });
}

async fn cmd_serve(bind: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let addr = listener.local_addr().context("failed to read bound address")?;
    println!("listening on http://{addr}");

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    server::serve(listener, nearby_presence::LocalHub::new(), shutdown)
        .await
        .context("presence hub failed")?;
    tracing::info!("presence hub stopped");
    Ok(())
}

async fn cmd_join(
    cli: &Cli,
    hub: &str,
    user: &str,
    position: PositionArgs,
    status: &[(String, String)],
    duration: Option<u64>,
    seed: Option<u64>,
) -> Result<()> {
    let here = position.coordinate()?;
    let settings = open_settings(cli)?;
    let config = load_config(&settings)?;
    let venues = open_directory(&settings)?
        .venues_near(here, config.engine.snap_threshold_m.max(100.0))
        .context("failed to read venues")?;

    let mut options = EngineOptions::new(user)
        .with_settings(config.privacy)
        .with_venues(venues)
        .with_config(config.engine.clone());
    if let Some(seed) = seed {
        options = options.with_seed(seed);
    }
    let location = ScriptedLocation::fixed(here);
    let engine = LocationEngine::start(SseTransport::new(hub), location, options);
    for (key, value) in status {
        engine.set_status(key.as_str(), value.as_str())?;
    }

    let stop = CancellationToken::new();
    cancel_on_ctrl_c(stop.clone());
    let deadline = duration.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

    let mut updates = engine.session().subscribe();
    let mut last_printed: Option<(bool, Vec<String>)> = None;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = sleep_until(deadline) => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                let members = snapshot.roster.user_ids().map(str::to_string).collect();
                let key: (bool, Vec<String>) = (snapshot.is_connected(), members);
                if last_printed.as_ref() != Some(&key) {
                    print_roster(&snapshot);
                    last_printed = Some(key);
                }
            }
        }
    }

    engine.stop().await;
    println!("left {hub}");
    Ok(())
}

async fn sleep_until(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn print_roster(snapshot: &SessionSnapshot) {
    let state = if snapshot.is_connected() { "connected" } else { "disconnected" };
    println!("[{state}] {} member(s)", snapshot.roster.len());
    if !snapshot.is_connected()
        && let Some(error) = &snapshot.last_error
    {
        println!("  ({error}; showing last known roster)");
    }
    for record in snapshot.roster.iter() {
        let position = record
            .display_position
            .map_or_else(|| "hidden".to_string(), |p| p.to_string());
        match &record.snapped_venue_id {
            Some(venue) => println!("  {:<16} {position}  @ {venue}", record.user_id),
            None => println!("  {:<16} {position}", record.user_id),
        }
    }
}

fn cmd_fuzz(
    cli: &Cli,
    position: PositionArgs,
    radius: Option<i64>,
    seed: Option<u64>,
) -> Result<()> {
    let here = position.coordinate()?;
    let radius = match radius {
        Some(r) => PrivacyRadius::new(r).context("invalid privacy radius")?,
        None => load_config(&open_settings(cli)?)?.privacy.radius_m,
    };
    let mut rng = match seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_os_rng(),
    };

    let mut fuzzer = Fuzzer::new();
    let shown = fuzzer.fuzz(here, radius, &mut rng).context("failed to fuzz position")?;
    let moved = distance(here, shown).context("failed to measure offset")?;

    println!("true:    {here}");
    println!("shown:   {shown}");
    println!("offset:  {moved:.1} m (radius {} m)", radius.meters());
    Ok(())
}

fn cmd_snap(cli: &Cli, position: PositionArgs, threshold: Option<f64>) -> Result<()> {
    let here = position.coordinate()?;
    let settings = open_settings(cli)?;
    let threshold = match threshold {
        Some(t) => t,
        None => load_config(&settings)?.engine.snap_threshold_m,
    };
    let venues = open_directory(&settings)?
        .venues()
        .context("failed to read venues")?;

    match nearest_eligible(here, &venues).context("failed to resolve snap")? {
        Some((venue, d)) if d <= threshold => {
            println!("snapped: {} ({d:.1} m)", venue.id);
            println!("shown:   {}", venue.coordinate);
        }
        Some((venue, d)) => println!(
            "not snapped (nearest {} at {d:.1} m, threshold {threshold} m)",
            venue.id
        ),
        None => println!("not snapped (no eligible venues)"),
    }
    Ok(())
}

fn cmd_nearby(
    cli: &Cli,
    position: PositionArgs,
    radius: f64,
    status: Option<(String, String)>,
    strict: bool,
    json: bool,
) -> Result<()> {
    let here = position.coordinate()?;
    let settings = open_settings(cli)?;
    let config = load_config(&settings)?;
    let store = open_directory(&settings)?;
    let now = now_unix_millis();

    let snapshot = if strict {
        store
            .fresh_snapshot(here, radius, config.engine.stale_after(), now)
            .context("directory snapshot unavailable")?
    } else {
        store
            .snapshot(here, radius)
            .context("failed to read directory")?
    };
    let stale = snapshot.is_stale(now, config.engine.stale_after());

    let mut query = ProximityQuery::new(here, radius);
    if let Some((key, value)) = status {
        query = query.with_status(StatusFilter::new(key, value));
    }
    let view = compute_view(&Roster::new(), &snapshot.users, &snapshot.venues, &query)
        .context("failed to compute view")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view).context("failed to serialize view")?);
        return Ok(());
    }

    if stale {
        println!(
            "note: directory data is stale (refreshed {})",
            millis_to_iso8601(snapshot.refreshed_at)
        );
    }
    println!("visible: {}", view.visible.len());
    for user in &view.visible {
        match &user.snapped_venue_id {
            Some(venue) => println!("  {:<16} {:>8.1} m  @ {venue}", user.user_id, user.distance_m),
            None => println!("  {:<16} {:>8.1} m", user.user_id, user.distance_m),
        }
    }
    println!("venues:  {}", view.venues.len());
    for venue in &view.venues {
        println!("  {:<16} {} here", venue.venue_id, venue.total_count);
    }
    Ok(())
}

fn cmd_import(cli: &Cli, path: &Path) -> Result<()> {
    let settings = open_settings(cli)?;
    let store = open_directory(&settings)?;
    let file = store
        .import_json_file(path, now_unix_millis())
        .context("failed to import JSON")?;
    println!(
        "imported from {}. venues={}, users={}",
        path.display(),
        file.venues.len(),
        file.users.len()
    );
    Ok(())
}

fn cmd_export(cli: &Cli, path: &Path) -> Result<()> {
    let settings = open_settings(cli)?;
    let store = open_directory(&settings)?;
    store
        .export_json_file(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!(
        "exported to {}. venues={}, users={}",
        path.display(),
        store.venue_count().context("failed to count venues")?,
        store.user_count().context("failed to count users")?
    );
    Ok(())
}

fn cmd_settings(
    cli: &Cli,
    radius: Option<i64>,
    ghost: Option<Toggle>,
    topic: Option<String>,
    snap_threshold: Option<f64>,
) -> Result<()> {
    let settings = open_settings(cli)?;
    let radius = radius
        .map(PrivacyRadius::new)
        .transpose()
        .context("invalid privacy radius")?;
    if let Some(t) = snap_threshold
        && !(t.is_finite() && t >= 0.0)
    {
        anyhow::bail!("invalid snap threshold: {t}");
    }

    let changed =
        radius.is_some() || ghost.is_some() || topic.is_some() || snap_threshold.is_some();
    let config = if changed {
        settings
            .update(|config| {
                if let Some(radius) = radius {
                    config.privacy.radius_m = radius;
                }
                if let Some(ghost) = ghost {
                    config.privacy.ghost_mode = matches!(ghost, Toggle::On);
                }
                if let Some(topic) = topic {
                    config.engine.topic = topic;
                }
                if let Some(t) = snap_threshold {
                    config.engine.snap_threshold_m = t;
                }
            })
            .context("failed to save settings")?
    } else {
        load_config(&settings)?
    };

    println!("radius:          {} m", config.privacy.radius_m.meters());
    println!("ghost:           {}", if config.privacy.ghost_mode { "on" } else { "off" });
    println!("topic:           {}", config.engine.topic);
    println!("snap_threshold:  {} m", config.engine.snap_threshold_m);
    println!("publish_every:   {} s", config.engine.publish_interval_secs);
    println!("stale_after:     {} s", config.engine.stale_after_secs);
    println!("config:          {}", settings.config_path().display());
    Ok(())
}
