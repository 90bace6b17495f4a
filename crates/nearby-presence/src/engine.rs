//! The location pipeline: sensor → snap/fuzz → presence session.
//!
//! Raw fixes never leave this module. Every publish carries either a venue
//! coordinate or a position displaced by the session's privacy offset.

use std::sync::{Arc, Mutex, PoisonError};

use nearby_core::{
    DirectorySnapshot, EngineConfig, Fuzzer, Placement, PresenceUpdate, PrivacySettings,
    ProximityQuery, ProximityView, Venue, ViewCache, now_unix_millis,
};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, LocationError};
use crate::sensor::{Fix, LocationSource, PositionWatch, Throttle};
use crate::session::{PresenceSession, SessionConfig, SessionHandle};
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineStatus {
    pub has_position: bool,
    pub is_connected: bool,
    pub ghost: bool,
}

/// A proximity view plus whether the directory behind it is out of date.
#[derive(Clone, Debug)]
pub struct NearbyView {
    pub view: Arc<ProximityView>,
    pub stale: bool,
}

pub struct EngineOptions {
    pub user_id: String,
    pub settings: PrivacySettings,
    pub venues: Vec<Venue>,
    pub config: EngineConfig,
    /// Fixed seed for the session offset; `None` draws from the OS.
    pub seed: Option<u64>,
}

impl EngineOptions {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            settings: PrivacySettings::default(),
            venues: Vec::new(),
            config: EngineConfig::default(),
            seed: None,
        }
    }

    pub fn with_settings(mut self, settings: PrivacySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_venues(mut self, venues: Vec<Venue>) -> Self {
        self.venues = venues;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

pub struct LocationEngine {
    session: Option<PresenceSession>,
    handle: SessionHandle,
    settings: watch::Sender<PrivacySettings>,
    venues: watch::Sender<Arc<Vec<Venue>>>,
    has_position: watch::Receiver<bool>,
    cancel: CancellationToken,
    pipeline: Option<JoinHandle<()>>,
    view_cache: Mutex<ViewCache>,
    config: EngineConfig,
    user_id: String,
}

impl LocationEngine {
    /// Join the presence topic and start reading the sensor.
    pub fn start<T: Transport, L: LocationSource>(
        transport: T,
        location: L,
        options: EngineOptions,
    ) -> Self {
        let EngineOptions {
            user_id,
            settings,
            venues,
            config,
            seed,
        } = options;

        let session = PresenceSession::start(
            transport,
            SessionConfig::from_engine(user_id.clone(), &config, settings.ghost_mode),
        );
        let handle = session.handle();

        let (settings_tx, settings_rx) = watch::channel(settings);
        let (venues_tx, venues_rx) = watch::channel(Arc::new(venues));
        let (position_tx, has_position) = watch::channel(false);
        let cancel = CancellationToken::new();

        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        let pipeline = Pipeline {
            location,
            session: handle.clone(),
            settings: settings_rx,
            venues: venues_rx,
            has_position: position_tx,
            fuzzer: Fuzzer::new(),
            rng,
            throttle: Throttle::new(config.publish_interval()),
            last_fix: None,
            pending: false,
            snap_threshold_m: config.snap_threshold_m,
            cancel: cancel.clone(),
        };
        let pipeline = tokio::spawn(pipeline.run());

        Self {
            session: Some(session),
            handle,
            settings: settings_tx,
            venues: venues_tx,
            has_position,
            cancel,
            pipeline: Some(pipeline),
            view_cache: Mutex::new(ViewCache::new()),
            config,
            user_id,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn settings(&self) -> PrivacySettings {
        *self.settings.borrow()
    }

    /// Apply new privacy settings. A radius change re-places right away;
    /// a ghost toggle goes straight to the session.
    pub fn update_settings(&self, settings: PrivacySettings) {
        self.settings.send_replace(settings);
    }

    pub fn set_ghost(&self, ghost: bool) {
        self.settings.send_modify(|s| s.ghost_mode = ghost);
    }

    /// Replace the snap candidates and re-place against them.
    pub fn update_venues(&self, venues: Vec<Venue>) {
        self.venues.send_replace(Arc::new(venues));
    }

    /// Set one status facet and publish.
    pub fn set_status(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.handle.update_presence(PresenceUpdate::status(key, value))
    }

    pub fn clear_status(&self, key: impl Into<String>) -> Result<(), EngineError> {
        self.handle
            .update_presence(PresenceUpdate::default().clearing(key))
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            has_position: *self.has_position.borrow(),
            is_connected: self.handle.is_connected(),
            ghost: self.settings.borrow().ghost_mode,
        }
    }

    /// Merge the live roster with a directory snapshot. Unchanged inputs
    /// return the same `Arc`.
    pub fn view(
        &self,
        directory: &DirectorySnapshot,
        query: &ProximityQuery,
    ) -> Result<NearbyView, EngineError> {
        let roster = self.handle.roster();
        let view = self
            .view_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .view(&roster, &directory.users, &directory.venues, query)?;
        let now = now_unix_millis();
        let stale = directory.is_stale(now, self.config.stale_after());
        if stale {
            tracing::debug!(age_ms = directory.age_ms(now), "directory snapshot is stale");
        }
        Ok(NearbyView { view, stale })
    }

    /// Stop the sensor, withdraw from the topic and wait for both tasks.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.await;
        }
        if let Some(session) = self.session.take() {
            session.leave().await;
        }
    }
}

impl Drop for LocationEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.abort();
        }
    }
}

struct Pipeline<L> {
    location: L,
    session: SessionHandle,
    settings: watch::Receiver<PrivacySettings>,
    venues: watch::Receiver<Arc<Vec<Venue>>>,
    has_position: watch::Sender<bool>,
    fuzzer: Fuzzer,
    rng: SmallRng,
    throttle: Throttle,
    last_fix: Option<Fix>,
    /// A fix arrived inside the throttle window and still needs to go out.
    pending: bool,
    snap_threshold_m: f64,
    cancel: CancellationToken,
}

impl<L: LocationSource> Pipeline<L> {
    async fn run(mut self) {
        let mut ghost = self.settings.borrow_and_update().ghost_mode;
        self.venues.borrow_and_update();

        let seeded = tokio::select! {
            _ = self.cancel.cancelled() => return,
            fix = self.location.current_position() => fix,
        };
        match seeded {
            Ok(fix) => self.on_fix(fix, true),
            Err(e) => self.on_error(e),
        }

        let mut watch = match self.location.watch_position() {
            Ok(watch) => Some(watch),
            Err(e) => {
                self.on_error(e);
                None
            }
        };

        loop {
            let deadline = if self.pending { self.throttle.next_allowed() } else { None };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                reading = next_fix(&mut watch) => match reading {
                    Some(Ok(fix)) => self.on_fix(fix, false),
                    Some(Err(e)) => self.on_error(e),
                    None => {
                        tracing::debug!("position watch ended");
                        watch = None;
                    }
                },
                changed = self.settings.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let settings = *self.settings.borrow_and_update();
                    if settings.ghost_mode != ghost {
                        ghost = settings.ghost_mode;
                        let _ = self.session.set_ghost(ghost);
                    }
                    self.publish_now();
                }
                changed = self.venues.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.venues.borrow_and_update();
                    self.publish_now();
                }
                _ = sleep_until(deadline) => self.publish_now(),
            }
        }
        // drop the watch before returning so the sensor stops first
        drop(watch);
        tracing::debug!("location pipeline stopped");
    }

    fn on_fix(&mut self, fix: Fix, immediate: bool) {
        self.last_fix = Some(fix);
        self.has_position.send_replace(true);
        if immediate || self.throttle.is_ready(Instant::now()) {
            self.publish_now();
        } else {
            self.pending = true;
        }
    }

    /// Hide our position until a fix comes back.
    fn on_error(&mut self, error: LocationError) {
        tracing::warn!("location unavailable: {error}");
        self.last_fix = None;
        self.pending = false;
        self.has_position.send_replace(false);
        let _ = self
            .session
            .update_presence(PresenceUpdate::placement(Placement::hidden()));
    }

    fn publish_now(&mut self) {
        self.pending = false;
        let Some(fix) = self.last_fix else {
            return;
        };
        let radius = self.settings.borrow().radius_m;
        let offset = self.fuzzer.offset(&mut self.rng);
        let venues = Arc::clone(&self.venues.borrow());
        let placement = match Placement::resolve(
            fix.coordinate,
            i32::from(radius.meters()),
            offset,
            &venues,
            self.snap_threshold_m,
        ) {
            Ok(placement) => placement,
            Err(e) => {
                tracing::warn!("dropping unusable fix: {e}");
                return;
            }
        };
        tracing::debug!(snapped = ?placement.snapped_venue_id, "publishing placement");
        if self
            .session
            .update_presence(PresenceUpdate::placement(placement))
            .is_err()
        {
            self.cancel.cancel();
            return;
        }
        self.throttle.mark(Instant::now());
    }
}

async fn next_fix(watch: &mut Option<PositionWatch>) -> Option<Result<Fix, LocationError>> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
