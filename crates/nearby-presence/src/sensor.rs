//! Device location input.
//!
//! [`LocationSource`] is the seam to the platform's location API. The
//! scripted source drives tests and the CLI simulator.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use nearby_core::{Coordinate, now_unix_millis};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::LocationError;

/// One reading from the device.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fix {
    pub coordinate: Coordinate,
    pub accuracy_m: Option<f64>,
    pub timestamp_ms: u64,
}

impl Fix {
    pub fn new(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            accuracy_m: None,
            timestamp_ms: now_unix_millis(),
        }
    }
}

/// A stream of fixes. Dropping it stops the underlying watch.
pub struct PositionWatch {
    rx: mpsc::UnboundedReceiver<Result<Fix, LocationError>>,
}

impl PositionWatch {
    pub fn new(rx: mpsc::UnboundedReceiver<Result<Fix, LocationError>>) -> Self {
        Self { rx }
    }

    /// `None` once the source has shut the watch down.
    pub async fn next(&mut self) -> Option<Result<Fix, LocationError>> {
        self.rx.recv().await
    }
}

pub trait LocationSource: Send + Sync + 'static {
    /// One-shot read used to seed the pipeline.
    fn current_position(&self) -> BoxFuture<'_, Result<Fix, LocationError>>;

    /// Continuous updates until the returned watch is dropped.
    fn watch_position(&self) -> Result<PositionWatch, LocationError>;
}

impl<L: LocationSource + ?Sized> LocationSource for Arc<L> {
    fn current_position(&self) -> BoxFuture<'_, Result<Fix, LocationError>> {
        (**self).current_position()
    }

    fn watch_position(&self) -> Result<PositionWatch, LocationError> {
        (**self).watch_position()
    }
}

/// A location source fed by hand.
#[derive(Clone)]
pub struct ScriptedLocation {
    inner: Arc<Mutex<Script>>,
}

struct Script {
    current: Result<Fix, LocationError>,
    denied: bool,
    watchers: Vec<mpsc::UnboundedSender<Result<Fix, LocationError>>>,
}

impl ScriptedLocation {
    fn with(current: Result<Fix, LocationError>, denied: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Script {
                current,
                denied,
                watchers: Vec::new(),
            })),
        }
    }

    /// Starts at `coordinate`.
    pub fn fixed(coordinate: Coordinate) -> Self {
        Self::with(Ok(Fix::new(coordinate)), false)
    }

    /// No fix until the first [`push`](Self::push).
    pub fn pending() -> Self {
        Self::with(Err(LocationError::Unavailable("no fix yet".into())), false)
    }

    /// The user refused location access.
    pub fn denied() -> Self {
        Self::with(Err(LocationError::PermissionDenied), true)
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the device and notify live watchers.
    pub fn push(&self, coordinate: Coordinate) {
        self.broadcast(Ok(Fix::new(coordinate)));
    }

    /// Report a sensor failure to live watchers.
    pub fn fail(&self, error: LocationError) {
        self.broadcast(Err(error));
    }

    fn broadcast(&self, reading: Result<Fix, LocationError>) {
        let mut script = self.script();
        script.watchers.retain(|w| w.send(reading.clone()).is_ok());
        script.current = reading;
    }

    /// Number of watches still held by a consumer.
    pub fn watchers_active(&self) -> usize {
        let mut script = self.script();
        script.watchers.retain(|w| !w.is_closed());
        script.watchers.len()
    }
}

impl LocationSource for ScriptedLocation {
    fn current_position(&self) -> BoxFuture<'_, Result<Fix, LocationError>> {
        let reading = self.script().current.clone();
        async move { reading }.boxed()
    }

    fn watch_position(&self) -> Result<PositionWatch, LocationError> {
        let mut script = self.script();
        if script.denied {
            return Err(LocationError::PermissionDenied);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        script.watchers.push(tx);
        Ok(PositionWatch::new(rx))
    }
}

/// Minimum spacing between publishes.
#[derive(Clone, Debug)]
pub struct Throttle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.next_allowed().is_none_or(|at| now >= at)
    }

    /// Earliest instant the next publish may go out; `None` if never fired.
    pub fn next_allowed(&self) -> Option<Instant> {
        self.last.map(|last| last + self.min_interval)
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}
