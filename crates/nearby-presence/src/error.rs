use nearby_core::GeoError;
use thiserror::Error;

/// Channel-level failures. Recoverable: the session retries with backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("channel disconnected: {0}")]
    Disconnected(String),

    #[error("failed to subscribe: {0}")]
    Connect(String),
}

/// Device location failures. Recoverable: the engine stops publishing and
/// reports `has_position = false` until a fix arrives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("timed out waiting for a location fix")]
    Timeout,

    #[error("location unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Geo(#[from] GeoError),

    #[error("engine has been stopped")]
    Stopped,
}
