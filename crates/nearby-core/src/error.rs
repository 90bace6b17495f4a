use thiserror::Error;

use crate::constants::MAX_PRIVACY_RADIUS_M;

/// Errors from the pure geometry layer. Raised before any computation runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    #[error("invalid coordinate: latitude {latitude}, longitude {longitude}")]
    InvalidCoordinate { latitude: f64, longitude: f64 },

    #[error("privacy radius {0}m outside 0..={MAX_PRIVACY_RADIUS_M}")]
    InvalidRadius(i64),
}

/// Errors decoding presence messages off the wire.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed presence message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u32),
}
