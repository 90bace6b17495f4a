/// Mean Earth radius in meters (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Length of one degree of latitude along a great circle, in meters.
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// Distance at or under which a device snaps to a verified venue.
pub const SNAP_THRESHOLD_M: f64 = 25.0;

/// Privacy radius applied when the user has not configured one.
pub const DEFAULT_PRIVACY_RADIUS_M: u16 = 100;

/// Largest privacy radius a user may configure.
pub const MAX_PRIVACY_RADIUS_M: u16 = 200;

/// Floor for cos(latitude) when converting east-west meters to degrees.
/// cos(89.43°) ≈ 0.01; past that the longitude scale stops shrinking.
pub const MIN_LONGITUDE_SCALE: f64 = 0.01;

/// Minimum spacing between sensor-driven republishes.
pub const DEFAULT_PUBLISH_INTERVAL_SECS: u64 = 30;

/// Directory data older than this is flagged as approximate.
pub const DEFAULT_STALE_AFTER_SECS: u64 = 300;

/// Presence topic shared by map clients.
pub const DEFAULT_TOPIC: &str = "map-presence";

/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-12;
