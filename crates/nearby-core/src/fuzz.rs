use std::f64::consts::TAU;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_PRIVACY_RADIUS_M, MAX_PRIVACY_RADIUS_M};
use crate::coordinate::Coordinate;
use crate::error::GeoError;
use crate::geo::offset_by_meters;

/// Configured fuzzing radius in whole meters, 0..=200.
/// Zero reveals the exact position (snapping still applies).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct PrivacyRadius(u16);

impl PrivacyRadius {
    pub const ZERO: Self = Self(0);

    pub fn new(meters: i64) -> Result<Self, GeoError> {
        if (0..=MAX_PRIVACY_RADIUS_M as i64).contains(&meters) {
            Ok(Self(meters as u16))
        } else {
            Err(GeoError::InvalidRadius(meters))
        }
    }

    pub fn meters(self) -> u16 {
        self.0
    }
}

impl Default for PrivacyRadius {
    fn default() -> Self {
        Self(DEFAULT_PRIVACY_RADIUS_M)
    }
}

impl TryFrom<i64> for PrivacyRadius {
    type Error = GeoError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PrivacyRadius> for i64 {
    fn from(r: PrivacyRadius) -> Self {
        r.0 as i64
    }
}

/// Direction and relative length of the privacy displacement.
///
/// Drawn once per session and then held fixed, so the fuzzed position moves
/// with the true position instead of jumping around it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionOffset {
    /// Bearing in radians, clockwise from north, in [0, 2π).
    pub angle: f64,
    /// Fraction of the privacy radius, in [0, 1).
    pub magnitude_fraction: f64,
}

impl SessionOffset {
    /// Normalize the angle into [0, 2π) and the fraction into [0, 1).
    pub fn new(angle: f64, magnitude_fraction: f64) -> Self {
        let angle = if angle.is_finite() { angle.rem_euclid(TAU) } else { 0.0 };
        // rem_euclid may round up to exactly TAU for tiny negative inputs
        let angle = if angle >= TAU { 0.0 } else { angle };
        let magnitude_fraction = if magnitude_fraction.is_finite() {
            magnitude_fraction.clamp(0.0, 1.0 - f64::EPSILON)
        } else {
            0.0
        };
        Self {
            angle,
            magnitude_fraction,
        }
    }

    /// Uniform angle and uniform fraction.
    pub fn random(rng: &mut impl Rng) -> Self {
        let angle = TAU * rng.random::<f64>();
        let fraction = rng.random::<f64>();
        Self::new(angle, fraction)
    }

    /// Displacement in meters as (north, east) for the given radius.
    pub fn displacement_m(&self, radius_m: f64) -> (f64, f64) {
        let magnitude = self.magnitude_fraction * radius_m;
        (magnitude * self.angle.cos(), magnitude * self.angle.sin())
    }
}

/// Displace `true_position` by the session offset scaled to `radius_m`.
///
/// A radius of zero or less returns the input unchanged.
pub fn fuzz(
    true_position: Coordinate,
    radius_m: i32,
    offset: SessionOffset,
) -> Result<Coordinate, GeoError> {
    true_position.validate()?;
    if radius_m <= 0 {
        return Ok(true_position);
    }
    let (north, east) = offset.displacement_m(radius_m as f64);
    offset_by_meters(true_position, north, east)
}

/// Holds the session offset, drawing it lazily on first use.
#[derive(Clone, Debug, Default)]
pub struct Fuzzer {
    offset: Option<SessionOffset>,
}

impl Fuzzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fuzzer pinned to a known offset.
    pub fn with_offset(offset: SessionOffset) -> Self {
        Self {
            offset: Some(offset),
        }
    }

    /// The session offset, drawn from `rng` only the first time.
    pub fn offset(&mut self, rng: &mut impl Rng) -> SessionOffset {
        *self.offset.get_or_insert_with(|| SessionOffset::random(rng))
    }

    pub fn current_offset(&self) -> Option<SessionOffset> {
        self.offset
    }

    pub fn fuzz(
        &mut self,
        true_position: Coordinate,
        radius: PrivacyRadius,
        rng: &mut impl Rng,
    ) -> Result<Coordinate, GeoError> {
        let offset = self.offset(rng);
        fuzz(true_position, radius.meters() as i32, offset)
    }

    /// Forget the offset; the next call starts a new session.
    pub fn reset(&mut self) {
        self.offset = None;
    }
}
