//! Great-circle math on a spherical Earth.
//!
//! Every public function validates its inputs and fails with
//! [`GeoError::InvalidCoordinate`] before computing anything.

use std::f64::consts::TAU;

use crate::constants::{EARTH_RADIUS_M, METERS_PER_DEGREE, MIN_LONGITUDE_SCALE};
use crate::coordinate::Coordinate;
use crate::error::GeoError;

/// Haversine distance in meters.
///
/// Symmetric bit-for-bit: the pair is put in a canonical order before the
/// formula runs, so `distance(a, b) == distance(b, a)` holds exactly. Zero
/// exactly when both name the same point; inputs are compared in
/// [`Coordinate::normalized`] form, so `(90, 0)` and `(90, 50)` are 0 apart.
pub fn distance(a: Coordinate, b: Coordinate) -> Result<f64, GeoError> {
    a.validate()?;
    b.validate()?;
    Ok(haversine_m(a.normalized(), b.normalized()))
}

/// `distance(point, center) <= radius_m`.
pub fn within_radius(
    point: Coordinate,
    center: Coordinate,
    radius_m: f64,
) -> Result<bool, GeoError> {
    Ok(distance(point, center)? <= radius_m)
}

/// Initial great-circle bearing from `from` toward `to`, in radians
/// clockwise from true north, normalized to [0, 2π).
pub fn initial_bearing(from: Coordinate, to: Coordinate) -> Result<f64, GeoError> {
    from.validate()?;
    to.validate()?;
    let phi1 = from.latitude.to_radians();
    let phi2 = to.latitude.to_radians();
    let d_lambda = (to.longitude - from.longitude).to_radians();

    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();
    Ok(y.atan2(x).rem_euclid(TAU))
}

/// Displace `origin` by a local tangent-plane vector.
///
/// Meters convert to degrees with the latitude-adjusted scale; east-west
/// scale is floored at [`MIN_LONGITUDE_SCALE`] so the division stays finite
/// at the poles. Latitude is clamped to [-90, 90] and longitude wrapped
/// back into [-180, 180].
pub fn offset_by_meters(
    origin: Coordinate,
    north_m: f64,
    east_m: f64,
) -> Result<Coordinate, GeoError> {
    origin.validate()?;
    let lon_scale = origin.latitude.to_radians().cos().abs().max(MIN_LONGITUDE_SCALE);

    let latitude = (origin.latitude + north_m / METERS_PER_DEGREE).clamp(-90.0, 90.0);
    let longitude = wrap_longitude(origin.longitude + east_m / (METERS_PER_DEGREE * lon_scale));

    Ok(Coordinate {
        latitude,
        longitude,
    })
}

fn haversine_m(a: Coordinate, b: Coordinate) -> f64 {
    if a == b {
        return 0.0;
    }
    let (p, q) = canonical_pair(a, b);

    let phi1 = p.latitude.to_radians();
    let phi2 = q.latitude.to_radians();
    let d_phi = (q.latitude - p.latitude).to_radians();
    let d_lambda = (q.longitude - p.longitude).to_radians();

    let h = ((d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2))
        .clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

fn canonical_pair(a: Coordinate, b: Coordinate) -> (Coordinate, Coordinate) {
    let a_first = match a.latitude.total_cmp(&b.latitude) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => a.longitude.total_cmp(&b.longitude).is_le(),
    };
    if a_first { (a, b) } else { (b, a) }
}

fn wrap_longitude(lon: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon) {
        return lon;
    }
    let wrapped = (lon + 180.0).rem_euclid(360.0) - 180.0;
    // rem_euclid can land exactly on -180 for +180 inputs; both are the same meridian
    wrapped.clamp(-180.0, 180.0)
}
