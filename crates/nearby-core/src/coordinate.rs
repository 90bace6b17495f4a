use serde::{Deserialize, Serialize};

use crate::error::GeoError;

/// A WGS-84 position in degrees.
///
/// Fields are public so records deserialize without ceremony; every engine
/// entry point calls [`Coordinate::validate`] before doing math.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// Build a coordinate, rejecting anything off the globe. Pole and
    /// antimeridian spellings come back in [`Coordinate::normalized`] form.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, GeoError> {
        let c = Self {
            latitude,
            longitude,
        };
        c.validate()?;
        Ok(c.normalized())
    }

    /// One spelling per point: longitude is 0 at either pole, and the
    /// antimeridian is +180 rather than -180.
    pub fn normalized(self) -> Self {
        let longitude = if self.latitude.abs() == 90.0 {
            0.0
        } else if self.longitude == -180.0 {
            180.0
        } else {
            self.longitude
        };
        Self {
            latitude: self.latitude,
            longitude,
        }
    }

    /// Check latitude ∈ [-90, 90] and longitude ∈ [-180, 180]. NaN fails.
    pub fn validate(&self) -> Result<(), GeoError> {
        let lat_ok = (-90.0..=90.0).contains(&self.latitude);
        let lon_ok = (-180.0..=180.0).contains(&self.longitude);
        if lat_ok && lon_ok {
            Ok(())
        } else {
            Err(GeoError::InvalidCoordinate {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}
