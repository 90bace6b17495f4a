use serde::{Deserialize, Serialize};

use crate::coordinate::Coordinate;
use crate::error::GeoError;
use crate::fuzz::{SessionOffset, fuzz};
use crate::geo::distance;

/// A public place a device can snap to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub id: String,
    pub coordinate: Coordinate,
    pub verified: bool,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Venue {
    pub fn new(
        id: impl Into<String>,
        coordinate: Coordinate,
        verified: bool,
        active: bool,
    ) -> Self {
        Self {
            id: id.into(),
            coordinate,
            verified,
            active,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Only verified, active venues take part in snapping.
    pub fn is_eligible(&self) -> bool {
        self.verified && self.active
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "venue_id", rename_all = "snake_case")]
pub enum SnapResult {
    Snapped(String),
    NotSnapped,
}

impl SnapResult {
    pub fn venue_id(&self) -> Option<&str> {
        match self {
            SnapResult::Snapped(id) => Some(id),
            SnapResult::NotSnapped => None,
        }
    }

    pub fn is_snapped(&self) -> bool {
        matches!(self, SnapResult::Snapped(_))
    }
}

/// Nearest eligible venue and its distance in meters.
///
/// Exact ties keep the first venue encountered. Venues whose own coordinate
/// is off the globe are skipped rather than poisoning the whole lookup.
pub fn nearest_eligible<'a>(
    position: Coordinate,
    venues: &'a [Venue],
) -> Result<Option<(&'a Venue, f64)>, GeoError> {
    position.validate()?;
    let mut best: Option<(&Venue, f64)> = None;
    for venue in venues.iter().filter(|v| v.is_eligible()) {
        let Ok(d) = distance(position, venue.coordinate) else {
            continue;
        };
        match best {
            Some((_, best_d)) if d >= best_d => {}
            _ => best = Some((venue, d)),
        }
    }
    Ok(best)
}

/// Snap when the nearest eligible venue is within `threshold_m`.
pub fn resolve_snap(
    position: Coordinate,
    venues: &[Venue],
    threshold_m: f64,
) -> Result<SnapResult, GeoError> {
    Ok(match nearest_eligible(position, venues)? {
        Some((venue, d)) if d <= threshold_m => SnapResult::Snapped(venue.id.clone()),
        _ => SnapResult::NotSnapped,
    })
}

/// What a device shares about where it is.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub display_position: Option<Coordinate>,
    pub snapped_venue_id: Option<String>,
}

impl Placement {
    /// Share nothing.
    pub fn hidden() -> Self {
        Self::default()
    }

    /// Snap first; fuzz only when no venue is in range.
    ///
    /// A snapped placement shows the venue's own coordinate, never the
    /// fuzzed one, whatever the privacy radius.
    pub fn resolve(
        true_position: Coordinate,
        radius_m: i32,
        offset: SessionOffset,
        venues: &[Venue],
        threshold_m: f64,
    ) -> Result<Self, GeoError> {
        if let Some((venue, d)) = nearest_eligible(true_position, venues)?
            && d <= threshold_m
        {
            return Ok(Self {
                display_position: Some(venue.coordinate),
                snapped_venue_id: Some(venue.id.clone()),
            });
        }
        Ok(Self {
            display_position: Some(fuzz(true_position, radius_m, offset)?),
            snapped_venue_id: None,
        })
    }

    pub fn snap_result(&self) -> SnapResult {
        match &self.snapped_venue_id {
            Some(id) => SnapResult::Snapped(id.clone()),
            None => SnapResult::NotSnapped,
        }
    }
}
