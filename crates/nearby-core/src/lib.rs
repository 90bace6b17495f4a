//! Privacy-preserving presence engine: the pure half.
//!
//! Great-circle math, session-stable position fuzzing, venue snapping,
//! last-write-wins presence rosters, and the proximity view that merges live
//! presence with stored directory data.
//!
//! Zero I/O. Transport, sensors and storage live in the sibling crates.

pub mod config;
pub mod constants;
pub mod coordinate;
pub mod error;
pub mod fuzz;
pub mod geo;
pub mod presence;
pub mod proximity;
pub mod snap;
pub mod time;
pub mod wire;

pub use config::{Config, EngineConfig, GhostPolicy, PrivacySettings};
pub use constants::{
    DEFAULT_PRIVACY_RADIUS_M, DEFAULT_TOPIC, EARTH_RADIUS_M, MAX_PRIVACY_RADIUS_M, SNAP_THRESHOLD_M,
};
pub use coordinate::Coordinate;
pub use error::{GeoError, WireError};
pub use fuzz::{Fuzzer, PrivacyRadius, SessionOffset, fuzz};
pub use geo::{distance, initial_bearing, offset_by_meters, within_radius};
pub use presence::{PresenceEvent, PresenceRecord, PresenceUpdate, Roster, StatusFields};
pub use proximity::{
    DirectorySnapshot, NearbyUser, ProximityQuery, ProximityView, Source, StatusFilter, UserRecord,
    VenueOccupancy, ViewCache, compute_view,
};
pub use snap::{Placement, SnapResult, Venue, nearest_eligible, resolve_snap};
pub use time::{millis_to_iso8601, next_stamp, now_unix_millis};
pub use wire::{TrackRequest, UntrackRequest, WIRE_VERSION, decode_event, encode_event};
