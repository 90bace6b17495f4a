use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};

use nearby_core::constants::{METERS_PER_DEGREE, MIN_LONGITUDE_SCALE};
use nearby_core::{Coordinate, DirectorySnapshot, StatusFields, UserRecord, Venue, within_radius};

use crate::error::{Result, StoreError};
use crate::schema;

const REFRESHED_AT_KEY: &str = "refreshed_at";

/// Read side of the user/venue directory, plus the writes that seed it.
pub struct Store {
    conn: Connection,
}

/// Latitude/longitude window that contains a circle. `lon` is `None` when
/// the window crosses the antimeridian and longitude cannot prefilter.
struct BoundingBox {
    lat: (f64, f64),
    lon: Option<(f64, f64)>,
}

impl BoundingBox {
    fn around(center: Coordinate, radius_m: f64) -> Self {
        let lat_span = radius_m / METERS_PER_DEGREE;
        let lon_scale = center.latitude.to_radians().cos().max(MIN_LONGITUDE_SCALE);
        let lon_span = radius_m / (METERS_PER_DEGREE * lon_scale);

        let lat = (center.latitude - lat_span, center.latitude + lat_span);
        let (lo, hi) = (center.longitude - lon_span, center.longitude + lon_span);
        let polar = lat.0 <= -90.0 || lat.1 >= 90.0;
        let lon = if polar || lo < -180.0 || hi > 180.0 {
            None
        } else {
            Some((lo, hi))
        };
        Self { lat, lon }
    }

    fn lon_or_all(&self) -> (f64, f64) {
        self.lon.unwrap_or((-180.0, 180.0))
    }
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// When the directory contents were last brought up to date (Unix ms).
    /// Zero if never.
    pub fn refreshed_at(&self) -> Result<u64> {
        match self.get_metadata(REFRESHED_AT_KEY)? {
            Some(v) => v
                .parse()
                .map_err(|_| StoreError::InvalidData(format!("bad {REFRESHED_AT_KEY}: {v}"))),
            None => Ok(0),
        }
    }

    pub fn mark_refreshed(&self, at_ms: u64) -> Result<()> {
        self.set_metadata(REFRESHED_AT_KEY, &at_ms.to_string())
    }

    // --- Venues ---

    pub fn upsert_venue(&self, venue: &Venue) -> Result<()> {
        venue.coordinate.validate()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO venues (id, name, latitude, longitude, verified, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                venue.id,
                venue.name,
                venue.coordinate.latitude,
                venue.coordinate.longitude,
                venue.verified,
                venue.active,
            ],
        )?;
        Ok(())
    }

    pub fn remove_venue(&self, id: &str) -> Result<bool> {
        Ok(self.conn.execute("DELETE FROM venues WHERE id = ?1", [id])? > 0)
    }

    pub fn venue(&self, id: &str) -> Result<Option<Venue>> {
        let venue = self
            .conn
            .query_row(
                "SELECT id, name, latitude, longitude, verified, active FROM venues WHERE id = ?1",
                [id],
                venue_from_row,
            )
            .optional()?;
        Ok(venue)
    }

    pub fn venues(&self) -> Result<Vec<Venue>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, latitude, longitude, verified, active
             FROM venues ORDER BY rowid",
        )?;
        let venues = stmt
            .query_map([], venue_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(venues)
    }

    /// Venues within `radius_m` of `center`, nearest-first order not implied.
    pub fn venues_near(&self, center: Coordinate, radius_m: f64) -> Result<Vec<Venue>> {
        center.validate()?;
        let bbox = BoundingBox::around(center, radius_m);
        let (lon_lo, lon_hi) = bbox.lon_or_all();
        let mut stmt = self.conn.prepare(
            "SELECT id, name, latitude, longitude, verified, active FROM venues
             WHERE latitude BETWEEN ?1 AND ?2 AND longitude BETWEEN ?3 AND ?4
             ORDER BY rowid",
        )?;
        let candidates = stmt
            .query_map(params![bbox.lat.0, bbox.lat.1, lon_lo, lon_hi], venue_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut venues = Vec::with_capacity(candidates.len());
        for v in candidates {
            if within_radius(v.coordinate, center, radius_m)? {
                venues.push(v);
            }
        }
        Ok(venues)
    }

    pub fn venue_count(&self) -> Result<usize> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM venues", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    // --- Users ---

    pub fn upsert_user(&self, user: &UserRecord) -> Result<()> {
        if let Some(p) = &user.position {
            p.validate()?;
        }
        let status_json = serde_json::to_string(&user.status)
            .map_err(|e| StoreError::InvalidData(format!("status for {}: {e}", user.user_id)))?;
        self.conn.execute(
            "INSERT OR REPLACE INTO users
                (user_id, latitude, longitude, snapped_venue_id,
                 status_json, ghost_mode, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.user_id,
                user.position.map(|p| p.latitude),
                user.position.map(|p| p.longitude),
                user.snapped_venue_id,
                status_json,
                user.ghost_mode,
                user.updated_at as i64,
            ],
        )?;
        Ok(())
    }

    pub fn remove_user(&self, user_id: &str) -> Result<bool> {
        Ok(self.conn.execute("DELETE FROM users WHERE user_id = ?1", [user_id])? > 0)
    }

    /// Every stored user, ghosts included.
    pub fn users(&self) -> Result<Vec<UserRecord>> {
        self.query_users(
            "SELECT user_id, latitude, longitude, snapped_venue_id,
                    status_json, ghost_mode, updated_at
             FROM users ORDER BY user_id",
            [],
        )
    }

    /// Visible users within `radius_m` of `center`. Ghost-mode users and
    /// users without a stored position are never returned.
    pub fn users_near(&self, center: Coordinate, radius_m: f64) -> Result<Vec<UserRecord>> {
        center.validate()?;
        let bbox = BoundingBox::around(center, radius_m);
        let (lon_lo, lon_hi) = bbox.lon_or_all();
        let candidates = self.query_users(
            "SELECT user_id, latitude, longitude, snapped_venue_id,
                    status_json, ghost_mode, updated_at
             FROM users
             WHERE ghost_mode = 0
               AND latitude BETWEEN ?1 AND ?2 AND longitude BETWEEN ?3 AND ?4
             ORDER BY user_id",
            params![bbox.lat.0, bbox.lat.1, lon_lo, lon_hi],
        )?;

        let mut users = Vec::with_capacity(candidates.len());
        for u in candidates {
            if let Some(p) = u.position
                && within_radius(p, center, radius_m)?
            {
                users.push(u);
            }
        }
        Ok(users)
    }

    /// Visible users whose stored record places them at `venue_id`.
    pub fn users_at_venue(&self, venue_id: &str) -> Result<Vec<UserRecord>> {
        self.query_users(
            "SELECT user_id, latitude, longitude, snapped_venue_id,
                    status_json, ghost_mode, updated_at
             FROM users WHERE ghost_mode = 0 AND snapped_venue_id = ?1 ORDER BY user_id",
            [venue_id],
        )
    }

    pub fn user_count(&self) -> Result<usize> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    fn query_users(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<UserRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows: Vec<(UserRecord, String)> = stmt
            .query_map(params, user_from_row)?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(mut user, status_json)| -> Result<UserRecord> {
                user.status = serde_json::from_str::<StatusFields>(&status_json).map_err(|e| {
                    StoreError::InvalidData(format!("status for {}: {e}", user.user_id))
                })?;
                Ok(user)
            })
            .collect()
    }

    // --- Snapshots ---

    /// Venues and visible users around `center`. Users snapped to one of
    /// those venues are included even if their stored point lies outside
    /// the radius, so venue occupancy is complete.
    pub fn snapshot(&self, center: Coordinate, radius_m: f64) -> Result<DirectorySnapshot> {
        let venues = self.venues_near(center, radius_m)?;
        let mut users = self.users_near(center, radius_m)?;
        for venue in &venues {
            for user in self.users_at_venue(&venue.id)? {
                if !users.iter().any(|u| u.user_id == user.user_id) {
                    users.push(user);
                }
            }
        }
        Ok(DirectorySnapshot {
            venues,
            users,
            refreshed_at: self.refreshed_at()?,
        })
    }

    /// Like [`Store::snapshot`], but refuses data older than `max_age`.
    pub fn fresh_snapshot(
        &self,
        center: Coordinate,
        radius_m: f64,
        max_age: Duration,
        now_ms: u64,
    ) -> Result<DirectorySnapshot> {
        let snapshot = self.snapshot(center, radius_m)?;
        if snapshot.is_stale(now_ms, max_age) {
            return Err(StoreError::StaleSnapshot {
                age_secs: snapshot.age_ms(now_ms) / 1000,
                max_age_secs: max_age.as_secs(),
            });
        }
        Ok(snapshot)
    }
}

fn venue_from_row(row: &Row<'_>) -> rusqlite::Result<Venue> {
    Ok(Venue {
        id: row.get(0)?,
        name: row.get(1)?,
        coordinate: Coordinate {
            latitude: row.get(2)?,
            longitude: row.get(3)?,
        },
        verified: row.get(4)?,
        active: row.get(5)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<(UserRecord, String)> {
    let latitude: Option<f64> = row.get(1)?;
    let longitude: Option<f64> = row.get(2)?;
    let position = match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(Coordinate {
            latitude,
            longitude,
        }),
        _ => None,
    };
    let updated_at: i64 = row.get(6)?;
    Ok((
        UserRecord {
            user_id: row.get(0)?,
            position,
            snapped_venue_id: row.get(3)?,
            status: StatusFields::new(),
            ghost_mode: row.get(5)?,
            updated_at: updated_at.max(0) as u64,
        },
        row.get(4)?,
    ))
}
