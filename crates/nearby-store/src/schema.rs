use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS venues (
            id        TEXT PRIMARY KEY,
            name      TEXT,
            latitude  REAL NOT NULL,
            longitude REAL NOT NULL,
            verified  INTEGER NOT NULL DEFAULT 0,
            active    INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS users (
            user_id          TEXT PRIMARY KEY,
            latitude         REAL,
            longitude        REAL,
            snapped_venue_id TEXT,
            status_json      TEXT NOT NULL DEFAULT '{}',
            ghost_mode       INTEGER NOT NULL DEFAULT 0,
            updated_at       INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_venue_lat ON venues(latitude);
        CREATE INDEX IF NOT EXISTS idx_user_lat ON users(latitude);
        CREATE INDEX IF NOT EXISTS idx_user_venue ON users(snapped_venue_id);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    tracing::debug!("directory schema v{SCHEMA_VERSION} ready");
    Ok(())
}
