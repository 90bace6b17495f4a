use std::fs;
use std::path::Path;

use nearby_core::{UserRecord, Venue};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::store::Store;

/// Portable dump of the directory, as handed over by the backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryFile {
    #[serde(default)]
    pub venues: Vec<Venue>,
    #[serde(default)]
    pub users: Vec<UserRecord>,
}

impl Store {
    /// Upsert everything in `file` in one transaction and stamp the refresh time.
    pub fn import_directory(&self, file: &DirectoryFile, refreshed_at_ms: u64) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        for venue in &file.venues {
            self.upsert_venue(venue)?;
        }
        for user in &file.users {
            self.upsert_user(user)?;
        }
        self.mark_refreshed(refreshed_at_ms)?;
        tx.commit()?;
        tracing::info!(
            venues = file.venues.len(),
            users = file.users.len(),
            "imported directory"
        );
        Ok(())
    }

    pub fn import_json_file(&self, path: &Path, refreshed_at_ms: u64) -> Result<DirectoryFile> {
        let json = fs::read_to_string(path).map_err(|e| {
            StoreError::InvalidData(format!("failed to read {}: {e}", path.display()))
        })?;
        let file = self.import_json_str(&json, refreshed_at_ms)?;
        Ok(file)
    }

    pub fn import_json_str(&self, json: &str, refreshed_at_ms: u64) -> Result<DirectoryFile> {
        let file: DirectoryFile = serde_json::from_str(json)
            .map_err(|e| StoreError::InvalidData(format!("invalid JSON: {e}")))?;
        self.import_directory(&file, refreshed_at_ms)?;
        Ok(file)
    }

    pub fn export_directory(&self) -> Result<DirectoryFile> {
        Ok(DirectoryFile {
            venues: self.venues()?,
            users: self.users()?,
        })
    }

    pub fn export_json_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.export_directory()?)
            .map_err(|e| StoreError::InvalidData(format!("JSON export failed: {e}")))?;
        fs::write(path, json).map_err(|e| {
            StoreError::InvalidData(format!("failed to write {}: {e}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearby_core::Coordinate;

    const SEED: &str = r#"{
        "venues": [
            {
                "id": "v1",
                "coordinate": {"latitude": 40.001, "longitude": -73.001},
                "verified": true,
                "active": true,
                "name": "Pier Cafe"
            },
            {
                "id": "v2",
                "coordinate": {"latitude": 40.01, "longitude": -73.0},
                "verified": false,
                "active": true
            }
        ],
        "users": [
            {
                "user_id": "alice",
                "position": {"latitude": 40.0, "longitude": -73.0},
                "status": {"mood": "chill"}
            },
            {"user_id": "bob", "position": null, "snapped_venue_id": "v1", "ghost_mode": true}
        ]
    }"#;

    #[test]
    fn test_import_json_str() {
        let store = Store::open_in_memory().unwrap();
        let file = store.import_json_str(SEED, 42).unwrap();
        assert_eq!(file.venues.len(), 2);
        assert_eq!(store.venue_count().unwrap(), 2);
        assert_eq!(store.user_count().unwrap(), 2);
        assert_eq!(store.refreshed_at().unwrap(), 42);
        assert_eq!(store.venue("v1").unwrap().unwrap().name.as_deref(), Some("Pier Cafe"));
    }

    #[test]
    fn test_export_matches_import() {
        let store = Store::open_in_memory().unwrap();
        let imported = store.import_json_str(SEED, 1).unwrap();
        let exported = store.export_directory().unwrap();
        assert_eq!(exported.venues, imported.venues);
        // users come back ordered by id
        assert_eq!(exported.users, imported.users);
    }

    #[test]
    fn test_invalid_coordinate_aborts_import() {
        let store = Store::open_in_memory().unwrap();
        let bad = DirectoryFile {
            venues: vec![Venue::new("ok", Coordinate::new(1.0, 1.0).unwrap(), true, true)],
            users: vec![UserRecord::new(
                "broken",
                Some(Coordinate {
                    latitude: 1.0,
                    longitude: 500.0,
                }),
            )],
        };
        assert!(store.import_directory(&bad, 5).is_err());
        assert_eq!(store.venue_count().unwrap(), 0, "transaction should roll back");
        assert_eq!(store.refreshed_at().unwrap(), 0);
    }

    #[test]
    fn test_rejects_malformed_json() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.import_json_str("{", 1),
            Err(StoreError::InvalidData(_))
        ));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dump.json");
        let store = Store::open_in_memory().unwrap();
        store.import_json_str(SEED, 1).unwrap();
        store.export_json_file(&path).unwrap();

        let other = Store::open_in_memory().unwrap();
        other.import_json_file(&path, 2).unwrap();
        assert_eq!(other.export_directory().unwrap(), store.export_directory().unwrap());
    }
}
