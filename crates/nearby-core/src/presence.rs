use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::coordinate::Coordinate;
use crate::snap::Placement;

/// Free-form status facets a user shares alongside position
/// (e.g. `status = "open to chat"`, `category = "coffee"`).
pub type StatusFields = BTreeMap<String, String>;

/// One user's live, shareable state.
///
/// Each client owns and publishes exactly one of these; every other copy is
/// a read-only mirror. A full record goes out on every publish.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub display_position: Option<Coordinate>,
    pub snapped_venue_id: Option<String>,
    #[serde(default)]
    pub status: StatusFields,
    /// Unix milliseconds at publish time.
    pub published_at: u64,
}

impl PresenceRecord {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_position: None,
            snapped_venue_id: None,
            status: StatusFields::new(),
            published_at: 0,
        }
    }

    /// Merge a partial update in place. Returns true if any field changed
    /// (the timestamp is not considered).
    pub fn merge(&mut self, update: PresenceUpdate) -> bool {
        let mut changed = false;
        if let Some(placement) = update.placement {
            changed |= self.display_position != placement.display_position
                || self.snapped_venue_id != placement.snapped_venue_id;
            self.display_position = placement.display_position;
            self.snapped_venue_id = placement.snapped_venue_id;
        }
        for key in update.clear_status {
            changed |= self.status.remove(&key).is_some();
        }
        for (key, value) in update.status {
            if self.status.get(&key) != Some(&value) {
                self.status.insert(key, value);
                changed = true;
            }
        }
        changed
    }

    /// A record with no position has nothing worth publishing.
    pub fn has_position(&self) -> bool {
        self.display_position.is_some()
    }

    pub fn placement(&self) -> Placement {
        Placement {
            display_position: self.display_position,
            snapped_venue_id: self.snapped_venue_id.clone(),
        }
    }
}

/// A partial change to the local record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PresenceUpdate {
    pub placement: Option<Placement>,
    pub status: StatusFields,
    pub clear_status: Vec<String>,
}

impl PresenceUpdate {
    pub fn placement(placement: Placement) -> Self {
        Self {
            placement: Some(placement),
            ..Self::default()
        }
    }

    pub fn status(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut status = StatusFields::new();
        status.insert(key.into(), value.into());
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_status(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.status.insert(key.into(), value.into());
        self
    }

    pub fn clearing(mut self, key: impl Into<String>) -> Self {
        self.clear_status.push(key.into());
        self
    }
}

/// What a presence channel delivers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    /// Authoritative full membership.
    Sync { members: Vec<PresenceRecord> },
    Join { members: Vec<PresenceRecord> },
    Leave { user_ids: Vec<String> },
}

/// Latest known record per user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    members: BTreeMap<String, PresenceRecord>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster wholesale with a sync snapshot. Users missing from
    /// the snapshot are gone afterwards. Duplicate ids keep the newest.
    pub fn apply_sync(&mut self, members: Vec<PresenceRecord>) -> bool {
        let mut next: BTreeMap<String, PresenceRecord> = BTreeMap::new();
        for record in members {
            match next.get(&record.user_id) {
                Some(held) if held.published_at > record.published_at => {}
                _ => {
                    next.insert(record.user_id.clone(), record);
                }
            }
        }
        if next == self.members {
            return false;
        }
        self.members = next;
        true
    }

    /// Last-write-wins insert. Records older than the one held are dropped.
    pub fn upsert(&mut self, record: PresenceRecord) -> bool {
        if let Some(held) = self.members.get(&record.user_id) {
            if held.published_at > record.published_at || *held == record {
                return false;
            }
        }
        self.members.insert(record.user_id.clone(), record);
        true
    }

    pub fn remove(&mut self, user_id: &str) -> bool {
        self.members.remove(user_id).is_some()
    }

    /// Fold one channel event in. Returns true if the roster changed.
    pub fn apply(&mut self, event: PresenceEvent) -> bool {
        match event {
            PresenceEvent::Sync { members } => self.apply_sync(members),
            PresenceEvent::Join { members } => {
                members.into_iter().fold(false, |changed, r| self.upsert(r) | changed)
            }
            PresenceEvent::Leave { user_ids } => user_ids
                .iter()
                .fold(false, |changed, id| self.remove(id) | changed),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceRecord> {
        self.members.get(user_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.members.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PresenceRecord> {
        self.members.values()
    }

    pub fn user_ids(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }
}

impl FromIterator<PresenceRecord> for Roster {
    fn from_iter<I: IntoIterator<Item = PresenceRecord>>(iter: I) -> Self {
        let mut roster = Roster::new();
        roster.apply_sync(iter.into_iter().collect());
        roster
    }
}
