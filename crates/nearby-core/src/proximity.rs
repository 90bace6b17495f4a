//! Merge the live roster with stored directory records into one view.
//!
//! Live entries win over cached ones for the same user. The visible list is
//! filtered by distance and status facet; venue occupancy counts every
//! deduplicated member whose snapped venue matches.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinate::Coordinate;
use crate::error::GeoError;
use crate::geo::distance;
use crate::presence::{PresenceRecord, Roster, StatusFields};
use crate::snap::Venue;

/// A point-in-time user row from the stored directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub position: Option<Coordinate>,
    #[serde(default)]
    pub snapped_venue_id: Option<String>,
    #[serde(default)]
    pub status: StatusFields,
    /// Users in anonymity mode are stored but never shown.
    #[serde(default)]
    pub ghost_mode: bool,
    /// Unix milliseconds of the last directory write for this user.
    #[serde(default)]
    pub updated_at: u64,
}

impl UserRecord {
    pub fn new(user_id: impl Into<String>, position: Option<Coordinate>) -> Self {
        Self {
            user_id: user_id.into(),
            position,
            snapped_venue_id: None,
            status: StatusFields::new(),
            ghost_mode: false,
            updated_at: 0,
        }
    }
}

/// Venues and nearby users as read from the directory at one moment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub venues: Vec<Venue>,
    pub users: Vec<UserRecord>,
    /// Unix milliseconds when the directory data was last refreshed.
    pub refreshed_at: u64,
}

impl DirectorySnapshot {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.refreshed_at)
    }

    /// Stale snapshots are still usable; callers flag the view as approximate.
    pub fn is_stale(&self, now_ms: u64, max_age: Duration) -> bool {
        u128::from(self.age_ms(now_ms)) > max_age.as_millis()
    }
}

/// A `key == value` match against status fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusFilter {
    pub key: String,
    pub value: String,
}

impl StatusFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, status: &StatusFields) -> bool {
        status.get(&self.key) == Some(&self.value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProximityQuery {
    pub center: Coordinate,
    pub radius_m: f64,
    #[serde(default)]
    pub status: Option<StatusFilter>,
    /// Usually the local user, who should not see themselves in the list.
    #[serde(default)]
    pub exclude_user_id: Option<String>,
}

impl ProximityQuery {
    pub fn new(center: Coordinate, radius_m: f64) -> Self {
        Self {
            center,
            radius_m,
            status: None,
            exclude_user_id: None,
        }
    }

    pub fn with_status(mut self, filter: StatusFilter) -> Self {
        self.status = Some(filter);
        self
    }

    pub fn excluding(mut self, user_id: impl Into<String>) -> Self {
        self.exclude_user_id = Some(user_id.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Live,
    Cached,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NearbyUser {
    pub user_id: String,
    pub position: Coordinate,
    pub snapped_venue_id: Option<String>,
    pub status: StatusFields,
    pub source: Source,
    pub distance_m: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VenueOccupancy {
    pub venue_id: String,
    pub live_members: Vec<String>,
    pub cached_members: Vec<String>,
    pub total_count: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProximityView {
    /// Sorted by distance, then user id.
    pub visible: Vec<NearbyUser>,
    /// One entry per venue passed in, in input order.
    pub venues: Vec<VenueOccupancy>,
}

impl ProximityView {
    pub fn occupancy(&self, venue_id: &str) -> Option<&VenueOccupancy> {
        self.venues.iter().find(|v| v.venue_id == venue_id)
    }
}

/// One deduplicated member, borrowed from whichever source won.
struct Member<'a> {
    user_id: &'a str,
    position: Option<Coordinate>,
    snapped_venue_id: Option<&'a str>,
    status: &'a StatusFields,
    source: Source,
}

impl<'a> From<&'a PresenceRecord> for Member<'a> {
    fn from(r: &'a PresenceRecord) -> Self {
        Self {
            user_id: &r.user_id,
            position: r.display_position,
            snapped_venue_id: r.snapped_venue_id.as_deref(),
            status: &r.status,
            source: Source::Live,
        }
    }
}

impl<'a> From<&'a UserRecord> for Member<'a> {
    fn from(u: &'a UserRecord) -> Self {
        Self {
            user_id: &u.user_id,
            position: u.position,
            snapped_venue_id: u.snapped_venue_id.as_deref(),
            status: &u.status,
            source: Source::Cached,
        }
    }
}

fn merge_members<'a>(roster: &'a Roster, cached: &'a [UserRecord]) -> Vec<Member<'a>> {
    let mut members: Vec<Member<'a>> = roster.iter().map(Member::from).collect();
    let mut seen: HashSet<&str> = roster.user_ids().collect();
    for user in cached.iter().filter(|u| !u.ghost_mode) {
        if seen.insert(user.user_id.as_str()) {
            members.push(Member::from(user));
        }
    }
    members
}

pub fn compute_view(
    roster: &Roster,
    cached_nearby: &[UserRecord],
    venues: &[Venue],
    query: &ProximityQuery,
) -> Result<ProximityView, GeoError> {
    query.center.validate()?;
    let members = merge_members(roster, cached_nearby);

    let mut visible = Vec::new();
    for m in &members {
        if query.exclude_user_id.as_deref() == Some(m.user_id) {
            continue;
        }
        let Some(position) = m.position else { continue };
        if let Some(filter) = &query.status
            && !filter.matches(m.status)
        {
            continue;
        }
        // A malformed record from the wire is dropped, not fatal to the view
        let Ok(d) = distance(position, query.center) else {
            continue;
        };
        if d <= query.radius_m {
            visible.push(NearbyUser {
                user_id: m.user_id.to_string(),
                position,
                snapped_venue_id: m.snapped_venue_id.map(str::to_string),
                status: m.status.clone(),
                source: m.source,
                distance_m: d,
            });
        }
    }
    visible.sort_by(|a, b| {
        a.distance_m
            .total_cmp(&b.distance_m)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });

    let mut by_venue: BTreeMap<&str, (Vec<String>, Vec<String>)> = BTreeMap::new();
    for m in &members {
        if let Some(venue_id) = m.snapped_venue_id {
            let entry = by_venue.entry(venue_id).or_default();
            match m.source {
                Source::Live => entry.0.push(m.user_id.to_string()),
                Source::Cached => entry.1.push(m.user_id.to_string()),
            }
        }
    }

    let venues = venues
        .iter()
        .map(|v| {
            let (live_members, cached_members) =
                by_venue.get(v.id.as_str()).cloned().unwrap_or_default();
            VenueOccupancy {
                venue_id: v.id.clone(),
                total_count: live_members.len() + cached_members.len(),
                live_members,
                cached_members,
            }
        })
        .collect();

    Ok(ProximityView { visible, venues })
}

/// Memoizes [`compute_view`] on its inputs.
///
/// While roster, cached users, venues and query stay equal, the same
/// `Arc` comes back, so downstream consumers can skip rebuilding markers
/// with a pointer comparison.
#[derive(Debug, Default)]
pub struct ViewCache {
    last: Option<CachedView>,
}

#[derive(Debug)]
struct CachedView {
    roster: Arc<Roster>,
    cached_nearby: Vec<UserRecord>,
    venues: Vec<Venue>,
    query: ProximityQuery,
    view: Arc<ProximityView>,
}

impl ViewCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(
        &mut self,
        roster: &Arc<Roster>,
        cached_nearby: &[UserRecord],
        venues: &[Venue],
        query: &ProximityQuery,
    ) -> Result<Arc<ProximityView>, GeoError> {
        if let Some(last) = &self.last
            && (Arc::ptr_eq(&last.roster, roster) || *last.roster == **roster)
            && last.cached_nearby == cached_nearby
            && last.venues == venues
            && last.query == *query
        {
            return Ok(Arc::clone(&last.view));
        }

        let computed = compute_view(roster, cached_nearby, venues, query)?;
        // Inputs that differ only in fields the view ignores keep the old Arc
        let view = match &self.last {
            Some(last) if *last.view == computed => Arc::clone(&last.view),
            _ => Arc::new(computed),
        };
        self.last = Some(CachedView {
            roster: Arc::clone(roster),
            cached_nearby: cached_nearby.to_vec(),
            venues: venues.to_vec(),
            query: query.clone(),
            view: Arc::clone(&view),
        });
        Ok(view)
    }

    pub fn invalidate(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::offset_by_meters;

    fn center() -> Coordinate {
        Coordinate::new(40.0, -73.0).unwrap()
    }

    fn at(north_m: f64) -> Coordinate {
        offset_by_meters(center(), north_m, 0.0).unwrap()
    }

    fn live(user: &str, north_m: f64, venue: Option<&str>) -> PresenceRecord {
        PresenceRecord {
            user_id: user.into(),
            display_position: Some(at(north_m)),
            snapped_venue_id: venue.map(str::to_string),
            status: StatusFields::new(),
            published_at: 1,
        }
    }

    fn cached(user: &str, north_m: f64, venue: Option<&str>) -> UserRecord {
        let mut u = UserRecord::new(user, Some(at(north_m)));
        u.snapped_venue_id = venue.map(str::to_string);
        u
    }

    fn venue(id: &str) -> Venue {
        Venue::new(id, center(), true, true)
    }

    #[test]
    fn test_live_wins_over_cached() {
        let roster: Roster = vec![live("alice", 50.0, None)].into_iter().collect();
        let users = vec![cached("alice", 5000.0, None), cached("bob", 100.0, None)];
        let query = ProximityQuery::new(center(), 1000.0);
        let view = compute_view(&roster, &users, &[], &query).unwrap();

        let ids: Vec<_> = view.visible.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob"]);
        assert_eq!(view.visible[0].source, Source::Live);
        assert_eq!(view.visible[1].source, Source::Cached);
    }

    #[test]
    fn test_radius_filter() {
        let roster: Roster = vec![live("near", 100.0, None), live("far", 2000.0, None)]
            .into_iter()
            .collect();
        let view = compute_view(&roster, &[], &[], &ProximityQuery::new(center(), 500.0)).unwrap();
        assert_eq!(view.visible.len(), 1);
        assert_eq!(view.visible[0].user_id, "near");
        assert!((view.visible[0].distance_m - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_status_filter() {
        let mut coffee = live("coffee", 10.0, None);
        coffee.status.insert("category".into(), "coffee".into());
        let roster: Roster = vec![coffee, live("plain", 10.0, None)].into_iter().collect();
        let mut tea_drinker = cached("tea", 10.0, None);
        tea_drinker.status.insert("category".into(), "tea".into());

        let query = ProximityQuery::new(center(), 500.0)
            .with_status(StatusFilter::new("category", "coffee"));
        let view = compute_view(&roster, &[tea_drinker], &[], &query).unwrap();
        assert_eq!(view.visible.len(), 1);
        assert_eq!(view.visible[0].user_id, "coffee");
    }

    #[test]
    fn test_excludes_self_and_ghosts_and_positionless() {
        let mut hidden = live("no-pos", 10.0, None);
        hidden.display_position = None;
        let roster: Roster = vec![live("me", 0.0, None), hidden].into_iter().collect();
        let mut ghost = cached("ghost", 10.0, None);
        ghost.ghost_mode = true;

        let query = ProximityQuery::new(center(), 500.0).excluding("me");
        let view = compute_view(&roster, &[ghost], &[], &query).unwrap();
        assert!(view.visible.is_empty(), "{:?}", view.visible);
    }

    #[test]
    fn test_venue_counts_deduplicate() {
        let roster: Roster = vec![live("alice", 0.0, Some("v1")), live("bob", 0.0, Some("v2"))]
            .into_iter()
            .collect();
        let users = vec![
            // stale copy of alice at another venue must not double count
            cached("alice", 0.0, Some("v2")),
            cached("carol", 0.0, Some("v1")),
        ];
        let venues = vec![venue("v1"), venue("v2"), venue("v3")];
        let query = ProximityQuery::new(center(), 10.0);
        let view = compute_view(&roster, &users, &venues, &query).unwrap();

        let v1 = view.occupancy("v1").unwrap();
        assert_eq!(v1.live_members, vec!["alice"]);
        assert_eq!(v1.cached_members, vec!["carol"]);
        assert_eq!(v1.total_count, 2);

        let v2 = view.occupancy("v2").unwrap();
        assert_eq!(v2.live_members, vec!["bob"]);
        assert!(v2.cached_members.is_empty());
        assert_eq!(v2.total_count, 1);

        assert_eq!(view.occupancy("v3").unwrap().total_count, 0);
    }

    #[test]
    fn test_sorted_by_distance() {
        let roster: Roster = vec![
            live("c", 300.0, None),
            live("a", 100.0, None),
            live("b", 200.0, None),
        ]
        .into_iter()
        .collect();
        let view = compute_view(&roster, &[], &[], &ProximityQuery::new(center(), 1000.0)).unwrap();
        let ids: Vec<_> = view.visible.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_invalid_center_rejected() {
        let query = ProximityQuery::new(
            Coordinate {
                latitude: 100.0,
                longitude: 0.0,
            },
            10.0,
        );
        assert!(compute_view(&Roster::new(), &[], &[], &query).is_err());
    }

    #[test]
    fn test_cache_returns_same_arc_for_unchanged_inputs() {
        let roster = Arc::new(vec![live("a", 10.0, None)].into_iter().collect::<Roster>());
        let users = vec![cached("b", 10.0, None)];
        let query = ProximityQuery::new(center(), 100.0);
        let mut cache = ViewCache::new();

        let first = cache.view(&roster, &users, &[], &query).unwrap();
        let second = cache.view(&roster, &users, &[], &query).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // An equal roster in a different allocation still hits
        let copy = Arc::new((*roster).clone());
        let third = cache.view(&copy, &users, &[], &query).unwrap();
        assert!(Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_cache_keeps_arc_when_only_timestamps_change() {
        let roster = Arc::new(vec![live("a", 10.0, None)].into_iter().collect::<Roster>());
        let query = ProximityQuery::new(center(), 100.0);
        let mut cache = ViewCache::new();
        let first = cache.view(&roster, &[], &[], &query).unwrap();

        let mut republished = live("a", 10.0, None);
        republished.published_at = 2;
        let mut next = (*roster).clone();
        next.upsert(republished);
        assert_ne!(next, *roster);

        let second = cache.view(&Arc::new(next), &[], &[], &query).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_cache_recomputes_on_change() {
        let roster = Arc::new(vec![live("a", 10.0, None)].into_iter().collect::<Roster>());
        let query = ProximityQuery::new(center(), 100.0);
        let mut cache = ViewCache::new();
        let first = cache.view(&roster, &[], &[], &query).unwrap();

        let wider = ProximityQuery::new(center(), 200.0);
        let second = cache.view(&roster, &[], &[], &wider).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        let mut next = (*roster).clone();
        next.upsert(live("z", 20.0, None));
        let third = cache.view(&Arc::new(next), &[], &[], &wider).unwrap();
        assert_eq!(third.visible.len(), 2);

        cache.invalidate();
        let fourth = cache.view(&roster, &[], &[], &query).unwrap();
        assert!(!Arc::ptr_eq(&first, &fourth));
        assert_eq!(*first, *fourth);
    }

    #[test]
    fn test_snapshot_staleness() {
        let snap = DirectorySnapshot {
            refreshed_at: 1_000,
            ..Default::default()
        };
        assert_eq!(snap.age_ms(4_000), 3_000);
        assert!(!snap.is_stale(4_000, Duration::from_secs(3)));
        assert!(snap.is_stale(4_001, Duration::from_secs(3)));
        // no overflow on absurd limits
        assert!(!snap.is_stale(u64::MAX, Duration::from_secs(u64::MAX)));
        assert_eq!(snap.age_ms(500), 0);
    }
}
