//! Greedy nearest-centroid identity tracker.
//!
//! Each incoming box is matched against the live object whose centroid is
//! closest, provided the distance is strictly below the match threshold.
//! The assignment is greedy in input order, so crossing paths can swap
//! identities. Objects unseen for longer than `max_lost` are retired for good.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    str::FromStr,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use serde::{Serialize, Serializer};
use tracing::debug;

use crate::geometry::{BoundingBox, distance};

/// Stable identity of a tracked object, rendered as eight hex digits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(u64);

impl TrackId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for TrackId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(TrackId)
    }
}

impl Serialize for TrackId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrajectoryPoint {
    pub x: i64,
    pub y: i64,
    pub at: Instant,
}

#[derive(Clone, Debug)]
pub struct TrackedObject {
    pub id: TrackId,
    pub bbox: BoundingBox,
    pub last_seen: Instant,
    /// Oldest sample first.
    pub trajectory: VecDeque<TrajectoryPoint>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackerConfig {
    pub max_lost: Duration,
    pub match_distance: f64,
    pub trajectory_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_lost: Duration::from_secs(15),
            match_distance: 80.0,
            trajectory_capacity: 20,
        }
    }
}

struct TrackerState {
    objects: BTreeMap<TrackId, TrackedObject>,
    next_id: u64,
}

pub struct IdentityTracker {
    config: TrackerConfig,
    state: Mutex<TrackerState>,
}

impl IdentityTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TrackerState {
                objects: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expired(&self, object: &TrackedObject, now: Instant) -> bool {
        now.saturating_duration_since(object.last_seen) > self.config.max_lost
    }

    pub fn update(&self, boxes: &[BoundingBox]) -> Vec<(TrackId, BoundingBox)> {
        self.update_at(boxes, Instant::now())
    }

    /// Match `boxes` against live objects as of `now`, then retire stale ones.
    ///
    /// Returns one `(id, box)` pair per input box, in input order.
    pub fn update_at(&self, boxes: &[BoundingBox], now: Instant) -> Vec<(TrackId, BoundingBox)> {
        let mut state = self.state();
        let mut assigned = Vec::with_capacity(boxes.len());

        for bbox in boxes {
            let (cx, cy) = bbox.centroid();

            // BTreeMap iteration is id order, i.e. creation order; the first
            // strict minimum wins ties.
            let mut best: Option<(TrackId, f64)> = None;
            for (id, object) in &state.objects {
                if self.expired(object, now) {
                    continue;
                }
                let dist = distance((cx, cy), object.bbox.centroid());
                if dist < self.config.match_distance && best.is_none_or(|(_, d)| dist < d) {
                    best = Some((*id, dist));
                }
            }

            let point = TrajectoryPoint { x: cx, y: cy, at: now };
            let matched = best.map(|(id, _)| id);
            let id = match matched {
                Some(id) => {
                    if let Some(object) = state.objects.get_mut(&id) {
                        object.bbox = *bbox;
                        object.last_seen = now;
                        object.trajectory.push_back(point);
                        while object.trajectory.len() > self.config.trajectory_capacity {
                            object.trajectory.pop_front();
                        }
                    }
                    id
                }
                None => {
                    let id = TrackId(state.next_id);
                    state.next_id += 1;
                    let mut trajectory = VecDeque::with_capacity(self.config.trajectory_capacity);
                    if self.config.trajectory_capacity > 0 {
                        trajectory.push_back(point);
                    }
                    state.objects.insert(
                        id,
                        TrackedObject {
                            id,
                            bbox: *bbox,
                            last_seen: now,
                            trajectory,
                        },
                    );
                    debug!(%id, x = cx, y = cy, "new track");
                    id
                }
            };
            assigned.push((id, *bbox));
        }

        let before = state.objects.len();
        state.objects.retain(|_, object| !self.expired(object, now));
        let retired = before - state.objects.len();
        if retired > 0 {
            debug!(retired, live = state.objects.len(), "tracks retired");
        }

        assigned
    }

    /// Centroids of `id` sampled within the last `ttl`, oldest first.
    pub fn trajectory(&self, id: TrackId, ttl: Duration) -> Vec<(i64, i64)> {
        self.trajectory_at(id, ttl, Instant::now())
    }

    pub fn trajectory_at(&self, id: TrackId, ttl: Duration, now: Instant) -> Vec<(i64, i64)> {
        let state = self.state();
        let Some(object) = state.objects.get(&id) else {
            return Vec::new();
        };
        if self.expired(object, now) {
            return Vec::new();
        }
        object
            .trajectory
            .iter()
            .filter(|p| now.saturating_duration_since(p.at) <= ttl)
            .map(|p| (p.x, p.y))
            .collect()
    }

    /// Copy of every live object, in id order.
    pub fn objects(&self) -> Vec<TrackedObject> {
        self.state().objects.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdentityTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn tracker(match_distance: f64, max_lost_secs: u64, capacity: usize) -> IdentityTracker {
        IdentityTracker::new(TrackerConfig {
            max_lost: Duration::from_secs(max_lost_secs),
            match_distance,
            trajectory_capacity: capacity,
        })
    }

    /// Box whose centroid lands exactly on `(cx, cy)`.
    fn at(cx: u32, cy: u32) -> BoundingBox {
        BoundingBox::new(cx - 5, cy - 5, 10, 10)
    }

    #[test]
    fn later_box_in_same_call_matches_new_identity() {
        let tracker = tracker(5.0, 15, 20);
        let out = tracker.update(&[at(10, 10), at(200, 200), at(10, 12)]);

        assert_eq!(out.len(), 3);
        let ids: HashSet<_> = out.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(out[0].0, out[2].0);
        assert_ne!(out[0].0, out[1].0);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn well_separated_boxes_never_merge() {
        let tracker = tracker(30.0, 15, 20);
        let start = Instant::now();
        let mut seen = HashSet::new();
        for step in 0..10u32 {
            let now = start + Duration::from_millis(u64::from(step) * 100);
            let boxes = [at(50 + step, 50), at(150 + step, 50), at(250, 150 + step)];
            for (id, _) in tracker.update_at(&boxes, now) {
                seen.insert(id);
            }
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn distance_threshold_is_strict() {
        let tracker = tracker(10.0, 15, 20);
        let first = tracker.update(&[at(100, 100)]);
        let second = tracker.update(&[at(110, 100)]);
        assert_ne!(first[0].0, second[0].0);
    }

    #[test]
    fn picks_the_nearest_live_object() {
        let tracker = tracker(80.0, 15, 20);
        let seeded = tracker.update(&[at(100, 100), at(160, 100)]);
        let next = tracker.update(&[at(150, 100)]);
        assert_eq!(next[0].0, seeded[1].0);
    }

    #[test]
    fn lost_objects_are_retired_and_ids_never_reused() {
        let tracker = tracker(80.0, 2, 20);
        let t0 = Instant::now();
        let first = tracker.update_at(&[at(100, 100)], t0)[0].0;

        let t1 = t0 + Duration::from_secs(3);
        assert!(tracker.trajectory_at(first, Duration::from_secs(60), t1).is_empty());

        let again = tracker.update_at(&[at(100, 100)], t1);
        assert_ne!(again[0].0, first);
        assert!(again[0].0 > first);
        assert!(tracker.objects().iter().all(|o| o.id != first));
    }

    #[test]
    fn unmatched_objects_survive_until_max_lost() {
        let tracker = tracker(80.0, 15, 20);
        let t0 = Instant::now();
        let id = tracker.update_at(&[at(100, 100)], t0)[0].0;

        tracker.update_at(&[], t0 + Duration::from_secs(10));
        assert_eq!(tracker.len(), 1);
        tracker.update_at(&[], t0 + Duration::from_secs(16));
        assert!(tracker.is_empty());
        assert!(tracker.trajectory(id, Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn trajectory_keeps_only_recent_samples_oldest_first() {
        let tracker = tracker(80.0, 60, 100);
        let t0 = Instant::now();
        let mut id = None;
        for step in 0..6u32 {
            let now = t0 + Duration::from_secs(u64::from(step));
            id = Some(tracker.update_at(&[at(100 + step * 2, 100)], now)[0].0);
        }
        let id = id.unwrap();

        let now = t0 + Duration::from_secs(5);
        let recent = tracker.trajectory_at(id, Duration::from_secs(2), now);
        assert_eq!(recent, vec![(106, 100), (108, 100), (110, 100)]);
    }

    #[test]
    fn trajectory_capacity_evicts_oldest() {
        let tracker = tracker(80.0, 60, 4);
        let t0 = Instant::now();
        let mut id = None;
        for step in 0..10u32 {
            let now = t0 + Duration::from_millis(u64::from(step) * 10);
            id = Some(tracker.update_at(&[at(100 + step, 100)], now)[0].0);
        }
        let objects = tracker.objects();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].trajectory.len(), 4);

        let xs: Vec<i64> = tracker
            .trajectory_at(id.unwrap(), Duration::from_secs(60), t0 + Duration::from_millis(90))
            .into_iter()
            .map(|(x, _)| x)
            .collect();
        assert_eq!(xs, vec![106, 107, 108, 109]);
    }

    #[test]
    fn unknown_identity_has_no_trajectory() {
        let tracker = IdentityTracker::default();
        assert!(tracker.trajectory(TrackId(42), Duration::from_secs(3)).is_empty());
    }

    #[test]
    fn ids_render_as_eight_hex_digits() {
        let tracker = IdentityTracker::default();
        let id = tracker.update(&[at(50, 50)])[0].0;
        let text = id.to_string();
        assert_eq!(text.len(), 8);
        assert_eq!(text.parse::<TrackId>().unwrap(), id);
    }
}
