//! Per-camera object tracks.
//!
//! A track lives until it has not been observed for the reuse window. Only
//! live tracks of the same class may absorb a new detection.

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectTrack {
    pub object_id: String,
    pub object_class: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Zones the object was inside at its last observation
    pub zones: HashSet<String>,
}

/// How a detection was attributed to a track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub object_id: String,
    /// True when a new track was started, which is what object counts follow
    pub is_new: bool,
}

pub struct TrackRegistry {
    tracks: HashMap<String, ObjectTrack>,
    reuse_window: Duration,
}

impl TrackRegistry {
    pub fn new(reuse_window: Duration) -> Self {
        Self {
            tracks: HashMap::new(),
            reuse_window,
        }
    }

    fn is_live(&self, track: &ObjectTrack, now: DateTime<Utc>) -> bool {
        now - track.last_seen < self.reuse_window
    }

    /// Live tracks of a class, ordered by id so seeded runs are repeatable
    pub fn candidates(&self, object_class: &str, now: DateTime<Utc>) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .tracks
            .values()
            .filter(|t| t.object_class == object_class && self.is_live(t, now))
            .map(|t| t.object_id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Attribute a detection without an upstream id: with probability
    /// `reuse_probability` continue a live track of the same class, otherwise
    /// start a new one.
    pub fn resolve<R: Rng + ?Sized>(
        &mut self,
        object_class: &str,
        now: DateTime<Utc>,
        reuse_probability: f64,
        rng: &mut R,
    ) -> Resolution {
        if rng.gen_bool(reuse_probability.clamp(0.0, 1.0)) {
            let reused = self
                .candidates(object_class, now)
                .choose(rng)
                .map(|id| id.to_string());
            if let Some(object_id) = reused {
                self.touch(&object_id, now);
                return Resolution {
                    object_id,
                    is_new: false,
                };
            }
        }

        let object_id = format!("{}_{}", object_class, &Uuid::new_v4().simple().to_string()[..8]);
        self.insert(&object_id, object_class, now);
        Resolution {
            object_id,
            is_new: true,
        }
    }

    /// Attribute a detection that already carries a tracker id. An expired
    /// track with the same id counts as a new object.
    pub fn observe(&mut self, object_id: &str, object_class: &str, now: DateTime<Utc>) -> Resolution {
        let live = self
            .tracks
            .get(object_id)
            .map(|t| self.is_live(t, now))
            .unwrap_or(false);

        if live {
            self.touch(object_id, now);
        } else {
            self.insert(object_id, object_class, now);
        }
        Resolution {
            object_id: object_id.to_string(),
            is_new: !live,
        }
    }

    fn insert(&mut self, object_id: &str, object_class: &str, now: DateTime<Utc>) {
        self.tracks.insert(
            object_id.to_string(),
            ObjectTrack {
                object_id: object_id.to_string(),
                object_class: object_class.to_string(),
                first_seen: now,
                last_seen: now,
                zones: HashSet::new(),
            },
        );
    }

    fn touch(&mut self, object_id: &str, now: DateTime<Utc>) {
        if let Some(track) = self.tracks.get_mut(object_id) {
            track.last_seen = now;
        }
    }

    pub fn get(&self, object_id: &str) -> Option<&ObjectTrack> {
        self.tracks.get(object_id)
    }

    pub fn get_mut(&mut self, object_id: &str) -> Option<&mut ObjectTrack> {
        self.tracks.get_mut(object_id)
    }

    /// Drop expired tracks, returning how many were removed
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.tracks.len();
        let window = self.reuse_window;
        self.tracks.retain(|_, t| now - t.last_seen < window);
        before - self.tracks.len()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn registry() -> TrackRegistry {
        TrackRegistry::new(Duration::seconds(30))
    }

    #[test]
    fn test_zero_reuse_probability_always_mints() {
        let mut tracks = registry();
        let mut rng = StdRng::seed_from_u64(7);
        let now = Utc::now();

        let ids: HashSet<String> = (0..20)
            .map(|_| tracks.resolve("person", now, 0.0, &mut rng))
            .inspect(|r| assert!(r.is_new))
            .map(|r| r.object_id)
            .collect();
        assert_eq!(ids.len(), 20);
        assert!(ids.iter().all(|id| id.starts_with("person_") && id.len() == 15));
    }

    #[test]
    fn test_full_reuse_probability_reuses_live_track() {
        let mut tracks = registry();
        let mut rng = StdRng::seed_from_u64(7);
        let now = Utc::now();

        let first = tracks.resolve("car", now, 1.0, &mut rng);
        assert!(first.is_new, "nothing to reuse yet");

        let second = tracks.resolve("car", now + Duration::seconds(5), 1.0, &mut rng);
        assert_eq!(second.object_id, first.object_id);
        assert!(!second.is_new);
    }

    #[test]
    fn test_reuse_ignores_other_classes() {
        let mut tracks = registry();
        let mut rng = StdRng::seed_from_u64(1);
        let now = Utc::now();

        tracks.resolve("car", now, 0.0, &mut rng);
        let truck = tracks.resolve("truck", now, 1.0, &mut rng);
        assert!(truck.is_new);
        assert!(truck.object_id.starts_with("truck_"));
    }

    #[test]
    fn test_expired_track_is_not_reused() {
        let mut tracks = registry();
        let mut rng = StdRng::seed_from_u64(3);
        let start = Utc::now();

        let first = tracks.resolve("bus", start, 0.0, &mut rng);
        let later = start + Duration::seconds(30);
        assert!(tracks.candidates("bus", later).is_empty());

        let second = tracks.resolve("bus", later, 1.0, &mut rng);
        assert_ne!(second.object_id, first.object_id);
        assert!(second.is_new);
    }

    #[test]
    fn test_observe_counts_first_sighting_only() {
        let mut tracks = registry();
        let now = Utc::now();

        assert!(tracks.observe("trk-1", "person", now).is_new);
        assert!(!tracks.observe("trk-1", "person", now + Duration::seconds(10)).is_new);
        assert!(tracks.observe("trk-1", "person", now + Duration::seconds(45)).is_new);
    }

    #[test]
    fn test_prune_removes_expired() {
        let mut tracks = registry();
        let now = Utc::now();
        tracks.observe("a", "person", now);
        tracks.observe("b", "person", now + Duration::seconds(20));

        assert_eq!(tracks.prune(now + Duration::seconds(31)), 1);
        assert!(tracks.get("a").is_none());
        assert!(tracks.get("b").is_some());
    }
}
