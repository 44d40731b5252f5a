//! Placeholder detection backend.
//!
//! Stands in for a real detector: classes, boxes and attributes are drawn
//! from fixed, class-dependent ranges.

use crate::config::{clamp_rate, DetectionConfig};
use crate::detection::{DetectionBackend, RawDetection};
use crate::models::{AnalyticsJob, Metadata};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use uuid::Uuid;
use vigil_pipeline::BoundingBox;

const CONFIDENCE_RANGE: (f64, f64) = (0.7, 0.99);

pub struct SimulatedBackend {
    object_classes: Vec<String>,
    rate: f64,
    rng: StdRng,
}

impl SimulatedBackend {
    pub fn new(config: &DetectionConfig) -> Self {
        // Offset the seed so identity resolution and generation draw from
        // independent streams.
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        Self {
            object_classes: config.object_classes.clone(),
            rate: config.clamped_rate(),
            rng,
        }
    }

    /// Upper bound of the per-cycle draw
    pub fn max_per_cycle(&self) -> usize {
        (self.rate * 2.0).floor() as usize
    }

    fn bounding_box(&mut self, object_class: &str) -> BoundingBox {
        let rng = &mut self.rng;
        match object_class {
            "person" => BoundingBox::new(
                rng.gen_range(0.1..0.8),
                rng.gen_range(0.3..0.7),
                rng.gen_range(0.05..0.15),
                rng.gen_range(0.15..0.35),
            ),
            "car" | "truck" | "bus" => BoundingBox::new(
                rng.gen_range(0.05..0.7),
                rng.gen_range(0.4..0.8),
                rng.gen_range(0.15..0.4),
                rng.gen_range(0.1..0.25),
            ),
            _ => BoundingBox::new(
                rng.gen_range(0.1..0.8),
                rng.gen_range(0.4..0.8),
                rng.gen_range(0.08..0.2),
                rng.gen_range(0.1..0.2),
            ),
        }
    }

    fn attributes(&mut self, object_class: &str) -> Metadata {
        let mut metadata = Metadata::new();
        match object_class {
            "car" | "truck" | "bus" | "motorcycle" => {
                let speed: f64 = self.rng.gen_range(0.0..60.0);
                metadata.insert("speed".to_string(), speed.into());
                metadata.insert("direction".to_string(), self.choice(&["north", "south", "east", "west"]));
                metadata.insert(
                    "color".to_string(),
                    self.choice(&["red", "blue", "green", "white", "black", "silver"]),
                );
            }
            "person" => {
                metadata.insert("posture".to_string(), self.choice(&["standing", "walking", "running"]));
                metadata.insert("bag".to_string(), self.choice(&["none", "backpack", "handbag", "briefcase"]));
            }
            _ => {}
        }
        metadata
    }

    fn choice(&mut self, options: &[&str]) -> serde_json::Value {
        options
            .choose(&mut self.rng)
            .map(|s| serde_json::Value::from(*s))
            .unwrap_or(serde_json::Value::Null)
    }
}

impl DetectionBackend for SimulatedBackend {
    fn detect(&mut self, camera_id: &str, _job: &AnalyticsJob, limit: usize) -> Vec<RawDetection> {
        if self.object_classes.is_empty() {
            return Vec::new();
        }

        let count = self.rng.gen_range(0..=self.max_per_cycle()).min(limit);
        let mut detections = Vec::with_capacity(count);
        for _ in 0..count {
            let class_index = self.rng.gen_range(0..self.object_classes.len());
            let object_class = self.object_classes[class_index].clone();
            let bbox = self.bounding_box(&object_class);
            let confidence = self.rng.gen_range(CONFIDENCE_RANGE.0..CONFIDENCE_RANGE.1);
            let metadata = self.attributes(&object_class);
            let snapshot = &Uuid::new_v4().simple().to_string()[..8];
            detections.push(RawDetection {
                object_class,
                confidence,
                bbox,
                object_id: None,
                snapshot_path: Some(format!("/snapshots/{camera_id}/{snapshot}.jpg")),
                metadata,
            });
        }
        detections
    }

    fn set_rate(&mut self, rate: f64) {
        self.rate = clamp_rate(rate);
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> AnalyticsJob {
        AnalyticsJob {
            id: "job-1".to_string(),
            camera_id: "cam-1".to_string(),
            name: "Street".to_string(),
            is_active: true,
            confidence_threshold: 0.0,
            max_detections: 100,
            zones: Vec::new(),
        }
    }

    fn backend(rate: f64) -> SimulatedBackend {
        SimulatedBackend::new(&DetectionConfig {
            detection_rate: rate,
            seed: Some(11),
            ..Default::default()
        })
    }

    #[test]
    fn test_count_bounded_by_rate_and_limit() {
        let mut sim = backend(2.0);
        assert_eq!(sim.max_per_cycle(), 4);
        for _ in 0..50 {
            assert!(sim.detect("cam-1", &job(), 100).len() <= 4);
            assert!(sim.detect("cam-1", &job(), 1).len() <= 1);
        }
    }

    #[test]
    fn test_generated_values_are_plausible() {
        let mut sim = backend(5.0);
        let detections: Vec<RawDetection> = (0..20).flat_map(|_| sim.detect("cam-7", &job(), 100)).collect();
        assert!(!detections.is_empty());

        for d in detections {
            assert!((0.7..0.99).contains(&d.confidence));
            assert!(d.bbox.x >= 0.0 && d.bbox.x + d.bbox.width <= 1.2);
            assert!(d.object_id.is_none());
            let snapshot = d.snapshot_path.unwrap();
            assert!(snapshot.starts_with("/snapshots/cam-7/") && snapshot.ends_with(".jpg"));
            if d.object_class == "person" {
                assert!(d.metadata.contains_key("posture"));
            }
        }
    }

    #[test]
    fn test_rate_is_clamped() {
        let mut sim = backend(0.5);
        sim.set_rate(100.0);
        assert_eq!(sim.max_per_cycle(), 10);
        sim.set_rate(0.0);
        assert_eq!(sim.max_per_cycle(), 0);
    }

    #[test]
    fn test_same_seed_same_output() {
        let mut a = backend(3.0);
        let mut b = backend(3.0);
        let classes = |sim: &mut SimulatedBackend| -> Vec<String> {
            (0..10)
                .flat_map(|_| sim.detect("cam-1", &job(), 100))
                .map(|d| d.object_class)
                .collect()
        };
        assert_eq!(classes(&mut a), classes(&mut b));
    }
}
