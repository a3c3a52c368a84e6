//! Classification orchestration: one pipeline for batch and per-point scans.
//!
//! [`ModelState`] bundles everything the model lock protects (registry, pose
//! cache and classifier) so a scan is classified against exactly one
//! registry generation.

use std::time::{Duration, Instant};

use nalgebra::{Isometry3, Point3};
use selffilter_perception::{LookupTime, PoseSource};
use selffilter_types::{Clock, FilterError, MaskValue, Stamp, offset_stamp};
use tracing::{debug, error};

use crate::classifier::GeometryClassifier;
use crate::pose_cache::{PoseCache, PoseView};
use crate::registry::ShapeRegistry;
use crate::watchdog::{LinkPoseResolver, remaining_time};

/// How the points of a scan were acquired.
#[derive(Debug, Clone, PartialEq)]
pub enum Acquisition {
    /// Every point shares the scan stamp and the sensor origin.
    Batch,
    /// Each point carries its capture offset from the scan stamp (seconds)
    /// and the viewpoint it was measured from.
    PerPoint {
        offsets: Vec<f64>,
        viewpoints: Vec<Point3<f64>>,
    },
}

/// Points of one scan, expressed in the fixed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPoints {
    pub stamp: Stamp,
    pub points: Vec<Point3<f64>>,
    /// Index of each point in the adapter's own layout.
    pub indices: Vec<usize>,
    pub acquisition: Acquisition,
}

impl ScanPoints {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Acquisition window: the largest per-point offset, zero for batch scans.
    pub fn duration(&self) -> f64 {
        match &self.acquisition {
            Acquisition::Batch => 0.0,
            Acquisition::PerPoint { offsets, .. } => offsets
                .iter()
                .copied()
                .filter(|o| o.is_finite())
                .fold(0.0, f64::max),
        }
    }
}

/// Sensor pose in the fixed frame at scan start and, when the scan has an
/// acquisition window, at scan end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorPoses {
    pub start: Isometry3<f64>,
    pub end: Option<Isometry3<f64>>,
}

/// Resolve the sensor frame at `stamp` (and at `stamp + sweep` when the sweep
/// is positive).  Failing to do so aborts the scan.
pub fn resolve_sensor(
    source: &dyn PoseSource,
    clock: &dyn Clock,
    fixed: &str,
    sensor: &str,
    stamp: Stamp,
    sweep: Option<f64>,
    timeout: Duration,
) -> Result<SensorPoses, FilterError> {
    let lookup = |at: Stamp| {
        let budget = remaining_time(at, timeout, clock.now());
        source
            .lookup(fixed, sensor, LookupTime::At(at), budget)
            .map_err(|e| {
                error!(fixed, sensor, stamp = %at, error = %e, "cannot resolve sensor frame");
                FilterError::SensorTransform {
                    fixed: fixed.to_string(),
                    sensor: sensor.to_string(),
                    stamp: at,
                }
            })
    };

    let start = lookup(stamp)?;
    let end = match sweep {
        Some(s) if s > 0.0 => Some(lookup(offset_stamp(stamp, s))?),
        _ => None,
    };
    Ok(SensorPoses { start, end })
}

/// Everything guarded by the model lock.
pub struct ModelState {
    pub registry: ShapeRegistry,
    pub cache: PoseCache,
    pub classifier: Box<dyn GeometryClassifier>,
}

impl ModelState {
    /// Empty registry and cache around `classifier`.
    pub fn new(classifier: Box<dyn GeometryClassifier>) -> Self {
        Self {
            registry: ShapeRegistry::new(),
            cache: PoseCache::new(),
            classifier,
        }
    }

    /// Classify every point of `scan`.  The result is aligned with
    /// `scan.points`.
    pub fn classify(
        &mut self,
        resolver: &dyn LinkPoseResolver,
        scan: &ScanPoints,
        sensor_origin: &Point3<f64>,
    ) -> Vec<MaskValue> {
        let started = Instant::now();
        let mask = match &scan.acquisition {
            Acquisition::Batch => {
                self.cache.refresh(&self.registry, resolver, scan.stamp, None);
                let view = PoseView {
                    registry: &self.registry,
                    cache: &self.cache,
                    ratio: 0.0,
                };
                self.classifier.mask_cloud(&view, &scan.points, sensor_origin)
            }
            Acquisition::PerPoint {
                offsets,
                viewpoints,
            } => {
                let duration = scan.duration();
                let end = offset_stamp(scan.stamp, duration);
                self.cache
                    .refresh(&self.registry, resolver, scan.stamp, Some(end));

                scan.points
                    .iter()
                    .zip(offsets)
                    .zip(viewpoints)
                    .map(|((point, offset), viewpoint)| {
                        let view = PoseView {
                            registry: &self.registry,
                            cache: &self.cache,
                            ratio: point_ratio(*offset, duration),
                        };
                        self.classifier.mask_point(&view, point, viewpoint)
                    })
                    .collect()
            }
        };
        debug!(
            points = scan.len(),
            generation = self.registry.generation(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "scan classified"
        );
        mask
    }
}

/// Fraction of the acquisition window elapsed at `offset`.
pub fn point_ratio(offset: f64, duration: f64) -> f64 {
    if duration > 0.0 && offset.is_finite() {
        (offset / duration).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Inflation;
    use crate::ignore::IgnoreRules;
    use crate::sim::SimClassifier;
    use chrono::TimeZone;
    use selffilter_perception::PoseBuffer;
    use selffilter_types::{Collision, Geometry, Link, ManualClock, Origin, RobotModel};

    fn t0() -> Stamp {
        chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    /// `arm` sits at x=2 at scan start and x=3 at scan end; `base` at the
    /// origin; `leg` never resolves.
    struct MovingArm;

    impl LinkPoseResolver for MovingArm {
        fn resolve(&self, link: &str, at: Stamp) -> Option<Isometry3<f64>> {
            match link {
                "base" => Some(Isometry3::translation(0.0, 3.0, 0.0)),
                "arm" if at == t0() => Some(Isometry3::translation(2.0, 0.0, 0.0)),
                "arm" => Some(Isometry3::translation(3.0, 0.0, 0.0)),
                _ => None,
            }
        }
    }

    /// Every link unresolved except `base`.
    struct ArmMissing;

    impl LinkPoseResolver for ArmMissing {
        fn resolve(&self, link: &str, _at: Stamp) -> Option<Isometry3<f64>> {
            (link == "base").then(|| Isometry3::translation(0.0, 3.0, 0.0))
        }
    }

    fn state() -> ModelState {
        let sphere = |name: &str| Collision {
            name: name.into(),
            origin: Origin::default(),
            geometry: Some(Geometry::Sphere { radius: 0.3 }),
        };
        let model = RobotModel {
            name: "rover".into(),
            links: vec![
                Link {
                    name: "base".into(),
                    collisions: vec![sphere("hull")],
                },
                Link {
                    name: "arm".into(),
                    collisions: vec![sphere("grip")],
                },
            ],
        };
        let mut state = ModelState::new(Box::new(SimClassifier::new()));
        let rules = IgnoreRules::default();
        state
            .registry
            .rebuild(&model, &rules, Inflation::default(), state.classifier.as_mut())
            .unwrap();
        state
    }

    fn batch(points: Vec<Point3<f64>>) -> ScanPoints {
        ScanPoints {
            stamp: t0(),
            indices: (0..points.len()).collect(),
            points,
            acquisition: Acquisition::Batch,
        }
    }

    #[test]
    fn ratio_of_offset() {
        assert_eq!(point_ratio(0.05, 0.1), 0.5);
        assert_eq!(point_ratio(0.05, 0.0), 0.0);
        assert_eq!(point_ratio(f64::NAN, 0.1), 0.0);
        assert_eq!(point_ratio(0.2, 0.1), 1.0);
    }

    #[test]
    fn duration_is_largest_offset() {
        let scan = ScanPoints {
            stamp: t0(),
            points: vec![Point3::origin(); 3],
            indices: vec![0, 1, 2],
            acquisition: Acquisition::PerPoint {
                offsets: vec![0.02, 0.1, f64::NAN],
                viewpoints: vec![Point3::origin(); 3],
            },
        };
        assert_eq!(scan.duration(), 0.1);
        assert_eq!(batch(vec![]).duration(), 0.0);
    }

    #[test]
    fn batch_scan_uses_start_poses() {
        let mut state = state();
        let scan = batch(vec![
            Point3::new(2.0, 0.0, 0.0),
            Point3::new(3.0, 0.0, 0.0),
            Point3::new(0.0, 3.1, 0.0),
            Point3::new(-2.0, 0.0, 0.0),
        ]);
        let mask = state.classify(&MovingArm, &scan, &Point3::origin());
        assert_eq!(
            mask,
            vec![
                MaskValue::Inside,
                MaskValue::Shadow,
                MaskValue::Inside,
                MaskValue::Outside
            ]
        );
    }

    #[test]
    fn per_point_scan_follows_the_moving_arm() {
        let mut state = state();
        let scan = ScanPoints {
            stamp: t0(),
            points: vec![Point3::new(2.0, 0.0, 0.0), Point3::new(3.0, 0.0, 0.0)],
            indices: vec![0, 1],
            acquisition: Acquisition::PerPoint {
                offsets: vec![0.0, 0.1],
                viewpoints: vec![Point3::new(2.5, -2.0, 0.0); 2],
            },
        };
        let mask = state.classify(&MovingArm, &scan, &Point3::origin());
        assert_eq!(mask, vec![MaskValue::Inside, MaskValue::Inside]);
        assert!(state.cache.is_per_point());
    }

    #[test]
    fn unresolved_arm_only_drops_the_arm() {
        let mut state = state();
        let scan = batch(vec![Point3::new(2.0, 0.0, 0.0), Point3::new(0.0, 3.0, 0.0)]);
        let mask = state.classify(&ArmMissing, &scan, &Point3::new(0.0, -1.0, 0.0));
        assert_eq!(mask, vec![MaskValue::Outside, MaskValue::Inside]);

        let spheres = state.classifier.bounding_spheres();
        assert_eq!(spheres.len(), 1);
        let base = state
            .registry
            .entries()
            .find(|e| e.link == "base")
            .unwrap()
            .handle;
        assert_eq!(spheres[0].0, base);
    }

    #[test]
    fn sensor_resolution_failure_is_scan_fatal() {
        let buffer = PoseBuffer::new(Duration::from_secs(10));
        let clock = ManualClock::new(t0());
        let err = resolve_sensor(&buffer, &clock, "base", "laser", t0(), None, Duration::ZERO)
            .unwrap_err();
        assert_eq!(
            err,
            FilterError::SensorTransform {
                fixed: "base".into(),
                sensor: "laser".into(),
                stamp: t0(),
            }
        );
    }

    #[test]
    fn sensor_end_pose_only_for_positive_sweep() {
        let buffer = PoseBuffer::new(Duration::from_secs(10));
        buffer.set_static_transform("base", "laser", Isometry3::translation(0.0, 0.0, 1.0));
        let clock = ManualClock::new(t0());

        let poses = resolve_sensor(&buffer, &clock, "base", "laser", t0(), None, Duration::ZERO)
            .unwrap();
        assert!(poses.end.is_none());
        assert_eq!(poses.start.translation.vector.z, 1.0);

        let poses =
            resolve_sensor(&buffer, &clock, "base", "laser", t0(), Some(0.1), Duration::ZERO)
                .unwrap();
        assert!(poses.end.is_some());
    }
}
