//! Scan adapters: the narrow capability each scan representation provides to
//! the classification pipeline.
//!
//! | Adapter | Points | Default mode | Output |
//! |---|---|---|---|
//! | [`LaserScan`] | projected from ranges with the interpolated sensor pose | per-point | same scan, masked rays set to NaN |
//! | [`PointCloud`] | already in the fixed frame | batch | OUTSIDE points only, or NaN-padded when organized |

use std::sync::Once;

use nalgebra::Point3;
use selffilter_perception::interpolate;
use selffilter_perception::transform::origin_of;
use selffilter_types::{FilterError, MaskValue, Stamp};
use tracing::info;

use crate::aggregator::BoundsReport;
use crate::config::FilterConfig;
use crate::orchestrator::{Acquisition, ScanPoints, SensorPoses};

// ────────────────────────────────────────────────────────────────────────────
// Capability
// ────────────────────────────────────────────────────────────────────────────

/// Acquisition time and sensor frame of a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanHeader {
    pub stamp: Stamp,
    pub frame_id: String,
}

impl ScanHeader {
    pub fn new(stamp: Stamp, frame_id: &str) -> Self {
        Self {
            stamp,
            frame_id: frame_id.to_string(),
        }
    }

    /// Sensor frame named by the header without a leading `/`, or `fallback`
    /// when the header names none.
    pub fn sensor_frame<'a>(&'a self, fallback: &'a str) -> &'a str {
        match self.frame_id.trim_start_matches('/') {
            "" => fallback,
            frame => frame,
        }
    }
}

/// What a scan representation must provide to be filtered.
pub trait ScanAdapter {
    type Output;

    fn header(&self) -> &ScanHeader;

    /// Mode used when the configuration does not force one.
    fn default_point_by_point(&self) -> bool;

    /// Acquisition window known from the scan metadata (seconds).  When
    /// positive the sensor pose is also resolved at the end of the window.
    fn sweep(&self) -> Option<f64> {
        None
    }

    /// Points in the fixed frame, with per-point timing in per-point mode.
    fn extract(&self, per_point: bool, sensor: &SensorPoses) -> Result<ScanPoints, FilterError>;

    /// Filtered output given the mask of the extracted points.
    fn apply_mask(self, points: &ScanPoints, mask: &[MaskValue], config: &FilterConfig)
    -> Self::Output;
}

/// Result of filtering one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome<O> {
    pub output: O,
    /// Classification of `points`, aligned 1:1.
    pub mask: Vec<MaskValue>,
    /// Classified points in the fixed frame.
    pub points: Vec<Point3<f64>>,
    pub bounds: BoundsReport,
    /// Registry generation the scan was classified against.
    pub generation: u64,
}

impl<O> FilterOutcome<O> {
    /// Points classified as `value`, for the INSIDE/CLIP/SHADOW debug clouds.
    pub fn points_with(&self, value: MaskValue) -> Vec<Point3<f64>> {
        self.points
            .iter()
            .zip(&self.mask)
            .filter(|(_, m)| **m == value)
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn points_outside_sphere(&self) -> Vec<Point3<f64>> {
        self.bounds.points_outside_sphere(&self.points)
    }

    pub fn points_outside_box(&self) -> Vec<Point3<f64>> {
        self.bounds.points_outside_box(&self.points)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// LaserScan
// ────────────────────────────────────────────────────────────────────────────

/// A planar rotating-laser scan in the sensor frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LaserScan {
    pub header: ScanHeader,
    pub angle_min: f32,
    pub angle_increment: f32,
    /// Time between consecutive rays (seconds).
    pub time_increment: f32,
    pub range_min: f32,
    pub range_max: f32,
    pub ranges: Vec<f32>,
}

impl LaserScan {
    fn valid(&self, range: f32) -> bool {
        range.is_finite() && range >= self.range_min && range <= self.range_max
    }
}

impl ScanAdapter for LaserScan {
    type Output = LaserScan;

    fn header(&self) -> &ScanHeader {
        &self.header
    }

    fn default_point_by_point(&self) -> bool {
        true
    }

    fn sweep(&self) -> Option<f64> {
        let sweep = f64::from(self.time_increment) * self.ranges.len() as f64;
        (sweep > 0.0).then_some(sweep)
    }

    fn extract(&self, per_point: bool, sensor: &SensorPoses) -> Result<ScanPoints, FilterError> {
        let sweep = self.sweep().unwrap_or(0.0);
        let mut points = Vec::with_capacity(self.ranges.len());
        let mut indices = Vec::with_capacity(self.ranges.len());
        let mut offsets = Vec::new();
        let mut viewpoints = Vec::new();

        for (i, &range) in self.ranges.iter().enumerate() {
            if !self.valid(range) {
                continue;
            }
            let angle = f64::from(self.angle_min) + i as f64 * f64::from(self.angle_increment);
            let offset = i as f64 * f64::from(self.time_increment);
            let pose = match sensor.end {
                Some(end) if sweep > 0.0 => interpolate(&sensor.start, &end, offset / sweep),
                _ => sensor.start,
            };
            let r = f64::from(range);
            points.push(pose * Point3::new(r * angle.cos(), r * angle.sin(), 0.0));
            indices.push(i);
            if per_point {
                offsets.push(offset);
                viewpoints.push(origin_of(&pose));
            }
        }

        let acquisition = if per_point {
            Acquisition::PerPoint {
                offsets,
                viewpoints,
            }
        } else {
            Acquisition::Batch
        };
        Ok(ScanPoints {
            stamp: self.header.stamp,
            points,
            indices,
            acquisition,
        })
    }

    fn apply_mask(
        mut self,
        points: &ScanPoints,
        mask: &[MaskValue],
        config: &FilterConfig,
    ) -> LaserScan {
        for (&index, value) in points.indices.iter().zip(mask) {
            if !value.is_outside() {
                if let Some(range) = self.ranges.get_mut(index) {
                    *range = f32::NAN;
                }
            }
        }
        self.range_min = self.range_min.max(config.min_distance as f32);
        if config.max_distance > 0.0 {
            self.range_max = self.range_max.min(config.max_distance as f32);
        }
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PointCloud
// ────────────────────────────────────────────────────────────────────────────

/// One point of a [`PointCloud`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloudPoint {
    pub position: [f32; 3],
    /// Capture offset from the cloud stamp (seconds).
    pub stamp: Option<f32>,
    /// Where the point was measured from.
    pub viewpoint: Option<[f32; 3]>,
}

impl CloudPoint {
    pub fn at(x: f32, y: f32, z: f32) -> Self {
        Self {
            position: [x, y, z],
            stamp: None,
            viewpoint: None,
        }
    }

    fn is_finite(&self) -> bool {
        self.position.iter().all(|c| c.is_finite())
    }
}

fn to_point(p: [f32; 3]) -> Point3<f64> {
    Point3::new(f64::from(p[0]), f64::from(p[1]), f64::from(p[2]))
}

/// A cloud of points expressed in the fixed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloud {
    pub header: ScanHeader,
    pub points: Vec<CloudPoint>,
}

/// Signs that a cloud's acquisition mode differs from the configured one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimingHint {
    /// Per-point mode, but holes suggest an organized, all-at-once capture.
    OrganizedInPerPoint,
    /// Batch mode, but points carry their own stamps.
    StampsInBatch,
    /// Batch mode, but a dense cloud is usually swept point by point.
    DenseInBatch,
}

static ORGANIZED_IN_PER_POINT_HINT: Once = Once::new();
static STAMPS_IN_BATCH_HINT: Once = Once::new();
static DENSE_IN_BATCH_HINT: Once = Once::new();

impl PointCloud {
    fn timing_hint(&self, per_point: bool) -> Option<TimingHint> {
        let dense = self.points.iter().all(CloudPoint::is_finite);
        if per_point {
            (!dense).then_some(TimingHint::OrganizedInPerPoint)
        } else if self.points.iter().any(|p| p.stamp.is_some()) {
            Some(TimingHint::StampsInBatch)
        } else if dense && !self.points.is_empty() {
            Some(TimingHint::DenseInBatch)
        } else {
            None
        }
    }
}

fn log_timing_hint(hint: TimingHint) {
    match hint {
        TimingHint::OrganizedInPerPoint => ORGANIZED_IN_PER_POINT_HINT.call_once(|| {
            info!("cloud looks organized, so it was probably captured at once; batch mode (point_by_point_scan = false) is cheaper");
        }),
        TimingHint::StampsInBatch => STAMPS_IN_BATCH_HINT.call_once(|| {
            info!("cloud carries per-point stamps but batch mode is configured; set point_by_point_scan to use them");
        }),
        TimingHint::DenseInBatch => DENSE_IN_BATCH_HINT.call_once(|| {
            info!("cloud is dense, which usually means a point-by-point sweep; set point_by_point_scan for more accurate results");
        }),
    }
}

impl ScanAdapter for PointCloud {
    type Output = PointCloud;

    fn header(&self) -> &ScanHeader {
        &self.header
    }

    fn default_point_by_point(&self) -> bool {
        false
    }

    fn extract(&self, per_point: bool, _sensor: &SensorPoses) -> Result<ScanPoints, FilterError> {
        if let Some(hint) = self.timing_hint(per_point) {
            log_timing_hint(hint);
        }

        let mut points = Vec::with_capacity(self.points.len());
        let mut indices = Vec::with_capacity(self.points.len());
        let mut offsets = Vec::new();
        let mut viewpoints = Vec::new();

        for (i, point) in self.points.iter().enumerate() {
            if !point.is_finite() {
                continue;
            }
            if per_point {
                offsets.push(f64::from(point.stamp.ok_or(FilterError::MissingField("stamps"))?));
                viewpoints.push(to_point(
                    point.viewpoint.ok_or(FilterError::MissingField("viewpoint"))?,
                ));
            }
            points.push(to_point(point.position));
            indices.push(i);
        }

        let acquisition = if per_point {
            Acquisition::PerPoint {
                offsets,
                viewpoints,
            }
        } else {
            Acquisition::Batch
        };
        Ok(ScanPoints {
            stamp: self.header.stamp,
            points,
            indices,
            acquisition,
        })
    }

    fn apply_mask(
        mut self,
        points: &ScanPoints,
        mask: &[MaskValue],
        config: &FilterConfig,
    ) -> PointCloud {
        let mut keep = vec![false; self.points.len()];
        for (&index, value) in points.indices.iter().zip(mask) {
            if let Some(k) = keep.get_mut(index) {
                *k = value.is_outside();
            }
        }

        if config.keep_clouds_organized {
            for (point, keep) in self.points.iter_mut().zip(&keep) {
                if !keep {
                    point.position = [f32::NAN; 3];
                }
            }
        } else {
            let mut keep = keep.into_iter();
            self.points.retain(|_| keep.next().unwrap_or(false));
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use nalgebra::Isometry3;
    use std::f32::consts::FRAC_PI_2;

    fn t0() -> Stamp {
        chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn still(z: f64) -> SensorPoses {
        SensorPoses {
            start: Isometry3::translation(0.0, 0.0, z),
            end: None,
        }
    }

    fn laser(ranges: Vec<f32>) -> LaserScan {
        LaserScan {
            header: ScanHeader::new(t0(), "/laser"),
            angle_min: 0.0,
            angle_increment: FRAC_PI_2,
            time_increment: 0.025,
            range_min: 0.1,
            range_max: 10.0,
            ranges,
        }
    }

    // ── Header ───────────────────────────────────────────────────────────────

    #[test]
    fn header_frame_strips_slash_and_falls_back() {
        assert_eq!(ScanHeader::new(t0(), "/laser").sensor_frame("x"), "laser");
        assert_eq!(ScanHeader::new(t0(), "lidar").sensor_frame("x"), "lidar");
        assert_eq!(ScanHeader::new(t0(), "").sensor_frame("laser"), "laser");
    }

    // ── LaserScan ────────────────────────────────────────────────────────────

    #[test]
    fn laser_projects_valid_rays_only() {
        let scan = laser(vec![1.0, f32::NAN, 2.0, 0.05]);
        assert_relative_eq!(scan.sweep().unwrap(), 0.1, epsilon = 1e-6);

        let points = scan.extract(false, &still(0.5)).unwrap();
        assert_eq!(points.indices, vec![0, 2]);
        assert_eq!(points.acquisition, Acquisition::Batch);
        assert_relative_eq!(points.points[0], Point3::new(1.0, 0.0, 0.5), epsilon = 1e-6);
        assert_relative_eq!(points.points[1], Point3::new(-2.0, 0.0, 0.5), epsilon = 1e-6);
    }

    #[test]
    fn laser_per_point_interpolates_sensor_pose() {
        let scan = laser(vec![1.0, 1.0, 1.0, 1.0]);
        let sensor = SensorPoses {
            start: Isometry3::translation(0.0, 0.0, 0.0),
            end: Some(Isometry3::translation(0.0, 0.0, 1.0)),
        };
        let points = scan.extract(true, &sensor).unwrap();
        let Acquisition::PerPoint {
            offsets,
            viewpoints,
        } = &points.acquisition
        else {
            panic!("expected per-point acquisition");
        };
        assert_relative_eq!(offsets[2], 0.05, epsilon = 1e-6);
        assert_relative_eq!(viewpoints[2].z, 0.5, epsilon = 1e-6);
        assert_relative_eq!(points.points[2].z, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn laser_mask_sets_nan_and_tightens_limits() {
        let scan = laser(vec![1.0, f32::NAN, 2.0]);
        let points = scan.extract(false, &still(0.0)).unwrap();
        let config = FilterConfig {
            min_distance: 0.3,
            max_distance: 5.0,
            ..FilterConfig::default()
        };
        let out = scan.apply_mask(&points, &[MaskValue::Inside, MaskValue::Outside], &config);
        assert!(out.ranges[0].is_nan());
        assert!(out.ranges[1].is_nan());
        assert_eq!(out.ranges[2], 2.0);
        assert_relative_eq!(out.range_min, 0.3);
        assert_relative_eq!(out.range_max, 5.0);
    }

    #[test]
    fn laser_without_max_distance_keeps_range_max() {
        let scan = laser(vec![1.0]);
        let points = scan.extract(false, &still(0.0)).unwrap();
        let out = scan.apply_mask(&points, &[MaskValue::Outside], &FilterConfig::default());
        assert_eq!(out.range_max, 10.0);
        assert_eq!(out.range_min, 0.1);
    }

    // ── PointCloud ───────────────────────────────────────────────────────────

    fn cloud(points: Vec<CloudPoint>) -> PointCloud {
        PointCloud {
            header: ScanHeader::new(t0(), "camera"),
            points,
        }
    }

    #[test]
    fn cloud_per_point_requires_stamps_and_viewpoints() {
        let c = cloud(vec![CloudPoint::at(1.0, 0.0, 0.0)]);
        assert_eq!(
            c.extract(true, &still(0.0)).unwrap_err(),
            FilterError::MissingField("stamps")
        );

        let c = cloud(vec![CloudPoint {
            stamp: Some(0.01),
            ..CloudPoint::at(1.0, 0.0, 0.0)
        }]);
        assert_eq!(
            c.extract(true, &still(0.0)).unwrap_err(),
            FilterError::MissingField("viewpoint")
        );
    }

    #[test]
    fn cloud_per_point_carries_timing() {
        let c = cloud(vec![
            CloudPoint {
                position: [1.0, 0.0, 0.0],
                stamp: Some(0.02),
                viewpoint: Some([0.0, 0.0, 1.0]),
            },
            CloudPoint::at(f32::NAN, 0.0, 0.0),
        ]);
        let points = c.extract(true, &still(0.0)).unwrap();
        assert_eq!(points.indices, vec![0]);
        assert_relative_eq!(points.duration(), 0.02, epsilon = 1e-6);
    }

    #[test]
    fn organized_cloud_keeps_layout() {
        let c = cloud(vec![
            CloudPoint::at(1.0, 0.0, 0.0),
            CloudPoint::at(2.0, 0.0, 0.0),
            CloudPoint::at(3.0, 0.0, 0.0),
        ]);
        let points = c.extract(false, &still(0.0)).unwrap();
        let out = c.apply_mask(
            &points,
            &[MaskValue::Outside, MaskValue::Shadow, MaskValue::Outside],
            &FilterConfig::default(),
        );
        assert_eq!(out.points.len(), 3);
        assert!(out.points[1].position[0].is_nan());
        assert_eq!(out.points[2].position, [3.0, 0.0, 0.0]);
    }

    #[test]
    fn unorganized_cloud_drops_masked_points() {
        let c = cloud(vec![
            CloudPoint::at(1.0, 0.0, 0.0),
            CloudPoint::at(f32::NAN, 0.0, 0.0),
            CloudPoint::at(3.0, 0.0, 0.0),
        ]);
        let points = c.extract(false, &still(0.0)).unwrap();
        let config = FilterConfig {
            keep_clouds_organized: false,
            ..FilterConfig::default()
        };
        let out = c.apply_mask(&points, &[MaskValue::Clip, MaskValue::Outside], &config);
        assert_eq!(out.points, vec![CloudPoint::at(3.0, 0.0, 0.0)]);
    }

    #[test]
    fn timing_hints_follow_cloud_layout() {
        let stamped = CloudPoint {
            position: [1.0, 0.0, 0.0],
            stamp: Some(0.01),
            viewpoint: Some([0.0, 0.0, 0.0]),
        };
        let hole = CloudPoint::at(f32::NAN, 0.0, 0.0);

        let organized = cloud(vec![stamped, hole]);
        assert_eq!(organized.timing_hint(true), Some(TimingHint::OrganizedInPerPoint));
        assert_eq!(cloud(vec![stamped]).timing_hint(true), None);

        assert_eq!(organized.timing_hint(false), Some(TimingHint::StampsInBatch));
        assert_eq!(
            cloud(vec![CloudPoint::at(1.0, 0.0, 0.0)]).timing_hint(false),
            Some(TimingHint::DenseInBatch)
        );
        assert_eq!(cloud(vec![CloudPoint::at(1.0, 0.0, 0.0), hole]).timing_hint(false), None);
        assert_eq!(cloud(vec![]).timing_hint(false), None);

        // Hints never change what is extracted.
        let points = organized.extract(true, &still(0.0)).unwrap();
        assert_eq!(points.indices, vec![0]);
    }

    // ── Outcome ──────────────────────────────────────────────────────────────

    #[test]
    fn outcome_debug_partitions() {
        let outcome = FilterOutcome {
            output: (),
            mask: vec![MaskValue::Inside, MaskValue::Outside, MaskValue::Shadow, MaskValue::Inside],
            points: vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(2.0, 0.0, 0.0),
                Point3::new(3.0, 0.0, 0.0),
            ],
            bounds: BoundsReport::default(),
            generation: 1,
        };
        assert_eq!(
            outcome.points_with(MaskValue::Inside),
            vec![Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 0.0, 0.0)]
        );
        assert_eq!(outcome.points_with(MaskValue::Clip), vec![]);
        assert_eq!(outcome.points_outside_sphere().len(), 4);
    }
}
