//! Rigid transforms and their interpolation over an acquisition window.
//!
//! A sweeping sensor integrates its measurements over a nonzero time
//! interval, during which the robot keeps moving.  [`interpolate`] blends the
//! pose captured at scan start with the pose captured at scan end so each
//! point can be checked against the body where it was when that point was
//! measured.
//!
//! # Example
//!
//! ```rust
//! use nalgebra::{Isometry3, Vector3};
//! use selffilter_perception::transform::interpolate;
//!
//! let start = Isometry3::translation(0.0, 0.0, 0.0);
//! let end = Isometry3::translation(1.0, 0.0, 0.0);
//!
//! let mid = interpolate(&start, &end, 0.5);
//! assert!((mid.translation.vector - Vector3::new(0.5, 0.0, 0.0)).norm() < 1e-9);
//! ```

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion};

/// Angular threshold below which slerp degenerates and a normalised lerp is
/// used instead.
const SLERP_EPSILON: f64 = 1e-9;

/// Pose at fraction `ratio` of the way from `start` to `end`.
///
/// Translation is blended linearly as `start·(1−r) + end·r`; rotation
/// follows the shorter great arc between the two orientations.  `ratio` is
/// clamped to `[0, 1]`, so `0` returns `start` and `1` returns `end`.
pub fn interpolate(start: &Isometry3<f64>, end: &Isometry3<f64>, ratio: f64) -> Isometry3<f64> {
    let r = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };

    let translation = start.translation.vector * (1.0 - r) + end.translation.vector * r;
    let rotation = slerp(&start.rotation, &end.rotation, r);

    Isometry3::from_parts(Translation3::from(translation), rotation)
}

/// Spherical interpolation that never panics on (near-)identical inputs.
fn slerp(start: &UnitQuaternion<f64>, end: &UnitQuaternion<f64>, t: f64) -> UnitQuaternion<f64> {
    start
        .try_slerp(end, t, SLERP_EPSILON)
        .unwrap_or_else(|| start.nlerp(end, t))
}

/// Sensor origin expressed in the frame of `pose`.
pub fn origin_of(pose: &Isometry3<f64>) -> Point3<f64> {
    Point3::from(pose.translation.vector)
}
