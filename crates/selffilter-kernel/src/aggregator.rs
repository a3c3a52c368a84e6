//! Whole-robot bounding volumes from per-shape bounds.

use nalgebra::Point3;
use selffilter_perception::{Aabb, BoundingSphere, merge_boxes, merge_spheres};
use selffilter_types::CacheKey;
use tracing::error;

use crate::classifier::GeometryClassifier;
use crate::config::FilterConfig;
use crate::registry::ShapeRegistry;

/// Which bounds to produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundsRequest {
    pub sphere: bool,
    pub aabb: bool,
    pub debug_spheres: bool,
    pub debug_boxes: bool,
}

impl BoundsRequest {
    pub fn from_config(config: &FilterConfig) -> Self {
        Self {
            sphere: config.compute_bounding_sphere,
            aabb: config.compute_bounding_box,
            debug_spheres: config.compute_debug_bounding_sphere,
            debug_boxes: config.compute_debug_bounding_box,
        }
    }

    /// True when at least one bound has to be computed.
    pub fn any(&self) -> bool {
        self.sphere || self.aabb || self.debug_spheres || self.debug_boxes
    }
}

/// Bounds computed for one scan, in the fixed frame.  Fields not requested
/// stay empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundsReport {
    /// Merged sphere over shapes not ignored for the bounding sphere.
    pub sphere: Option<BoundingSphere>,
    /// Merged box over shapes not ignored for the bounding box.
    pub aabb: Option<Aabb>,
    /// Every posed shape's sphere, ignores notwithstanding.
    pub debug_spheres: Vec<(CacheKey, BoundingSphere)>,
    /// Every posed shape's box, ignores notwithstanding.
    pub debug_boxes: Vec<(CacheKey, Aabb)>,
}

impl BoundsReport {
    /// Points lying outside the merged sphere.  Everything when there is no
    /// sphere.
    pub fn points_outside_sphere(&self, points: &[Point3<f64>]) -> Vec<Point3<f64>> {
        points
            .iter()
            .filter(|p| self.sphere.is_none_or(|s| !s.contains_point(p)))
            .copied()
            .collect()
    }

    pub fn points_outside_box(&self, points: &[Point3<f64>]) -> Vec<Point3<f64>> {
        points
            .iter()
            .filter(|p| self.aabb.is_none_or(|b| !b.contains_point(p)))
            .copied()
            .collect()
    }
}

/// Collect the bounds asked for by `request` from the shapes posed by the
/// classifier's last mask call.
pub fn aggregate(
    registry: &ShapeRegistry,
    classifier: &dyn GeometryClassifier,
    request: BoundsRequest,
) -> BoundsReport {
    let mut report = BoundsReport::default();
    let ignored = registry.ignored();

    if request.sphere || request.debug_spheres {
        let mut kept = Vec::new();
        for (handle, sphere) in classifier.bounding_spheres() {
            let entry = match registry.entry(handle) {
                Ok(entry) => entry,
                Err(e) => {
                    error!(error = %e, "bounding sphere for unregistered shape");
                    continue;
                }
            };
            if request.debug_spheres {
                report.debug_spheres.push((entry.cache_key.clone(), sphere));
            }
            if !ignored.bounding_sphere.contains(&handle) {
                kept.push(sphere);
            }
        }
        if request.sphere {
            report.sphere = merge_spheres(&kept);
        }
    }

    if request.aabb || request.debug_boxes {
        let mut kept = Vec::new();
        for (handle, aabb) in classifier.bounding_boxes() {
            let entry = match registry.entry(handle) {
                Ok(entry) => entry,
                Err(e) => {
                    error!(error = %e, "bounding box for unregistered shape");
                    continue;
                }
            };
            if request.debug_boxes {
                report.debug_boxes.push((entry.cache_key.clone(), aabb));
            }
            if !ignored.bounding_box.contains(&handle) {
                kept.push(aabb);
            }
        }
        if request.aabb {
            report.aabb = merge_boxes(&kept);
        }
    }

    report
}
