//! The geometry classifier capability consumed by the self-filter.
//!
//! The classifier owns the solid bodies (ray casting, containment, inflation);
//! the self-filter only tells it which shapes exist, which tests each shape
//! takes part in, and where every shape is at the instant being classified.

use std::collections::BTreeSet;

use nalgebra::{Isometry3, Point3};
use selffilter_perception::{Aabb, BoundingSphere};
use selffilter_types::{CacheKey, ClassifierError, Geometry, MaskValue, ShapeHandle};

/// Answers "where is this shape right now" for the classifier.
///
/// `None` means the pose could not be resolved; the shape then takes no part
/// in classification or bounds until it has a pose again.
pub trait ShapePoseProvider {
    fn shape_pose(&self, handle: ShapeHandle) -> Option<Isometry3<f64>>;
}

/// How much a shape is grown before it is classified against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inflation {
    pub scale: f64,
    pub padding: f64,
}

impl Default for Inflation {
    fn default() -> Self {
        Self {
            scale: 1.0,
            padding: 0.0,
        }
    }
}

/// Point classification against a set of posed solid bodies.
pub trait GeometryClassifier: Send {
    /// Register a shape and return its handle.  Handles are never reused.
    fn add_shape(
        &mut self,
        key: &CacheKey,
        geometry: &Geometry,
        inflation: Inflation,
    ) -> Result<ShapeHandle, ClassifierError>;

    /// Unregister a shape.  Returns `false` for unknown handles.
    fn remove_shape(&mut self, handle: ShapeHandle) -> bool;

    fn set_ignore_in_contains_test(&mut self, handles: BTreeSet<ShapeHandle>);

    fn set_ignore_in_shadow_test(&mut self, handles: BTreeSet<ShapeHandle>);

    /// Rebuild internal shape lists after shapes or ignore sets changed.
    fn update_shape_lists(&mut self);

    /// Re-pose every body through `poses`, then classify a cloud seen from
    /// `sensor`.  The result is aligned 1:1 with `points`.
    fn mask_cloud(
        &mut self,
        poses: &dyn ShapePoseProvider,
        points: &[Point3<f64>],
        sensor: &Point3<f64>,
    ) -> Vec<MaskValue>;

    /// Re-pose every body through `poses`, then classify one point seen from
    /// its own `viewpoint`.
    fn mask_point(
        &mut self,
        poses: &dyn ShapePoseProvider,
        point: &Point3<f64>,
        viewpoint: &Point3<f64>,
    ) -> MaskValue;

    /// Bounding sphere of every shape posed by the last mask call.
    fn bounding_spheres(&self) -> Vec<(ShapeHandle, BoundingSphere)>;

    /// Axis-aligned box of every shape posed by the last mask call.
    fn bounding_boxes(&self) -> Vec<(ShapeHandle, Aabb)>;
}
