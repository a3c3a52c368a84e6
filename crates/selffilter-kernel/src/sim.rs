//! [`SimClassifier`] – bounding-sphere stand-in for a ray-casting classifier.
//!
//! Every shape is approximated by the sphere enclosing its primitive, grown
//! by the registration inflation.  Good enough to run the self-filter end to
//! end in CI and in the node binary without a mesh-capable geometry backend;
//! mesh geometry is rejected.

use std::collections::BTreeSet;

use nalgebra::{Isometry3, Point3};
use selffilter_perception::{Aabb, BoundingSphere};
use selffilter_types::{CacheKey, ClassifierError, Geometry, MaskValue, ShapeHandle};
use slotmap::SlotMap;
use tracing::debug;

use crate::classifier::{GeometryClassifier, Inflation, ShapePoseProvider};

struct SimBody {
    key: CacheKey,
    radius: f64,
    pose: Option<Isometry3<f64>>,
}

impl SimBody {
    fn sphere(&self) -> Option<BoundingSphere> {
        self.pose
            .map(|pose| BoundingSphere::new(Point3::from(pose.translation.vector), self.radius))
    }
}

/// Sphere-approximating [`GeometryClassifier`].
///
/// Points closer than `min_distance` or farther than `max_distance` (when
/// non-zero) from their viewpoint are [`MaskValue::Clip`].
pub struct SimClassifier {
    bodies: SlotMap<ShapeHandle, SimBody>,
    ignored_in_contains: BTreeSet<ShapeHandle>,
    ignored_in_shadow: BTreeSet<ShapeHandle>,
    contains_list: Vec<ShapeHandle>,
    shadow_list: Vec<ShapeHandle>,
    min_distance: f64,
    max_distance: f64,
}

impl Default for SimClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SimClassifier {
    pub fn new() -> Self {
        Self::with_range(0.0, 0.0)
    }

    /// Classifier clipping points nearer than `min_distance` or farther
    /// than `max_distance` from the sensor; `0.0` disables a limit.
    pub fn with_range(min_distance: f64, max_distance: f64) -> Self {
        Self {
            bodies: SlotMap::with_key(),
            ignored_in_contains: BTreeSet::new(),
            ignored_in_shadow: BTreeSet::new(),
            contains_list: Vec::new(),
            shadow_list: Vec::new(),
            min_distance,
            max_distance,
        }
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// Inflated radius of a registered shape.
    pub fn radius(&self, handle: ShapeHandle) -> Option<f64> {
        self.bodies.get(handle).map(|b| b.radius)
    }

    fn update_poses(&mut self, poses: &dyn ShapePoseProvider) {
        for (handle, body) in self.bodies.iter_mut() {
            body.pose = poses.shape_pose(handle);
        }
    }

    fn posed_spheres<'a>(
        &'a self,
        list: &'a [ShapeHandle],
    ) -> impl Iterator<Item = BoundingSphere> + 'a {
        list.iter()
            .filter_map(|h| self.bodies.get(*h))
            .filter_map(SimBody::sphere)
    }

    fn classify(&self, point: &Point3<f64>, viewpoint: &Point3<f64>) -> MaskValue {
        let distance = (point - viewpoint).norm();
        if !distance.is_finite()
            || distance < self.min_distance
            || (self.max_distance > 0.0 && distance > self.max_distance)
        {
            return MaskValue::Clip;
        }

        if self
            .posed_spheres(&self.contains_list)
            .any(|s| s.contains_point(point))
        {
            return MaskValue::Inside;
        }

        // A body enclosing the viewpoint would shadow everything.
        if self
            .posed_spheres(&self.shadow_list)
            .filter(|s| !s.contains_point(viewpoint))
            .any(|s| segment_hits_sphere(viewpoint, point, &s))
        {
            return MaskValue::Shadow;
        }

        MaskValue::Outside
    }
}

/// Bounding radius of a primitive before inflation.
fn primitive_radius(key: &CacheKey, geometry: &Geometry) -> Result<f64, ClassifierError> {
    let radius = match geometry {
        Geometry::Sphere { radius } => *radius,
        Geometry::Box { size } => size.iter().map(|s| s * s).sum::<f64>().sqrt() / 2.0,
        Geometry::Cylinder { radius, length } => (radius * radius + length * length / 4.0).sqrt(),
        Geometry::Mesh { .. } => {
            return Err(ClassifierError::UnsupportedGeometry {
                key: key.to_string(),
                kind: geometry.kind(),
            });
        }
    };
    if !radius.is_finite() || radius < 0.0 {
        return Err(ClassifierError::InvalidShape {
            key: key.to_string(),
            details: format!("bounding radius {radius}"),
        });
    }
    Ok(radius)
}

fn segment_hits_sphere(from: &Point3<f64>, to: &Point3<f64>, sphere: &BoundingSphere) -> bool {
    let dir = to - from;
    let len2 = dir.norm_squared();
    if len2 == 0.0 {
        return false;
    }
    let t = ((sphere.center - from).dot(&dir) / len2).clamp(0.0, 1.0);
    let closest = from + dir * t;
    (closest - sphere.center).norm() <= sphere.radius
}

impl GeometryClassifier for SimClassifier {
    fn add_shape(
        &mut self,
        key: &CacheKey,
        geometry: &Geometry,
        inflation: Inflation,
    ) -> Result<ShapeHandle, ClassifierError> {
        let radius = primitive_radius(key, geometry)? * inflation.scale + inflation.padding;
        if !radius.is_finite() || radius < 0.0 {
            return Err(ClassifierError::InvalidShape {
                key: key.to_string(),
                details: format!("inflated radius {radius}"),
            });
        }
        let handle = self.bodies.insert(SimBody {
            key: key.clone(),
            radius,
            pose: None,
        });
        debug!(key = %key, radius, "sim body added");
        Ok(handle)
    }

    fn remove_shape(&mut self, handle: ShapeHandle) -> bool {
        self.bodies.remove(handle).is_some()
    }

    fn set_ignore_in_contains_test(&mut self, handles: BTreeSet<ShapeHandle>) {
        self.ignored_in_contains = handles;
    }

    fn set_ignore_in_shadow_test(&mut self, handles: BTreeSet<ShapeHandle>) {
        self.ignored_in_shadow = handles;
    }

    fn update_shape_lists(&mut self) {
        self.contains_list = self
            .bodies
            .keys()
            .filter(|h| !self.ignored_in_contains.contains(h))
            .collect();
        self.shadow_list = self
            .bodies
            .keys()
            .filter(|h| !self.ignored_in_shadow.contains(h))
            .collect();
    }

    fn mask_cloud(
        &mut self,
        poses: &dyn ShapePoseProvider,
        points: &[Point3<f64>],
        sensor: &Point3<f64>,
    ) -> Vec<MaskValue> {
        self.update_poses(poses);
        points.iter().map(|p| self.classify(p, sensor)).collect()
    }

    fn mask_point(
        &mut self,
        poses: &dyn ShapePoseProvider,
        point: &Point3<f64>,
        viewpoint: &Point3<f64>,
    ) -> MaskValue {
        self.update_poses(poses);
        self.classify(point, viewpoint)
    }

    fn bounding_spheres(&self) -> Vec<(ShapeHandle, BoundingSphere)> {
        self.bodies
            .iter()
            .filter_map(|(h, b)| b.sphere().map(|s| (h, s)))
            .collect()
    }

    fn bounding_boxes(&self) -> Vec<(ShapeHandle, Aabb)> {
        self.bounding_spheres()
            .into_iter()
            .map(|(h, s)| (h, Aabb::around_sphere(&s)))
            .collect()
    }
}

impl std::fmt::Debug for SimClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimClassifier")
            .field("bodies", &self.bodies.values().map(|b| b.key.as_str()).collect::<Vec<_>>())
            .field("min_distance", &self.min_distance)
            .field("max_distance", &self.max_distance)
            .finish()
    }
}
