//! Bounding volumes of robot shapes and their merges.
//!
//! | Type | Role |
//! |------|------|
//! | [`BoundingSphere`] | Sphere enclosing one shape or the whole robot. |
//! | [`Aabb`]           | Axis-aligned box enclosing one shape or the whole robot. |
//!
//! Both merges are monotonic: folding another volume into an aggregate never
//! shrinks it, so adding a shape can only grow the robot's bound.

use nalgebra::{Point3, Vector3};

// ────────────────────────────────────────────────────────────────────────────
// BoundingSphere
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    pub center: Point3<f64>,
    pub radius: f64,
}

impl BoundingSphere {
    /// Negative radii are clamped to zero.
    pub fn new(center: Point3<f64>, radius: f64) -> Self {
        Self {
            center,
            radius: radius.max(0.0),
        }
    }

    /// True when the point lies inside or on the sphere.
    pub fn contains_point(&self, p: &Point3<f64>) -> bool {
        (p - self.center).norm() <= self.radius
    }

    /// Smallest sphere enclosing both `self` and `other`.
    pub fn merge(&self, other: &BoundingSphere) -> BoundingSphere {
        let offset = other.center - self.center;
        let distance = offset.norm();

        if distance + other.radius <= self.radius {
            return *self;
        }
        if distance + self.radius <= other.radius {
            return *other;
        }

        let radius = (distance + self.radius + other.radius) * 0.5;
        // distance > 0 here, otherwise one sphere would contain the other.
        let center = self.center + offset * ((radius - self.radius) / distance);
        BoundingSphere { center, radius }
    }
}

/// Merge all spheres into one.  `None` when there is nothing to merge.
pub fn merge_spheres<'a, I>(spheres: I) -> Option<BoundingSphere>
where
    I: IntoIterator<Item = &'a BoundingSphere>,
{
    spheres
        .into_iter()
        .fold(None, |acc: Option<BoundingSphere>, s| {
            Some(acc.map_or(*s, |m| m.merge(s)))
        })
}

// ────────────────────────────────────────────────────────────────────────────
// Aabb
// ────────────────────────────────────────────────────────────────────────────

/// An axis-aligned bounding box, defined by its minimum and maximum corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Aabb {
    /// Create a bounding box from its two opposite corners.
    ///
    /// The constructor normalises the corners so that `min ≤ max` per axis.
    pub fn new(a: Point3<f64>, b: Point3<f64>) -> Self {
        Self {
            min: a.inf(&b),
            max: a.sup(&b),
        }
    }

    /// Box tightly enclosing a sphere.
    pub fn around_sphere(sphere: &BoundingSphere) -> Self {
        let r = Vector3::repeat(sphere.radius);
        Self::new(sphere.center - r, sphere.center + r)
    }

    /// Edge lengths along x, y and z.
    pub fn sizes(&self) -> Vector3<f64> {
        self.max - self.min
    }

    pub fn volume(&self) -> f64 {
        let s = self.sizes();
        s.x * s.y * s.z
    }

    /// True when the point lies inside or on the boundary of the box.
    pub fn contains_point(&self, p: &Point3<f64>) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// Smallest box enclosing both boxes.
    pub fn merge(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }
}

/// Merge all boxes into one.  `None` when there is nothing to merge.
pub fn merge_boxes<'a, I>(boxes: I) -> Option<Aabb>
where
    I: IntoIterator<Item = &'a Aabb>,
{
    boxes
        .into_iter()
        .fold(None, |acc: Option<Aabb>, b| Some(acc.map_or(*b, |m| m.merge(b))))
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
