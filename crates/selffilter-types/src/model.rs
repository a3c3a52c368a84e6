//! Parsed robot model: links and their collision elements.
//!
//! This is the form in which a robot description reaches the self-filter.
//! Turning a description document into these types happens elsewhere; the
//! node binary reads them straight from TOML:
//!
//! ```toml
//! name = "rover"
//!
//! [[links]]
//! name = "base"
//!
//! [[links.collisions]]
//! name = "chassis"
//! origin = { xyz = [0.0, 0.0, 0.1], rpy = [0.0, 0.0, 0.0] }
//! geometry = { type = "box", size = [0.6, 0.4, 0.2] }
//! ```

use nalgebra::{Isometry3, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};

/// A complete robot model: an ordered list of links.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotModel {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl RobotModel {
    /// A model without links carries nothing to filter.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// A rigid link.  Its name doubles as the name of its pose frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    #[serde(default)]
    pub collisions: Vec<Collision>,
}

/// One collision element of a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collision {
    /// May be empty; unnamed collisions are addressed by index.
    #[serde(default)]
    pub name: String,
    /// Pose of the geometry relative to the link frame.
    #[serde(default)]
    pub origin: Origin,
    /// `None` for collision elements that carry no geometry.
    #[serde(default)]
    pub geometry: Option<Geometry>,
}

/// Primitive or mesh geometry of a collision element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Geometry {
    Sphere { radius: f64 },
    Box { size: [f64; 3] },
    Cylinder { radius: f64, length: f64 },
    Mesh {
        uri: String,
        #[serde(default = "unit_scale")]
        scale: [f64; 3],
    },
}

impl Geometry {
    pub fn kind(&self) -> &'static str {
        match self {
            Geometry::Sphere { .. } => "sphere",
            Geometry::Box { .. } => "box",
            Geometry::Cylinder { .. } => "cylinder",
            Geometry::Mesh { .. } => "mesh",
        }
    }
}

fn unit_scale() -> [f64; 3] {
    [1.0, 1.0, 1.0]
}

/// Fixed offset of a collision element: translation plus fixed-axis
/// roll/pitch/yaw in radians.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Origin {
    #[serde(default)]
    pub xyz: [f64; 3],
    #[serde(default)]
    pub rpy: [f64; 3],
}

impl Origin {
    pub fn to_isometry(&self) -> Isometry3<f64> {
        let [x, y, z] = self.xyz;
        let [roll, pitch, yaw] = self.rpy;
        Isometry3::from_parts(
            Translation3::new(x, y, z),
            UnitQuaternion::from_euler_angles(roll, pitch, yaw),
        )
    }
}

/// Asynchronous notification carrying named description fields.  Only the
/// field the filter is configured to watch triggers a reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub fields: Vec<DescriptionField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionField {
    pub name: String,
    pub model: RobotModel,
}

impl ModelUpdate {
    /// The model published under `field`, if this update carries one.
    pub fn model_for(&self, field: &str) -> Option<&RobotModel> {
        self.fields.iter().find(|f| f.name == field).map(|f| &f.model)
    }
}
