//! `selffilter-perception` – spatial math of the self-filter.
//!
//! # Modules
//!
//! - [`transform`] – [`interpolate`][transform::interpolate]: blends a pose
//!   captured at scan start with one captured at scan end (linear in
//!   translation, spherical in rotation).
//! - [`bounds`] – [`BoundingSphere`][bounds::BoundingSphere] and
//!   [`Aabb`][bounds::Aabb] with monotonic merges used to bound the whole
//!   robot.
//! - [`pose_buffer`] – the [`PoseSource`][pose_buffer::PoseSource] capability
//!   and [`PoseBuffer`][pose_buffer::PoseBuffer], a time-indexed frame tree
//!   with blocking, timeout-bounded lookups.

pub mod bounds;
pub mod pose_buffer;
pub mod transform;

pub use bounds::{Aabb, BoundingSphere, merge_boxes, merge_spheres};
pub use pose_buffer::{LookupError, LookupTime, PoseBuffer, PoseSource};
pub use transform::interpolate;
