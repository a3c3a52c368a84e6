//! `selffilter-kernel` – Self-model synchronisation and classification
//!
//! Keeps the robot's collision shapes registered with a geometry classifier,
//! poses them for every scan and decides for each measured point whether it
//! belongs to the robot.
//!
//! # Modules
//!
//! - [`config`] – [`FilterConfig`][config::FilterConfig]: frames, ranges,
//!   inflation, ignore lists, timeouts and bounding toggles.
//! - [`classifier`] – the [`GeometryClassifier`][classifier::GeometryClassifier]
//!   capability and the [`ShapePoseProvider`][classifier::ShapePoseProvider]
//!   it pulls shape poses through.
//! - [`ignore`] – naming variants of a collision and the five ignore sets.
//! - [`registry`] – [`ShapeRegistry`][registry::ShapeRegistry]: one
//!   generation of registered shapes, built and torn down atomically.
//! - [`watchdog`] – [`FramesWatchdog`][watchdog::FramesWatchdog]: periodic
//!   liveness checks of link frames and budgeted link pose lookups.
//! - [`pose_cache`] – [`PoseCache`][pose_cache::PoseCache]: per-scan shape
//!   poses at scan start and end, interpolated per point.
//! - [`orchestrator`] – [`ModelState`][orchestrator::ModelState]: batch and
//!   per-point classification against one generation.
//! - [`aggregator`] – whole-robot bounding sphere and box.
//! - [`scan`] – the [`ScanAdapter`][scan::ScanAdapter] capability with
//!   [`LaserScan`][scan::LaserScan] and [`PointCloud`][scan::PointCloud].
//! - [`reload`] – [`SelfFilter`][reload::SelfFilter]: configuration, hot
//!   reload, the time-skew guard and the filtering entry point.
//! - [`sim`] – [`SimClassifier`][sim::SimClassifier], a sphere-based
//!   classifier for simulation and CI.

pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod ignore;
pub mod orchestrator;
pub mod pose_cache;
pub mod registry;
pub mod reload;
pub mod scan;
pub mod sim;
pub mod watchdog;

pub use aggregator::{BoundsReport, BoundsRequest};
pub use classifier::{GeometryClassifier, Inflation, ShapePoseProvider};
pub use config::FilterConfig;
pub use registry::{CollisionEntry, ShapeRegistry};
pub use reload::{FilterState, ModelDescriptionSource, ReloadOutcome, SelfFilter};
pub use scan::{CloudPoint, FilterOutcome, LaserScan, PointCloud, ScanAdapter, ScanHeader};
pub use sim::SimClassifier;
pub use watchdog::{FrameHealth, FramesWatchdog};
