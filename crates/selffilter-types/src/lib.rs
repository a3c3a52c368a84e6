//! `selffilter-types` – shared vocabulary of the robot self-filter.
//!
//! Every other crate in the workspace speaks in these types: shape handles
//! and cache keys that join the registry, the pose caches and the bounding
//! results; the per-point [`MaskValue`]; scan timestamps and the injectable
//! [`Clock`]; the parsed robot model the registry is built from; and the
//! error enums returned across crate boundaries.

pub mod model;

pub use model::{Collision, DescriptionField, Geometry, Link, ModelUpdate, Origin, RobotModel};

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Identifiers
// ────────────────────────────────────────────────────────────────────────────

slotmap::new_key_type! {
    /// Opaque identifier handed out by the geometry classifier when a
    /// collision shape is registered.
    ///
    /// Handles are generational: once a shape is removed its handle never
    /// resolves again, even if the classifier reuses the slot.
    pub struct ShapeHandle;
}

/// Stable join key between a collision element, its cached transform and its
/// bounding results.  Unique within one model generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for the collision at `index` (counted over collisions that carry
    /// geometry) of `link`.
    pub fn new(link: &str, index: usize) -> Self {
        Self(format!("{link}-{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Classification result
// ────────────────────────────────────────────────────────────────────────────

/// Classification of a single measured point against the robot body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskValue {
    /// The point lies on or inside a robot shape.
    Inside,
    /// The point is a genuine measurement of the environment.
    Outside,
    /// The point lies behind a robot shape along the sensor ray.
    Shadow,
    /// The point lies at a silhouette boundary or outside the valid range.
    Clip,
}

impl MaskValue {
    /// True for points that survive filtering.
    pub fn is_outside(self) -> bool {
        self == MaskValue::Outside
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Time
// ────────────────────────────────────────────────────────────────────────────

/// Acquisition timestamp of a scan or a pose sample.
pub type Stamp = DateTime<Utc>;

/// Convert a `std` duration to a chrono delta, saturating on overflow.
pub fn time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Shift `stamp` by a (possibly fractional) number of seconds, saturating at
/// the representable range.
pub fn offset_stamp(stamp: Stamp, seconds: f64) -> Stamp {
    let delta = TimeDelta::nanoseconds((seconds * 1e9).round() as i64);
    stamp.checked_add_signed(delta).unwrap_or(if seconds > 0.0 {
        Stamp::MAX_UTC
    } else {
        Stamp::MIN_UTC
    })
}

/// `stamp` moved back by `window`, saturating at the earliest stamp.
pub fn stamp_before(stamp: Stamp, window: Duration) -> Stamp {
    stamp
        .checked_sub_signed(time_delta(window))
        .unwrap_or(Stamp::MIN_UTC)
}

/// Seconds elapsed from `from` to `to` (negative when `to` is earlier).
pub fn seconds_between(from: Stamp, to: Stamp) -> f64 {
    let delta = to - from;
    delta.num_seconds() as f64 + f64::from(delta.subsec_nanos()) * 1e-9
}

/// Source of "now" for everything that compares scan stamps against the
/// present: lookup budgets and the time-skew guard.
pub trait Clock: Send + Sync {
    fn now(&self) -> Stamp;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Stamp {
        Utc::now()
    }
}

/// A clock that only moves when told to.  Used for simulated time and tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Stamp>,
}

impl ManualClock {
    pub fn new(start: Stamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Jump to `stamp`, backwards included.
    pub fn set(&self, stamp: Stamp) {
        *self.now.lock() = stamp;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += time_delta(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Stamp {
        *self.now.lock()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Failures reported by a geometry classifier while registering shapes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    #[error("unsupported geometry {kind} for collision {key}")]
    UnsupportedGeometry { key: String, kind: &'static str },

    #[error("invalid shape {key}: {details}")]
    InvalidShape { key: String, details: String },
}

/// Failures of the self-filter.  All of them are recoverable: the scan or
/// the reload that produced them is dropped and the next one is retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("filter is not configured")]
    NotConfigured,

    #[error("scan at {stamp} predates the current configuration")]
    WarmingUp { stamp: Stamp },

    #[error("scan at {stamp} is older than the retention window before {configured_since}; reconfigured")]
    TimeDiscontinuity { stamp: Stamp, configured_since: Stamp },

    #[error("cannot resolve sensor frame {sensor} in {fixed} at {stamp}")]
    SensorTransform {
        fixed: String,
        sensor: String,
        stamp: Stamp,
    },

    #[error("scan is missing required field {0}")]
    MissingField(&'static str),

    #[error("unknown shape handle {0:?}")]
    UnknownShape(ShapeHandle),

    #[error("classifier rejected the model: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("no model description available")]
    NoModelDescription,

    #[error("filter is shutting down")]
    ShutDown,
}
