//! Time-indexed frame tree: the pose source the self-filter looks links up in.
//!
//! Every non-root frame has one parent and a short history of time-stamped
//! parent→child transforms (or a single static one).  A lookup walks both
//! frames up to their common ancestor, interpolates every edge at the
//! requested time and composes the chain.
//!
//! Lookups may wait: [`PoseSource::lookup`] blocks on a condition variable
//! until the requested data arrives or the timeout runs out.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use chrono::Utc;
//! use nalgebra::Isometry3;
//! use selffilter_perception::pose_buffer::{LookupTime, PoseBuffer, PoseSource};
//!
//! let buffer = PoseBuffer::new(Duration::from_secs(10));
//! buffer.set_static_transform("base_link", "laser", Isometry3::translation(0.2, 0.0, 0.3));
//!
//! let t = buffer
//!     .lookup("base_link", "laser", LookupTime::At(Utc::now()), Duration::ZERO)
//!     .unwrap();
//! assert!((t.translation.x - 0.2).abs() < 1e-9);
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use nalgebra::Isometry3;
use parking_lot::{Condvar, Mutex};
use selffilter_types::{Stamp, seconds_between, stamp_before};
use thiserror::Error;
use tracing::debug;

use crate::transform::interpolate;

// ────────────────────────────────────────────────────────────────────────────
// Capability
// ────────────────────────────────────────────────────────────────────────────

/// Which instant a lookup asks for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LookupTime {
    /// The most recent data available on every edge.
    Latest,
    At(Stamp),
}

/// Why a lookup could not be answered.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    #[error("frame {0} does not exist")]
    UnknownFrame(String),

    #[error("frames {target} and {source_frame} are not connected")]
    NoPath { target: String, source_frame: String },

    #[error("no data for frame {frame} at {requested}")]
    Extrapolation { frame: String, requested: Stamp },
}

/// Best-effort source of rigid transforms between named frames.
///
/// Implementations may be fed asynchronously; a frame may be temporarily
/// unavailable.
pub trait PoseSource: Send + Sync {
    /// Transform that maps points expressed in `source` into `target`,
    /// waiting at most `timeout` for the data to become available.
    fn lookup(
        &self,
        target: &str,
        source: &str,
        time: LookupTime,
        timeout: Duration,
    ) -> Result<Isometry3<f64>, LookupError>;

    /// Forget buffered time-varying data.  Static transforms survive.
    fn clear(&self);
}

// ────────────────────────────────────────────────────────────────────────────
// PoseBuffer
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct FrameHistory {
    parent: String,
    is_static: bool,
    /// Ordered by stamp, oldest first.
    samples: VecDeque<(Stamp, Isometry3<f64>)>,
}

impl FrameHistory {
    fn sample(&self, frame: &str, time: LookupTime) -> Result<Isometry3<f64>, LookupError> {
        let extrapolation = |requested| LookupError::Extrapolation {
            frame: frame.to_string(),
            requested,
        };

        if self.is_static {
            return self
                .samples
                .back()
                .map(|(_, tf)| *tf)
                .ok_or_else(|| extrapolation(Stamp::MIN_UTC));
        }

        let at = match time {
            LookupTime::Latest => {
                return self
                    .samples
                    .back()
                    .map(|(_, tf)| *tf)
                    .ok_or_else(|| extrapolation(Stamp::MIN_UTC));
            }
            LookupTime::At(at) => at,
        };

        // First sample not older than the requested instant.
        let upper = self.samples.partition_point(|(stamp, _)| *stamp < at);
        let Some((after_stamp, after)) = self.samples.get(upper) else {
            return Err(extrapolation(at));
        };
        if *after_stamp == at {
            return Ok(*after);
        }
        let Some((before_stamp, before)) = upper.checked_sub(1).and_then(|i| self.samples.get(i))
        else {
            return Err(extrapolation(at));
        };

        let span = seconds_between(*before_stamp, *after_stamp);
        let ratio = seconds_between(*before_stamp, at) / span;
        Ok(interpolate(before, after, ratio))
    }
}

#[derive(Debug, Default)]
struct FrameTree {
    /// Keyed by child frame.
    frames: HashMap<String, FrameHistory>,
}

impl FrameTree {
    fn knows(&self, frame: &str) -> bool {
        self.frames.contains_key(frame) || self.frames.values().any(|h| h.parent == frame)
    }

    /// `frame` followed by its ancestors up to the root.
    fn ancestry<'a>(&'a self, frame: &'a str) -> Vec<&'a str> {
        let mut chain = vec![frame];
        let mut current = frame;
        while let Some(history) = self.frames.get(current) {
            // A cycle would otherwise loop forever.
            if chain.len() > self.frames.len() {
                break;
            }
            current = &history.parent;
            chain.push(current);
        }
        chain
    }

    /// Transform mapping `frame` into `ancestor`.
    fn to_ancestor(
        &self,
        chain: &[&str],
        ancestor: &str,
        time: LookupTime,
    ) -> Result<Isometry3<f64>, LookupError> {
        let mut acc = Isometry3::identity();
        for frame in chain.iter().take_while(|f| **f != ancestor) {
            let history = self
                .frames
                .get(*frame)
                .ok_or_else(|| LookupError::UnknownFrame(frame.to_string()))?;
            acc = history.sample(frame, time)? * acc;
        }
        Ok(acc)
    }

    fn resolve(
        &self,
        target: &str,
        source: &str,
        time: LookupTime,
    ) -> Result<Isometry3<f64>, LookupError> {
        for frame in [target, source] {
            if !self.knows(frame) {
                return Err(LookupError::UnknownFrame(frame.to_string()));
            }
        }
        if target == source {
            return Ok(Isometry3::identity());
        }

        let source_chain = self.ancestry(source);
        let target_chain = self.ancestry(target);
        let common = source_chain
            .iter()
            .find(|f| target_chain.contains(*f))
            .ok_or_else(|| LookupError::NoPath {
                target: target.to_string(),
                source_frame: source.to_string(),
            })?;

        let common_from_source = self.to_ancestor(&source_chain, common, time)?;
        let common_from_target = self.to_ancestor(&target_chain, common, time)?;
        Ok(common_from_target.inverse() * common_from_source)
    }
}

/// In-memory [`PoseSource`] fed by [`set_transform`](Self::set_transform).
///
/// Dynamic edges keep samples no older than `retention` behind their newest
/// sample.
#[derive(Debug)]
pub struct PoseBuffer {
    tree: Mutex<FrameTree>,
    updated: Condvar,
    retention: Duration,
}

impl PoseBuffer {
    /// An empty buffer keeping `retention` worth of samples per frame.
    pub fn new(retention: Duration) -> Self {
        Self {
            tree: Mutex::new(FrameTree::default()),
            updated: Condvar::new(),
            retention,
        }
    }

    /// Record the pose of `child` in `parent` at `stamp`.
    ///
    /// Re-parenting a frame discards its previous history.
    pub fn set_transform(&self, parent: &str, child: &str, stamp: Stamp, transform: Isometry3<f64>) {
        let mut tree = self.tree.lock();
        let history = tree
            .frames
            .entry(child.to_string())
            .or_insert_with(|| FrameHistory {
                parent: parent.to_string(),
                is_static: false,
                samples: VecDeque::new(),
            });
        if history.parent != parent || history.is_static {
            history.parent = parent.to_string();
            history.is_static = false;
            history.samples.clear();
        }

        let at = history.samples.partition_point(|(s, _)| *s < stamp);
        if history.samples.get(at).is_some_and(|(s, _)| *s == stamp) {
            history.samples[at] = (stamp, transform);
        } else {
            history.samples.insert(at, (stamp, transform));
        }

        if let Some((newest, _)) = history.samples.back() {
            let horizon = stamp_before(*newest, self.retention);
            while history.samples.len() > 1
                && history.samples.front().is_some_and(|(s, _)| *s < horizon)
            {
                history.samples.pop_front();
            }
        }
        drop(tree);
        self.updated.notify_all();
    }

    /// Record a transform valid at every instant.
    pub fn set_static_transform(&self, parent: &str, child: &str, transform: Isometry3<f64>) {
        let mut tree = self.tree.lock();
        tree.frames.insert(
            child.to_string(),
            FrameHistory {
                parent: parent.to_string(),
                is_static: true,
                samples: VecDeque::from([(Stamp::MIN_UTC, transform)]),
            },
        );
        drop(tree);
        self.updated.notify_all();
    }

    /// Number of samples held for `child` (0 for unknown frames).
    pub fn sample_count(&self, child: &str) -> usize {
        self.tree
            .lock()
            .frames
            .get(child)
            .map_or(0, |h| h.samples.len())
    }
}

impl PoseSource for PoseBuffer {
    fn lookup(
        &self,
        target: &str,
        source: &str,
        time: LookupTime,
        timeout: Duration,
    ) -> Result<Isometry3<f64>, LookupError> {
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

        let mut tree = self.tree.lock();
        let mut last_attempt = timeout.is_zero();
        loop {
            match tree.resolve(target, source, time) {
                Ok(transform) => return Ok(transform),
                Err(e) if last_attempt => {
                    debug!(
                        target_frame = target,
                        source_frame = source,
                        ?time,
                        ?timeout,
                        error = %e,
                        "pose lookup failed"
                    );
                    return Err(e);
                }
                Err(_) => {}
            }
            last_attempt = self.updated.wait_until(&mut tree, deadline).timed_out();
        }
    }

    fn clear(&self) {
        let mut tree = self.tree.lock();
        let before = tree.frames.len();
        tree.frames.retain(|_, history| history.is_static);
        debug!(dropped = before - tree.frames.len(), "pose buffer cleared");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
