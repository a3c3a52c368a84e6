//! Per-scan snapshot of shape poses.
//!
//! [`PoseCache::refresh`] resolves every link once for the scan start (and,
//! for per-point scans, once more for the scan end) and stores the pose of
//! each collision in the fixed frame.  The cache is rebuilt from scratch on
//! every scan; a link that does not resolve leaves a hole for its shapes.

use std::collections::HashMap;

use nalgebra::Isometry3;
use selffilter_perception::interpolate;
use selffilter_types::{CacheKey, ShapeHandle, Stamp};
use tracing::{debug, error};

use crate::classifier::ShapePoseProvider;
use crate::registry::ShapeRegistry;
use crate::watchdog::LinkPoseResolver;

/// Fixed-frame poses of every registered shape for the scan being
/// classified: one snapshot at scan start and, in per-point mode, one at
/// scan end.
#[derive(Debug, Default)]
pub struct PoseCache {
    start: HashMap<CacheKey, Isometry3<f64>>,
    end: HashMap<CacheKey, Isometry3<f64>>,
    per_point: bool,
}

fn snapshot(
    registry: &ShapeRegistry,
    resolver: &dyn LinkPoseResolver,
    at: Stamp,
) -> HashMap<CacheKey, Isometry3<f64>> {
    let mut links: HashMap<&str, Option<Isometry3<f64>>> = HashMap::new();
    let mut poses = HashMap::with_capacity(registry.len());
    for entry in registry.entries() {
        let link_pose = *links
            .entry(entry.link.as_str())
            .or_insert_with(|| resolver.resolve(&entry.link, at));
        if let Some(link_pose) = link_pose {
            poses.insert(entry.cache_key.clone(), link_pose * entry.origin);
        }
    }
    let unresolved = links.values().filter(|p| p.is_none()).count();
    if unresolved > 0 {
        debug!(stamp = %at, unresolved, "links without pose this scan");
    }
    poses
}

impl PoseCache {
    /// An empty batch-mode cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache with poses at `scan_time`, plus poses at `scan_end`
    /// when given.  Supplying an end switches the cache to per-point mode.
    pub fn refresh(
        &mut self,
        registry: &ShapeRegistry,
        resolver: &dyn LinkPoseResolver,
        scan_time: Stamp,
        scan_end: Option<Stamp>,
    ) {
        self.start = snapshot(registry, resolver, scan_time);
        self.end = match scan_end {
            Some(end) => snapshot(registry, resolver, end),
            None => HashMap::new(),
        };
        self.per_point = scan_end.is_some();
    }

    /// Drop both snapshots and return to batch mode.
    pub fn clear(&mut self) {
        self.start.clear();
        self.end.clear();
        self.per_point = false;
    }

    pub fn is_per_point(&self) -> bool {
        self.per_point
    }

    /// Pose of the shape `key` at fraction `ratio` of the scan.
    ///
    /// Outside per-point mode the start pose is returned as is.  In per-point
    /// mode both ends must be known.
    pub fn pose_at(&self, key: &CacheKey, ratio: f64) -> Option<Isometry3<f64>> {
        let start = self.start.get(key)?;
        if !self.per_point {
            return Some(*start);
        }
        let end = self.end.get(key)?;
        Some(interpolate(start, end, ratio))
    }
}

/// Shape poses of one registry generation at one instant of the scan.
pub struct PoseView<'a> {
    pub registry: &'a ShapeRegistry,
    pub cache: &'a PoseCache,
    pub ratio: f64,
}

impl ShapePoseProvider for PoseView<'_> {
    fn shape_pose(&self, handle: ShapeHandle) -> Option<Isometry3<f64>> {
        match self.registry.entry(handle) {
            Ok(entry) => self.cache.pose_at(&entry.cache_key, self.ratio),
            Err(e) => {
                error!(error = %e, "classifier asked for a shape outside the current generation");
                None
            }
        }
    }
}
