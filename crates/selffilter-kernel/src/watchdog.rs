//! [`FramesWatchdog`] – liveness monitor for the link frames of the robot.
//!
//! Every link that carries a registered shape is *monitored*.  A background
//! thread periodically asks the pose source for the latest transform of each
//! monitored frame and marks it [`FrameHealth::Unreachable`] when it cannot be
//! resolved within the unreachable timeout.  Lookups made while filtering use
//! that state to pick their budget: reachable frames get the full reachable
//! timeout, unreachable ones only the short unreachable timeout, so a stalled
//! pose source is noticed before a scan arrives and does not stall every scan.
//!
//! ```text
//!   set_monitored_frames ──► records ◄── check_all (every period)
//!                               ▲
//!   resolve(link, stamp) ───────┘  (success marks the frame reachable)
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nalgebra::Isometry3;
use parking_lot::{Condvar, Mutex};
use selffilter_perception::{LookupTime, PoseSource};
use selffilter_types::{Clock, Stamp};
use tracing::{debug, info, warn};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Liveness reported for a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHealth {
    /// The frame resolved on its last check or lookup.
    Reachable,
    /// The last periodic check could not resolve the frame.
    Unreachable,
}

/// Resolves the pose of a link in the fixed frame at a scan instant.
///
/// `None` means "not resolvable for this scan"; it is never an error.
pub trait LinkPoseResolver {
    fn resolve(&self, link: &str, at: Stamp) -> Option<Isometry3<f64>>;
}

/// Budget left for a lookup at `at` given a `timeout` measured from `at`.
///
/// Time already elapsed since `at` is deducted, so lookups of old stamps fail
/// fast.  Stamps in the future get the plain timeout.
pub fn remaining_time(at: Stamp, timeout: Duration, now: Stamp) -> Duration {
    let passed = now.signed_duration_since(at).to_std().unwrap_or(Duration::ZERO);
    timeout.saturating_sub(passed)
}

/// Timing of a [`FramesWatchdog`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchdogTiming {
    pub reachable_timeout: Duration,
    pub unreachable_timeout: Duration,
    pub period: Duration,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct FrameRecord {
    last_ok: Option<Instant>,
    health: FrameHealth,
}

impl FrameRecord {
    fn fresh() -> Self {
        Self {
            last_ok: None,
            health: FrameHealth::Reachable,
        }
    }
}

struct Shared {
    fixed_frame: String,
    source: Arc<dyn PoseSource>,
    clock: Arc<dyn Clock>,
    timing: WatchdogTiming,
    records: Mutex<HashMap<String, FrameRecord>>,
    paused: AtomicBool,
    stop: Mutex<bool>,
    wake: Condvar,
}

impl Shared {
    fn check_all(&self) -> Vec<String> {
        let frames: Vec<String> = self.records.lock().keys().cloned().collect();

        let mut unreachable = Vec::new();
        for frame in frames {
            let result = self.source.lookup(
                &self.fixed_frame,
                &frame,
                LookupTime::Latest,
                self.timing.unreachable_timeout,
            );

            let mut records = self.records.lock();
            // Cleared while the lookup was running.
            let Some(record) = records.get_mut(&frame) else {
                continue;
            };
            match result {
                Ok(_) => {
                    if record.health == FrameHealth::Unreachable {
                        info!(frame = %frame, "frame is reachable again");
                    }
                    record.health = FrameHealth::Reachable;
                    record.last_ok = Some(Instant::now());
                }
                Err(e) => {
                    if record.health == FrameHealth::Reachable {
                        warn!(frame = %frame, fixed = %self.fixed_frame, error = %e, "frame became unreachable");
                    }
                    record.health = FrameHealth::Unreachable;
                    unreachable.push(frame);
                }
            }
        }
        unreachable
    }

    fn run(&self) {
        let mut stop = self.stop.lock();
        while !*stop {
            self.wake.wait_for(&mut stop, self.timing.period);
            if *stop {
                break;
            }
            if self.paused.load(Ordering::Acquire) {
                continue;
            }
            drop(stop);
            let unreachable = self.check_all();
            if !unreachable.is_empty() {
                debug!(count = unreachable.len(), "unreachable frames");
            }
            stop = self.stop.lock();
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FramesWatchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks reachability of monitored frames and resolves link poses.
///
/// # Example
///
/// ```
/// use std::collections::BTreeSet;
/// use std::sync::Arc;
/// use std::time::Duration;
/// use nalgebra::Isometry3;
/// use selffilter_kernel::watchdog::{FrameHealth, FramesWatchdog, WatchdogTiming};
/// use selffilter_perception::PoseBuffer;
/// use selffilter_types::SystemClock;
///
/// let buffer = Arc::new(PoseBuffer::new(Duration::from_secs(10)));
/// buffer.set_static_transform("base_link", "arm", Isometry3::identity());
///
/// let timing = WatchdogTiming {
///     reachable_timeout: Duration::from_millis(100),
///     unreachable_timeout: Duration::from_millis(10),
///     period: Duration::from_secs(1),
/// };
/// let wd = FramesWatchdog::new("base_link", buffer, Arc::new(SystemClock), timing);
/// wd.set_monitored_frames(&BTreeSet::from(["arm".to_string(), "ghost".to_string()]));
///
/// assert_eq!(wd.check_all(), vec!["ghost".to_string()]);
/// assert_eq!(wd.health("arm"), FrameHealth::Reachable);
/// ```
pub struct FramesWatchdog {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FramesWatchdog {
    /// A stopped watchdog over no frames.  Lookups resolve links into
    /// `fixed_frame` through `source`.
    pub fn new(
        fixed_frame: &str,
        source: Arc<dyn PoseSource>,
        clock: Arc<dyn Clock>,
        timing: WatchdogTiming,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                fixed_frame: fixed_frame.to_string(),
                source,
                clock,
                timing,
                records: Mutex::new(HashMap::new()),
                paused: AtomicBool::new(false),
                stop: Mutex::new(false),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the periodic checks on a background thread.  No-op when already
    /// running.
    pub fn start(&self) -> std::io::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        *self.shared.stop.lock() = false;
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("frame-watchdog".to_string())
            .spawn(move || shared.run())?;
        *worker = Some(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Stop the background thread and wait for it.
    pub fn stop(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        *self.shared.stop.lock() = true;
        self.shared.wake.notify_all();
        if handle.join().is_err() {
            warn!("frame watchdog thread panicked");
        }
    }

    /// Suspend periodic checks.  Lookups keep working.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    /// Resume periodic checks after [`pause`][Self::pause].
    pub fn unpause(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Forget all monitored frames and their liveness.
    pub fn clear(&self) {
        self.shared.records.lock().clear();
    }

    /// Monitor exactly `frames`.  Frames already monitored keep their state;
    /// new ones start reachable.
    pub fn set_monitored_frames(&self, frames: &BTreeSet<String>) {
        let mut records = self.shared.records.lock();
        records.retain(|name, _| frames.contains(name));
        for frame in frames {
            records
                .entry(frame.clone())
                .or_insert_with(FrameRecord::fresh);
        }
    }

    pub fn monitored_frames(&self) -> BTreeSet<String> {
        self.shared.records.lock().keys().cloned().collect()
    }

    /// Check every monitored frame once and return the unreachable ones.
    pub fn check_all(&self) -> Vec<String> {
        let mut unreachable = self.shared.check_all();
        unreachable.sort();
        unreachable
    }

    /// Health of `frame`.  Unknown frames are unreachable.
    pub fn health(&self, frame: &str) -> FrameHealth {
        self.shared
            .records
            .lock()
            .get(frame)
            .map_or(FrameHealth::Unreachable, |r| r.health)
    }

    /// Unreachable monitored frames, sorted.
    pub fn unreachable_frames(&self) -> Vec<String> {
        let mut frames: Vec<String> = self
            .shared
            .records
            .lock()
            .iter()
            .filter(|(_, r)| r.health == FrameHealth::Unreachable)
            .map(|(name, _)| name.clone())
            .collect();
        frames.sort();
        frames
    }

    /// Time since `frame` last resolved, if it ever did.
    pub fn since_last_seen(&self, frame: &str) -> Option<Duration> {
        self.shared
            .records
            .lock()
            .get(frame)
            .and_then(|r| r.last_ok)
            .map(|t| t.elapsed())
    }

    fn lookup_budget(&self, frame: &str, at: Stamp) -> Duration {
        let timing = &self.shared.timing;
        let base = match self.shared.records.lock().get(frame) {
            Some(r) if r.health == FrameHealth::Unreachable => timing.unreachable_timeout,
            _ => timing.reachable_timeout,
        };
        remaining_time(at, base, self.shared.clock.now())
    }
}

impl LinkPoseResolver for FramesWatchdog {
    fn resolve(&self, link: &str, at: Stamp) -> Option<Isometry3<f64>> {
        let budget = self.lookup_budget(link, at);
        match self
            .shared
            .source
            .lookup(&self.shared.fixed_frame, link, LookupTime::At(at), budget)
        {
            Ok(pose) => {
                if let Some(record) = self.shared.records.lock().get_mut(link) {
                    record.health = FrameHealth::Reachable;
                    record.last_ok = Some(Instant::now());
                }
                Some(pose)
            }
            Err(e) => {
                debug!(link, stamp = %at, error = %e, "link pose unresolved");
                None
            }
        }
    }
}

impl Drop for FramesWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
