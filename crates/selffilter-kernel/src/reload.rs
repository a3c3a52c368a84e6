//! [`SelfFilter`] – lifecycle of the self-filter and the entry point for
//! scans.
//!
//! ```text
//!  Unconfigured ──configure()──► Configuring ──► Active ◄──┐
//!                                                  │       │
//!                            reload() / on_model_changed() │
//!                                                  ▼       │
//!                                              Reloading ──┘
//! ```
//!
//! The model lock guards registry, pose cache and classifier.  Scans hold it
//! for their whole classification; reloads hold it for clear and rebuild, so
//! a scan always sees exactly one generation.  The watchdog is paused around
//! the critical section, never inside it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use parking_lot::Mutex;
use selffilter_perception::PoseSource;
use selffilter_perception::transform::origin_of;
use selffilter_types::{Clock, FilterError, ModelUpdate, RobotModel, Stamp, stamp_before};
use tracing::{debug, error, info, warn};

use crate::aggregator::{BoundsReport, BoundsRequest, aggregate};
use crate::classifier::{GeometryClassifier, Inflation};
use crate::config::FilterConfig;
use crate::ignore::IgnoreRules;
use crate::orchestrator::{ModelState, resolve_sensor};
use crate::scan::{FilterOutcome, ScanAdapter};
use crate::watchdog::{FramesWatchdog, WatchdogTiming};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a [`SelfFilter`].  Scans are only served while
/// [`Active`][FilterState::Active].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    /// No model installed: before the first `configure`, after a rejected
    /// model and after shutdown.
    Unconfigured,
    /// `configure` is waiting for a usable description.
    Configuring,
    /// A model generation is installed and scans are classified.
    Active,
    /// A reload is swapping the model; scans are refused until it ends.
    Reloading,
}

/// Where robot model descriptions come from.
pub trait ModelDescriptionSource: Send + Sync {
    /// The current description, or `None` when none is available.
    fn fetch(&self) -> Option<RobotModel>;
}

/// Answer to an administrative reload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub success: bool,
    pub message: String,
}

impl ReloadOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    fn failed(error: &FilterError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SelfFilter
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Lifecycle {
    state: FilterState,
    configured_since: Option<Stamp>,
}

/// Removes the robot's own body from scans.
pub struct SelfFilter {
    config: FilterConfig,
    rules: IgnoreRules,
    model: Mutex<ModelState>,
    lifecycle: Mutex<Lifecycle>,
    watchdog: FramesWatchdog,
    pose_source: Arc<dyn PoseSource>,
    descriptions: Arc<dyn ModelDescriptionSource>,
    clock: Arc<dyn Clock>,
    shutdown: AtomicBool,
    reconfigurations: AtomicU64,
}

impl SelfFilter {
    /// Assemble an unconfigured filter.  Nothing is registered and the
    /// watchdog is not started until [`configure`][Self::configure].
    pub fn new(
        config: FilterConfig,
        classifier: Box<dyn GeometryClassifier>,
        pose_source: Arc<dyn PoseSource>,
        descriptions: Arc<dyn ModelDescriptionSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let timing = WatchdogTiming {
            reachable_timeout: config.reachable_timeout(),
            unreachable_timeout: config.unreachable_timeout(),
            period: config.watchdog_period(),
        };
        let watchdog = FramesWatchdog::new(
            &config.fixed_frame,
            Arc::clone(&pose_source),
            Arc::clone(&clock),
            timing,
        );
        Self {
            rules: IgnoreRules::from_config(&config),
            config,
            model: Mutex::new(ModelState::new(classifier)),
            lifecycle: Mutex::new(Lifecycle {
                state: FilterState::Unconfigured,
                configured_since: None,
            }),
            watchdog,
            pose_source,
            descriptions,
            clock,
            shutdown: AtomicBool::new(false),
            reconfigurations: AtomicU64::new(0),
        }
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FilterState {
        self.lifecycle.lock().state
    }

    /// Clock time of the last successful install, `None` while unconfigured.
    pub fn configured_since(&self) -> Option<Stamp> {
        self.lifecycle.lock().configured_since
    }

    /// Registry generation currently installed (0 before the first).
    pub fn generation(&self) -> u64 {
        self.model.lock().registry.generation()
    }

    /// Reconfigurations forced by time discontinuities.
    pub fn reconfigurations(&self) -> u64 {
        self.reconfigurations.load(Ordering::Relaxed)
    }

    /// Monitored link frames the watchdog currently cannot resolve.
    pub fn unreachable_frames(&self) -> Vec<String> {
        self.watchdog.unreachable_frames()
    }

    pub fn watchdog(&self) -> &FramesWatchdog {
        &self.watchdog
    }

    fn set_state(&self, state: FilterState) {
        self.lifecycle.lock().state = state;
    }

    fn activate(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = FilterState::Active;
        lifecycle.configured_since = Some(self.clock.now());
    }

    // ── Configuration ────────────────────────────────────────────────────────

    /// Block until a model description is available and accepted, then
    /// install it and start (or reset) the watchdog.  Missing, empty and
    /// rejected descriptions are retried every `description_retry_interval`
    /// until one installs or [`shutdown`][Self::shutdown] is called.
    pub fn configure(&self) -> Result<(), FilterError> {
        self.set_state(FilterState::Configuring);
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                self.set_state(FilterState::Unconfigured);
                return Err(FilterError::ShutDown);
            }
            let retry = self.config.description_retry();
            let model = match self.descriptions.fetch() {
                Some(model) if !model.is_empty() => model,
                _ => {
                    error!(retry_in = ?retry, "robot model description is empty or missing");
                    thread::sleep(retry);
                    continue;
                }
            };

            match self.install_watched(&model) {
                Ok(()) => {
                    info!(model = %model.name, "self-filter configured");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, retry_in = ?retry, "robot model rejected, retrying");
                    self.set_state(FilterState::Configuring);
                    thread::sleep(retry);
                }
            }
        }
    }

    fn install_watched(&self, model: &RobotModel) -> Result<(), FilterError> {
        let restart = self.watchdog.is_running();
        if restart {
            self.watchdog.pause();
        }
        let installed = self.install(model);
        if restart {
            self.watchdog.unpause();
        } else if let Err(e) = self.watchdog.start() {
            warn!(error = %e, "frame watchdog could not be started");
        }
        installed
    }

    /// Replace the model with the current description.
    pub fn reload(&self) -> ReloadOutcome {
        let Some(model) = self.descriptions.fetch().filter(|m| !m.is_empty()) else {
            let e = FilterError::NoModelDescription;
            error!(error = %e, "reload refused");
            return ReloadOutcome::failed(&e);
        };
        info!("reloading robot model on request, filtering stopped");
        match self.swap_model(&model) {
            Ok(()) => ReloadOutcome::ok(),
            Err(e) => ReloadOutcome::failed(&e),
        }
    }

    /// React to a model-change notification.  Notifications that do not name
    /// the configured description field are ignored.
    pub fn on_model_changed(&self, update: &ModelUpdate) -> Option<ReloadOutcome> {
        let model = update.model_for(&self.config.robot_description_field)?;
        if model.is_empty() {
            warn!("model-change notification carries an empty model, ignored");
            return None;
        }
        info!("reloading robot model after change notification, filtering stopped");
        Some(match self.swap_model(model) {
            Ok(()) => ReloadOutcome::ok(),
            Err(e) => ReloadOutcome::failed(&e),
        })
    }

    fn swap_model(&self, model: &RobotModel) -> Result<(), FilterError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(FilterError::ShutDown);
        }
        self.watchdog.pause();
        self.set_state(FilterState::Reloading);
        let installed = self.install(model);
        self.watchdog.unpause();
        if installed.is_ok() {
            info!(generation = self.generation(), "robot model reloaded, filtering resumed");
        }
        installed
    }

    /// Clear and rebuild under one hold of the model lock, then point the
    /// watchdog at the new frames.
    fn install(&self, model: &RobotModel) -> Result<(), FilterError> {
        let inflation = Inflation {
            scale: self.config.inflation_scale,
            padding: self.config.inflation_padding,
        };
        let mut guard = self.model.lock();
        let state = &mut *guard;
        state.registry.clear(state.classifier.as_mut());
        state.cache.clear();
        self.watchdog.clear();

        match state
            .registry
            .rebuild(model, &self.rules, inflation, state.classifier.as_mut())
        {
            Ok(report) => {
                self.watchdog
                    .set_monitored_frames(&state.registry.monitored_frames());
                debug!(?report, "registry rebuilt");
                self.activate();
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "robot model rejected, filter unconfigured");
                self.set_state(FilterState::Unconfigured);
                Err(e)
            }
        }
    }

    /// Stop accepting scans and stop the watchdog.  A blocked
    /// [`configure`][Self::configure] gives up at its next retry.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.watchdog.stop();
        self.set_state(FilterState::Unconfigured);
    }

    // ── Filtering ────────────────────────────────────────────────────────────

    /// Drop scans the filter cannot serve yet, and reconfigure on scans so
    /// old they can only come from a clock jump or a replay.
    fn guard_time(&self, stamp: Stamp) -> Result<(), FilterError> {
        let (state, since) = {
            let lifecycle = self.lifecycle.lock();
            (lifecycle.state, lifecycle.configured_since)
        };
        let Some(since) = since.filter(|_| state == FilterState::Active) else {
            return Err(FilterError::NotConfigured);
        };
        if stamp >= since {
            return Ok(());
        }
        if stamp >= stamp_before(since, self.config.retention()) {
            debug!(stamp = %stamp, configured_since = %since, "scan predates configuration, ignored");
            return Err(FilterError::WarmingUp { stamp });
        }

        warn!(
            stamp = %stamp,
            configured_since = %since,
            "scan older than the pose retention window; clearing poses and reconfiguring (replaying data without simulated time?)"
        );
        self.reconfigurations.fetch_add(1, Ordering::Relaxed);
        self.pose_source.clear();
        if let Err(e) = self.configure() {
            error!(error = %e, "reconfiguration failed");
        }
        Err(FilterError::TimeDiscontinuity {
            stamp,
            configured_since: since,
        })
    }

    /// Classify `scan` and return its filtered form.
    pub fn filter<A: ScanAdapter>(&self, scan: A) -> Result<FilterOutcome<A::Output>, FilterError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(FilterError::ShutDown);
        }
        let stamp = scan.header().stamp;
        self.guard_time(stamp)?;

        let sensor_frame = scan
            .header()
            .sensor_frame(&self.config.sensor_frame)
            .to_string();
        let per_point = self
            .config
            .point_by_point_scan
            .unwrap_or_else(|| scan.default_point_by_point());

        let sensor = resolve_sensor(
            self.pose_source.as_ref(),
            self.clock.as_ref(),
            &self.config.fixed_frame,
            &sensor_frame,
            stamp,
            scan.sweep(),
            self.config.reachable_timeout(),
        )?;
        let points = scan.extract(per_point, &sensor)?;

        let (mask, bounds, generation) = {
            let mut model = self.model.lock();
            // A reload may have started while this scan waited for the lock.
            if self.state() != FilterState::Active {
                return Err(FilterError::NotConfigured);
            }
            let mask = model.classify(&self.watchdog, &points, &origin_of(&sensor.start));
            let request = BoundsRequest::from_config(&self.config);
            let bounds = if request.any() {
                aggregate(&model.registry, model.classifier.as_ref(), request)
            } else {
                BoundsReport::default()
            };
            (mask, bounds, model.registry.generation())
        };

        let output = scan.apply_mask(&points, &mask, &self.config);
        Ok(FilterOutcome {
            output,
            mask,
            points: points.points,
            bounds,
            generation,
        })
    }
}

impl Drop for SelfFilter {
    fn drop(&mut self) {
        self.watchdog.stop();
    }
}
