//! [`FilterConfig`] – every knob the self-filter recognises.
//!
//! Durations are plain seconds so the struct reads naturally from TOML:
//!
//! ```toml
//! fixed_frame = "base_link"
//! inflation_padding = 0.02
//! links_ignored_in_shadow_test = ["laser", "arm::grip"]
//! tf_buffer_length = 30.0
//! ```
//!
//! Ignore-list entries may name a whole link (`"arm"`), a named collision
//! (`"arm::grip"`), a collision name on any link (`"*::grip"`) or a
//! collision by index (`"arm::1"`).

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Filter parameters.  Every field has a default, so an empty `[filter]`
/// table is valid.  Times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Frame the classification runs in.
    #[serde(default = "default_fixed_frame")]
    pub fixed_frame: String,

    /// Sensor frame used when a scan header does not name one.
    #[serde(default = "default_sensor_frame")]
    pub sensor_frame: String,

    /// Minimum valid range (metres).
    #[serde(default)]
    pub min_distance: f64,

    /// Maximum valid range (metres); `0` disables the limit.
    #[serde(default)]
    pub max_distance: f64,

    /// Multiplicative growth applied to every shape.
    #[serde(default = "default_inflation_scale")]
    pub inflation_scale: f64,

    /// Additive growth applied to every shape (metres).
    #[serde(default)]
    pub inflation_padding: f64,

    #[serde(default)]
    pub links_ignored_in_bounding_sphere: BTreeSet<String>,
    #[serde(default)]
    pub links_ignored_in_bounding_box: BTreeSet<String>,
    #[serde(default)]
    pub links_ignored_in_contains_test: BTreeSet<String>,
    #[serde(default = "default_ignored_in_shadow_test")]
    pub links_ignored_in_shadow_test: BTreeSet<String>,
    /// Collisions matching this set are never registered at all.
    #[serde(default)]
    pub links_ignored_everywhere: BTreeSet<String>,

    /// Force per-point (`true`) or batch (`false`) classification; unset
    /// lets each scan kind choose.
    #[serde(default)]
    pub point_by_point_scan: Option<bool>,

    /// Pose retention window (seconds); also bounds the time-skew guard.
    #[serde(default = "default_tf_buffer_length")]
    pub tf_buffer_length: f64,

    /// Lookup budget for frames considered reachable (seconds).
    #[serde(default = "default_reachable_timeout")]
    pub reachable_transform_timeout: f64,

    /// Lookup budget for frames the watchdog marked unreachable (seconds).
    #[serde(default = "default_unreachable_timeout")]
    pub unreachable_transform_timeout: f64,

    /// Period of the frame watchdog (seconds).
    #[serde(default = "default_watchdog_period")]
    pub watchdog_period: f64,

    /// Wait between attempts to obtain a model description (seconds).
    #[serde(default = "default_description_retry")]
    pub description_retry_interval: f64,

    /// Field a model-change notification must carry to trigger a reload.
    #[serde(default = "default_description_field")]
    pub robot_description_field: String,

    /// Replace masked cloud points with NaN instead of dropping them.
    #[serde(default = "default_true")]
    pub keep_clouds_organized: bool,

    #[serde(default)]
    pub compute_bounding_sphere: bool,
    #[serde(default)]
    pub compute_bounding_box: bool,
    #[serde(default)]
    pub compute_debug_bounding_sphere: bool,
    #[serde(default)]
    pub compute_debug_bounding_box: bool,
}

fn default_fixed_frame() -> String {
    "base_link".to_string()
}
fn default_sensor_frame() -> String {
    "laser".to_string()
}
fn default_inflation_scale() -> f64 {
    1.0
}
fn default_ignored_in_shadow_test() -> BTreeSet<String> {
    BTreeSet::from(["laser".to_string()])
}
fn default_tf_buffer_length() -> f64 {
    60.0
}
fn default_reachable_timeout() -> f64 {
    1.0
}
fn default_unreachable_timeout() -> f64 {
    0.1
}
fn default_watchdog_period() -> f64 {
    1.0
}
fn default_description_retry() -> f64 {
    1.0
}
fn default_description_field() -> String {
    "robot_model".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            fixed_frame: default_fixed_frame(),
            sensor_frame: default_sensor_frame(),
            min_distance: 0.0,
            max_distance: 0.0,
            inflation_scale: default_inflation_scale(),
            inflation_padding: 0.0,
            links_ignored_in_bounding_sphere: BTreeSet::new(),
            links_ignored_in_bounding_box: BTreeSet::new(),
            links_ignored_in_contains_test: BTreeSet::new(),
            links_ignored_in_shadow_test: default_ignored_in_shadow_test(),
            links_ignored_everywhere: BTreeSet::new(),
            point_by_point_scan: None,
            tf_buffer_length: default_tf_buffer_length(),
            reachable_transform_timeout: default_reachable_timeout(),
            unreachable_transform_timeout: default_unreachable_timeout(),
            watchdog_period: default_watchdog_period(),
            description_retry_interval: default_description_retry(),
            robot_description_field: default_description_field(),
            keep_clouds_organized: true,
            compute_bounding_sphere: false,
            compute_bounding_box: false,
            compute_debug_bounding_sphere: false,
            compute_debug_bounding_box: false,
        }
    }
}

/// Negative or non-finite seconds read as zero.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl FilterConfig {
    /// How long the pose buffer keeps samples.
    pub fn retention(&self) -> Duration {
        seconds(self.tf_buffer_length)
    }

    pub fn reachable_timeout(&self) -> Duration {
        seconds(self.reachable_transform_timeout)
    }

    pub fn unreachable_timeout(&self) -> Duration {
        seconds(self.unreachable_transform_timeout)
    }

    /// Watchdog poll period; non-positive values fall back to the default.
    pub fn watchdog_period(&self) -> Duration {
        non_zero_or(seconds(self.watchdog_period), default_watchdog_period())
    }

    /// Wait between description attempts; non-positive values fall back to
    /// the default.
    pub fn description_retry(&self) -> Duration {
        non_zero_or(seconds(self.description_retry_interval), default_description_retry())
    }
}

fn non_zero_or(value: Duration, fallback: f64) -> Duration {
    if value.is_zero() {
        seconds(fallback)
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::BoundsRequest;

    #[test]
    fn non_positive_periods_fall_back_to_defaults() {
        let cfg = FilterConfig {
            watchdog_period: 0.0,
            description_retry_interval: -3.0,
            ..FilterConfig::default()
        };
        assert_eq!(cfg.watchdog_period(), Duration::from_secs(1));
        assert_eq!(cfg.description_retry(), Duration::from_secs(1));

        let cfg = FilterConfig {
            watchdog_period: 0.25,
            ..FilterConfig::default()
        };
        assert_eq!(cfg.watchdog_period(), Duration::from_millis(250));
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg: FilterConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, FilterConfig::default());
        assert_eq!(cfg.fixed_frame, "base_link");
        assert!(cfg.links_ignored_in_shadow_test.contains("laser"));
        assert_eq!(cfg.retention(), Duration::from_secs(60));
        assert_eq!(cfg.unreachable_timeout(), Duration::from_millis(100));
        assert!(cfg.keep_clouds_organized);
        assert!(!BoundsRequest::from_config(&cfg).any());
    }

    #[test]
    fn toml_overrides_fields() {
        let cfg: FilterConfig = toml::from_str(
            r#"
            fixed_frame = "odom"
            point_by_point_scan = false
            links_ignored_in_shadow_test = ["arm::grip"]
            compute_bounding_box = true
            tf_buffer_length = 2.5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.fixed_frame, "odom");
        assert_eq!(cfg.point_by_point_scan, Some(false));
        assert_eq!(
            cfg.links_ignored_in_shadow_test,
            BTreeSet::from(["arm::grip".to_string()])
        );
        assert!(BoundsRequest::from_config(&cfg).any());
        assert_eq!(cfg.retention(), Duration::from_millis(2500));
    }

    #[test]
    fn negative_durations_read_as_zero() {
        let cfg = FilterConfig {
            reachable_transform_timeout: -1.0,
            ..FilterConfig::default()
        };
        assert_eq!(cfg.reachable_timeout(), Duration::ZERO);
    }
}
