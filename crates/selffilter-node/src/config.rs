//! Node configuration – reads `selffilter.toml` and `SELFFILTER_*` overrides.
//!
//! ```toml
//! robot_model = "robot.toml"
//! scan_rate_hz = 10.0
//!
//! [filter]
//! fixed_frame = "base_link"
//! links_ignored_in_shadow_test = ["laser"]
//!
//! [[static_transforms]]
//! parent = "base_link"
//! child = "laser"
//! xyz = [0.2, 0.0, 0.3]
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use nalgebra::Isometry3;
use selffilter_kernel::FilterConfig;
use selffilter_types::Origin;
use serde::{Deserialize, Serialize};

/// A fixed parent → child transform fed into the pose buffer at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticTransform {
    pub parent: String,
    pub child: String,
    #[serde(flatten)]
    pub origin: Origin,
}

impl StaticTransform {
    pub fn isometry(&self) -> Isometry3<f64> {
        self.origin.to_isometry()
    }
}

/// Parameters of the synthetic laser driving the filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticLaser {
    /// Number of rays over a full turn.
    #[serde(default = "default_rays")]
    pub rays: usize,
    /// Range reported by every ray (metres).
    #[serde(default = "default_range")]
    pub range: f32,
    /// Time between consecutive rays (seconds).
    #[serde(default)]
    pub time_increment: f32,
}

fn default_rays() -> usize {
    360
}
fn default_range() -> f32 {
    2.0
}

impl Default for SyntheticLaser {
    fn default() -> Self {
        Self {
            rays: default_rays(),
            range: default_range(),
            time_increment: 0.0,
        }
    }
}

/// Contents of `selffilter.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// TOML file holding the robot model.
    #[serde(default = "default_robot_model")]
    pub robot_model: PathBuf,

    /// Rate of synthetic scans.
    #[serde(default = "default_scan_rate")]
    pub scan_rate_hz: f64,

    /// How often the model file is checked for changes (seconds).
    #[serde(default = "default_model_poll")]
    pub model_poll_interval: f64,

    #[serde(default)]
    pub laser: SyntheticLaser,

    #[serde(default)]
    pub static_transforms: Vec<StaticTransform>,

    #[serde(default)]
    pub filter: FilterConfig,
}

fn default_robot_model() -> PathBuf {
    PathBuf::from("robot.toml")
}
fn default_scan_rate() -> f64 {
    10.0
}
fn default_model_poll() -> f64 {
    2.0
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            robot_model: default_robot_model(),
            scan_rate_hz: default_scan_rate(),
            model_poll_interval: default_model_poll(),
            laser: SyntheticLaser::default(),
            static_transforms: Vec::new(),
            filter: FilterConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Period between synthetic scans; non-positive rates fall back to 1 Hz.
    pub fn scan_period(&self) -> Duration {
        if self.scan_rate_hz > 0.0 {
            Duration::try_from_secs_f64(1.0 / self.scan_rate_hz).unwrap_or(Duration::from_secs(1))
        } else {
            Duration::from_secs(1)
        }
    }

    /// Model file poll period; non-positive values fall back to 2 s.
    pub fn model_poll(&self) -> Duration {
        Duration::try_from_secs_f64(self.model_poll_interval)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(2))
    }
}

/// Path of the configuration file: `SELFFILTER_CONFIG` or `./selffilter.toml`.
pub fn config_path() -> PathBuf {
    std::env::var("SELFFILTER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("selffilter.toml"))
}

/// Load the config from `path`, falling back to defaults when the file does
/// not exist, then apply environment overrides.
pub fn load_from(path: &Path) -> Result<NodeConfig> {
    let mut cfg = if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config at {}", path.display()))?
    } else {
        NodeConfig::default()
    };
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

/// Apply `SELFFILTER_*` overrides to `cfg`, reading each variable through
/// `var` (`std::env::var` in production).
///
/// | Variable | Config field |
/// |---|---|
/// | `SELFFILTER_FIXED_FRAME` | `filter.fixed_frame` |
/// | `SELFFILTER_SENSOR_FRAME` | `filter.sensor_frame` |
/// | `SELFFILTER_ROBOT_MODEL` | `robot_model` |
/// | `SELFFILTER_SCAN_RATE_HZ` | `scan_rate_hz` |
pub fn apply_env_overrides(cfg: &mut NodeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("SELFFILTER_FIXED_FRAME") {
        cfg.filter.fixed_frame = v;
    }
    if let Some(v) = var("SELFFILTER_SENSOR_FRAME") {
        cfg.filter.sensor_frame = v;
    }
    if let Some(v) = var("SELFFILTER_ROBOT_MODEL") {
        cfg.robot_model = PathBuf::from(v);
    }
    if let Some(v) = var("SELFFILTER_SCAN_RATE_HZ")
        && let Ok(rate) = v.parse::<f64>()
    {
        cfg.scan_rate_hz = rate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = load_from(&dir.path().join("selffilter.toml")).expect("load");
        assert_eq!(cfg.robot_model, PathBuf::from("robot.toml"));
        assert_eq!(cfg.filter, FilterConfig::default());
        assert_eq!(cfg.scan_period(), Duration::from_millis(100));
    }

    #[test]
    fn file_sections_are_read() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("selffilter.toml");
        fs::write(
            &path,
            r#"
            robot_model = "models/rover.toml"
            scan_rate_hz = 20.0

            [laser]
            rays = 90

            [filter]
            fixed_frame = "odom"
            compute_bounding_sphere = true

            [[static_transforms]]
            parent = "odom"
            child = "base_link"
            xyz = [1.0, 0.0, 0.0]
            "#,
        )
        .expect("write");

        let cfg = load_from(&path).expect("load");
        assert_eq!(cfg.robot_model, PathBuf::from("models/rover.toml"));
        assert_eq!(cfg.laser.rays, 90);
        assert_eq!(cfg.laser.range, 2.0);
        assert_eq!(cfg.filter.fixed_frame, "odom");
        assert!(cfg.filter.compute_bounding_sphere);
        assert_eq!(cfg.static_transforms.len(), 1);
        assert_eq!(cfg.static_transforms[0].isometry().translation.vector.x, 1.0);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("selffilter.toml");
        fs::write(&path, "scan_rate_hz = \"fast\"").expect("write");
        let err = load_from(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn non_positive_rate_falls_back() {
        let cfg = NodeConfig {
            scan_rate_hz: 0.0,
            model_poll_interval: -1.0,
            ..NodeConfig::default()
        };
        assert_eq!(cfg.scan_period(), Duration::from_secs(1));
        assert_eq!(cfg.model_poll(), Duration::from_secs(2));
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn apply_env_overrides_changes_frames_and_model() {
        let mut cfg = NodeConfig::default();
        apply_env_overrides(
            &mut cfg,
            vars(&[
                ("SELFFILTER_FIXED_FRAME", "odom"),
                ("SELFFILTER_SENSOR_FRAME", "lidar"),
                ("SELFFILTER_ROBOT_MODEL", "/tmp/robot.toml"),
            ]),
        );
        assert_eq!(cfg.filter.fixed_frame, "odom");
        assert_eq!(cfg.filter.sensor_frame, "lidar");
        assert_eq!(cfg.robot_model, PathBuf::from("/tmp/robot.toml"));
        assert_eq!(cfg.scan_rate_hz, 10.0);
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_rate() {
        let mut cfg = NodeConfig::default();
        apply_env_overrides(&mut cfg, vars(&[("SELFFILTER_SCAN_RATE_HZ", "fast")]));
        assert_eq!(cfg.scan_rate_hz, 10.0);
        apply_env_overrides(&mut cfg, vars(&[("SELFFILTER_SCAN_RATE_HZ", "25")]));
        assert_eq!(cfg.scan_rate_hz, 25.0);
    }

    #[test]
    fn no_overrides_leave_config_untouched() {
        let mut cfg = NodeConfig::default();
        apply_env_overrides(&mut cfg, vars(&[]));
        assert_eq!(cfg, NodeConfig::default());
    }
}
