//! Robot model descriptions read from a TOML file on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use selffilter_kernel::ModelDescriptionSource;
use selffilter_types::RobotModel;
use tracing::warn;

/// Read and parse the robot model TOML at `path`.
pub fn read_model(path: &Path) -> Result<RobotModel> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read robot model at {}", path.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("failed to parse robot model at {}", path.display()))
}

/// Modification time of `path`, `None` when it cannot be read.
pub fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Serves the current contents of a model file to the filter.
#[derive(Debug, Clone)]
pub struct FileDescriptions {
    path: PathBuf,
}

impl FileDescriptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ModelDescriptionSource for FileDescriptions {
    fn fetch(&self) -> Option<RobotModel> {
        match read_model(&self.path) {
            Ok(model) => Some(model),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "robot model unavailable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use selffilter_types::Geometry;

    const ROVER: &str = r#"
        name = "rover"

        [[links]]
        name = "base_link"

        [[links.collisions]]
        name = "body"
        geometry = { type = "box", size = [0.6, 0.4, 0.2] }
        origin = { xyz = [0.0, 0.0, 0.1] }

        [[links]]
        name = "laser"
    "#;

    #[test]
    fn reads_a_model_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("robot.toml");
        fs::write(&path, ROVER).expect("write");

        let model = FileDescriptions::new(&path).fetch().expect("model");
        assert_eq!(model.name, "rover");
        assert_eq!(model.links.len(), 2);
        assert!(matches!(
            model.links[0].collisions[0].geometry,
            Some(Geometry::Box { .. })
        ));
        assert!(model.links[1].collisions.is_empty());
        assert!(modified(&path).is_some());
    }

    #[test]
    fn missing_or_broken_files_yield_nothing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("robot.toml");
        assert!(FileDescriptions::new(&path).fetch().is_none());
        assert!(modified(&path).is_none());

        fs::write(&path, "links = 3").expect("write");
        let err = read_model(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse robot model"));
    }
}
