// SPDX-License-Identifier: GPL-2.0-or-later

use common::{LogLevel, camera::CameraConfig};
use serde::Deserialize;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tiers::TierConfig;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    pub storage: StorageConfig,

    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Where the external decoder writes segments before
    /// fragmentation.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Segment index database. Defaults to living on the first tier.
    #[serde(default)]
    pub database: Option<PathBuf>,

    pub tiers: Vec<TierConfig>,
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp/vigil")
}

impl StorageConfig {
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.tiers[0].path.join("vigil.db"))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file: {0}")]
    ReadFile(std::io::Error),

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no storage tiers configured")]
    NoTiers,

    #[error("duplicate camera id: '{0}'")]
    DuplicateCameraId(String),

    #[error("camera '{0}': recorder_keepalive requires motion detection")]
    KeepaliveWithoutMotion(String),

    #[error("camera '{0}': scan_on_motion_only requires motion detection")]
    ScanOnMotionOnlyWithoutMotion(String),
}

/// Loads and validates the config. Warnings are returned so the
/// caller can log them once the logger exists.
pub fn load_config(path: &Path) -> Result<(AppConfig, Vec<String>), ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
    let config: AppConfig = toml::from_str(&raw)?;
    let warnings = validate(&config)?;
    Ok((config, warnings))
}

fn validate(config: &AppConfig) -> Result<Vec<String>, ConfigError> {
    use ConfigError::*;
    if config.storage.tiers.is_empty() {
        return Err(NoTiers);
    }

    let mut warnings = Vec::new();
    let mut seen = HashSet::new();
    for camera in &config.cameras {
        if !seen.insert(camera.id.clone()) {
            return Err(DuplicateCameraId(camera.id.to_string()));
        }

        let has_motion = camera
            .motion_detection
            .as_ref()
            .is_some_and(|m| m.enable);
        if camera.recorder.recorder_keepalive && !has_motion {
            warnings.push(format!(
                "camera '{}': recorder_keepalive has no effect without motion detection",
                camera.id
            ));
        }
        if camera
            .object_detection
            .as_ref()
            .is_some_and(|o| o.enable && o.scan_on_motion_only)
            && !has_motion
        {
            return Err(ScanOnMotionOnlyWithoutMotion(camera.id.to_string()));
        }
    }

    let events_anywhere = config.storage.tiers.iter().any(|t| t.events.enabled());
    if !events_anywhere {
        warnings.push(
            "no tier has event retention configured, event recordings are only \
             bounded by disk space"
                .to_owned(),
        );
    }

    Ok(warnings)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn minimal() -> String {
        "
        [storage]
        [[storage.tiers]]
        path = \"/data/tier0\"
        [storage.tiers.events]
        max_age = { days = 7 }

        [[cameras]]
        id = \"cam1\"
        name = \"front\"
        [cameras.source]
        main_stream = \"rtsp://example.com/main\"
        "
        .to_owned()
    }

    #[test]
    fn test_parse_minimal() {
        let config: AppConfig = toml::from_str(&minimal()).unwrap();
        let warnings = validate(&config).unwrap();
        assert_eq!(LogLevel::Info, config.log_level);
        assert_eq!(1, config.cameras.len());
        assert_eq!(
            PathBuf::from("/data/tier0/vigil.db"),
            config.storage.database_path()
        );
        // Default keepalive without motion detection warns.
        assert_eq!(1, warnings.len());
    }

    #[test]
    fn test_no_tiers_rejected() {
        let raw = "
        [storage]
        tiers = []
        ";
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert!(matches!(validate(&config), Err(ConfigError::NoTiers)));
    }

    #[test]
    fn test_duplicate_camera_id_rejected() {
        let raw = minimal()
            + "
        [[cameras]]
        id = \"cam1\"
        name = \"front2\"
        [cameras.source]
        main_stream = \"rtsp://example.com/other\"
        ";
        let config: AppConfig = toml::from_str(&raw).unwrap();
        assert!(matches!(
            validate(&config),
            Err(ConfigError::DuplicateCameraId(_))
        ));
    }

    #[test]
    fn test_scan_on_motion_only_requires_motion() {
        let raw = minimal()
            + "
        [cameras.object_detection]
        scan_on_motion_only = true
        [[cameras.object_detection.labels]]
        label = \"person\"
        ";
        let config: AppConfig = toml::from_str(&raw).unwrap();
        assert!(matches!(
            validate(&config),
            Err(ConfigError::ScanOnMotionOnlyWithoutMotion(_))
        ));
    }
}
