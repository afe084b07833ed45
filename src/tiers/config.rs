// SPDX-License-Identifier: GPL-2.0-or-later

use bytesize::{GB, MB};
use common::time::{Duration, HOUR, MINUTE};
use serde::Deserialize;
use std::path::PathBuf;

/// One storage tier. Tier order in the config file is the migration
/// order; the last tier's overflow is deletion.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TierConfig {
    pub path: PathBuf,

    /// Use the polling watcher backend instead of inotify.
    #[serde(default)]
    pub poll: bool,

    /// Drain this tier completely on shutdown. Escape hatch for
    /// RAM-disk first tiers.
    #[serde(default)]
    pub move_on_shutdown: bool,

    /// Sweep interval in seconds.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Files handled per batch before the sweep yields.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Retention for continuous footage.
    #[serde(default)]
    pub continuous: RetentionConfig,

    /// Retention for event recordings.
    #[serde(default)]
    pub events: RetentionConfig,

    /// Retention for detector snapshots.
    #[serde(default)]
    pub snapshots: RetentionConfig,
}

fn default_check_interval() -> u64 {
    60
}

fn default_batch_size() -> usize {
    100
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RetentionConfig {
    pub max_age: Option<AgeConfig>,
    pub min_age: Option<AgeConfig>,
    pub max_size: Option<SizeConfig>,
    pub min_size: Option<SizeConfig>,
}

impl RetentionConfig {
    /// A rule set with nothing configured is disabled for its role.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.max_age.is_some()
            || self.min_age.is_some()
            || self.max_size.is_some()
            || self.min_size.is_some()
    }

    #[must_use]
    pub fn params(&self) -> RetentionParams {
        RetentionParams {
            max_bytes: self.max_size.as_ref().map_or(0, SizeConfig::as_bytes),
            min_bytes: self.min_size.as_ref().map_or(0, SizeConfig::as_bytes),
            max_age: self.max_age.as_ref().map(AgeConfig::as_duration),
            min_age: self
                .min_age
                .as_ref()
                .map(AgeConfig::as_duration)
                .unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct AgeConfig {
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
}

impl AgeConfig {
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::new(
            i64::from(self.days) * 24 * HOUR
                + i64::from(self.hours) * HOUR
                + i64::from(self.minutes) * MINUTE,
        )
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct SizeConfig {
    pub gb: f64,
    pub mb: f64,
}

impl SizeConfig {
    #[must_use]
    #[allow(
        clippy::as_conversions,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn as_bytes(&self) -> u64 {
        (self.gb * GB as f64 + self.mb * MB as f64) as u64
    }
}

/// Resolved retention bounds. Zero bytes or a missing age means the
/// bound is not configured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetentionParams {
    pub max_bytes: u64,
    pub min_bytes: u64,
    pub max_age: Option<Duration>,
    pub min_age: Duration,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use common::time::SECOND;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tier_config_defaults() {
        let raw = "path = \"/data/tier0\"";
        let config: TierConfig = toml::from_str(raw).unwrap();
        assert_eq!(PathBuf::from("/data/tier0"), config.path);
        assert!(!config.poll);
        assert!(!config.move_on_shutdown);
        assert_eq!(60, config.check_interval);
        assert_eq!(100, config.batch_size);
        assert!(!config.continuous.enabled());
        assert!(!config.events.enabled());
    }

    #[test]
    fn test_retention_params() {
        let raw = "
            path = \"/data/tier0\"
            [events]
            max_age = { days = 7 }
            max_size = { gb = 1, mb = 500 }
            min_age = { minutes = 5 }
        ";
        let config: TierConfig = toml::from_str(raw).unwrap();
        assert!(config.events.enabled());
        let params = config.events.params();
        assert_eq!(1_500_000_000, params.max_bytes);
        assert_eq!(0, params.min_bytes);
        assert_eq!(Some(Duration::new(7 * 24 * HOUR)), params.max_age);
        assert_eq!(Duration::new(5 * MINUTE), params.min_age);
    }

    #[test]
    fn test_age_config_as_duration() {
        let age = AgeConfig {
            days: 1,
            hours: 2,
            minutes: 3,
        };
        assert_eq!(
            Duration::new((26 * 60 + 3) * 60 * SECOND),
            age.as_duration()
        );
    }
}
