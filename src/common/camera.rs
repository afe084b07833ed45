// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{CameraId, CameraName};
use serde::Deserialize;
use url::Url;

/// Full per-camera configuration. Deserialized from the config file
/// and validated before any camera starts.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    pub id: CameraId,
    pub name: CameraName,

    #[serde(default = "default_true")]
    pub enable: bool,

    pub source: SourceConfig,

    #[serde(default)]
    pub recorder: RecorderConfig,

    #[serde(default)]
    pub object_detection: Option<ObjectDetectionConfig>,

    #[serde(default)]
    pub motion_detection: Option<MotionDetectionConfig>,

    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
}

impl CameraConfig {
    /// True when a substream supplies the raw-frame pipe while the
    /// main stream supplies only the segment chain.
    #[must_use]
    pub fn has_sub_stream(&self) -> bool {
        self.source.sub_stream.is_some()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub main_stream: Url,

    #[serde(default)]
    pub sub_stream: Option<Url>,

    /// Operator overrides used when the probe fails or returns zeros.
    #[serde(default)]
    pub width: Option<u32>,

    #[serde(default)]
    pub height: Option<u32>,

    #[serde(default)]
    pub fps: Option<f64>,

    #[serde(default)]
    pub codec: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RecorderConfig {
    /// Target duration of each closed MP4 segment in seconds.
    pub segment_length: u32,

    /// Seconds of pre-roll included in an event recording.
    pub lookback: u32,

    /// Seconds of silence after which an active recording is stopped.
    pub idle_timeout: u32,

    /// Hard upper bound on a single recording in seconds.
    pub max_recording_time: u32,

    /// Allow motion alone to hold an object-triggered recording open.
    pub recorder_keepalive: bool,

    /// Cap on the motion-only extension in seconds.
    pub max_recorder_keepalive: u32,

    /// Keep the continuous segment buffer even outside events.
    pub continuous_recording: bool,

    /// Materialize a single-file MP4 per event recording.
    pub create_event_clip: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            segment_length: 5,
            lookback: 5,
            idle_timeout: 10,
            max_recording_time: 300,
            recorder_keepalive: true,
            max_recorder_keepalive: 30,
            continuous_recording: true,
            create_event_clip: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct FfmpegConfig {
    pub loglevel: String,

    /// Hardware decoder selection for the input branch.
    pub hwaccel: HwAccel,

    /// Stall timeout for the RTSP input in seconds.
    pub stimeout: u32,

    /// stderr substrings that trigger a retry instead of a fatal error.
    pub recoverable_errors: Vec<String>,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            loglevel: "error".to_owned(),
            hwaccel: HwAccel::None,
            stimeout: 5,
            recoverable_errors: default_recoverable_errors(),
        }
    }
}

fn default_recoverable_errors() -> Vec<String> {
    [
        "error while decoding MB",
        "Application provided invalid, non monotonically increasing dts to muxer",
        "Last message repeated",
        "non-existing PPS 0 referenced",
        "decode_slice_header error",
        "no frame!",
    ]
    .iter()
    .map(|s| (*s).to_owned())
    .collect()
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    #[default]
    None,
    Cuda,
    Vaapi,
    Rpi,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ObjectDetectionConfig {
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Requested detector invocations per second. Clamped to the
    /// camera output fps at runtime.
    #[serde(default = "default_object_scan_fps")]
    pub scan_fps: f64,

    /// Only scan for objects while motion is present.
    #[serde(default = "default_true")]
    pub scan_on_motion_only: bool,

    pub labels: Vec<LabelFilterConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LabelFilterConfig {
    pub label: String,

    #[serde(default = "default_confidence")]
    pub confidence: f32,

    #[serde(default)]
    pub width_min: f32,

    #[serde(default = "default_one")]
    pub width_max: f32,

    #[serde(default)]
    pub height_min: f32,

    #[serde(default = "default_one")]
    pub height_max: f32,

    #[serde(default = "default_true")]
    pub trigger_event_recording: bool,

    /// Ignore this label unless motion is also currently present.
    #[serde(default)]
    pub require_motion: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MotionDetectionConfig {
    #[serde(default = "default_true")]
    pub enable: bool,

    #[serde(default = "default_motion_scan_fps")]
    pub scan_fps: f64,

    /// Motion alone may start an event recording.
    #[serde(default)]
    pub trigger_event_recording: bool,

    /// Per-pixel luma delta before a pixel counts as changed.
    #[serde(default = "default_threshold")]
    pub threshold: u8,

    /// Fraction of changed pixels before a frame counts as motion.
    #[serde(default = "default_area")]
    pub area: f32,

    /// Consecutive motion frames before motion is reported.
    #[serde(default = "default_motion_frames")]
    pub frames: u32,
}

fn default_true() -> bool {
    true
}

fn default_one() -> f32 {
    1.0
}

fn default_confidence() -> f32 {
    0.8
}

fn default_object_scan_fps() -> f64 {
    1.0
}

fn default_motion_scan_fps() -> f64 {
    2.0
}

fn default_threshold() -> u8 {
    25
}

fn default_area() -> f32 {
    0.08
}

fn default_motion_frames() -> u32 {
    3
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_camera_config_minimal() {
        let raw = "
            id = \"cam1\"
            name = \"front\"
            [source]
            main_stream = \"rtsp://example.com/main\"
        ";
        let config: CameraConfig = toml::from_str(raw).unwrap();
        assert_eq!("cam1", &*config.id);
        assert!(config.enable);
        assert!(!config.has_sub_stream());
        assert_eq!(5, config.recorder.segment_length);
        assert_eq!(10, config.recorder.idle_timeout);
        assert!(config.object_detection.is_none());
    }

    #[test]
    fn test_camera_config_full() {
        let raw = "
            id = \"cam2\"
            name = \"back\"
            enable = true

            [source]
            main_stream = \"rtsp://example.com/main\"
            sub_stream = \"rtsp://example.com/sub\"
            width = 1920
            height = 1080
            fps = 5.0

            [recorder]
            segment_length = 5
            lookback = 5
            idle_timeout = 2
            max_recording_time = 60
            recorder_keepalive = true
            max_recorder_keepalive = 1
            continuous_recording = true
            create_event_clip = true

            [object_detection]
            scan_fps = 1.0
            scan_on_motion_only = true
            [[object_detection.labels]]
            label = \"person\"
            confidence = 0.7
            require_motion = true

            [motion_detection]
            scan_fps = 2.0
            trigger_event_recording = false
        ";
        let config: CameraConfig = toml::from_str(raw).unwrap();
        assert!(config.has_sub_stream());
        let od = config.object_detection.unwrap();
        assert_eq!(1, od.labels.len());
        assert!(od.labels[0].require_motion);
        assert_eq!(0.7, od.labels[0].confidence);
        assert_eq!(1.0, od.labels[0].width_max);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let raw = "
            id = \"cam1\"
            name = \"front\"
            bogus = 1
            [source]
            main_stream = \"rtsp://example.com/main\"
        ";
        toml::from_str::<CameraConfig>(raw).unwrap_err();
    }
}
