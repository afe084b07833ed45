// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    convert::RgbImage,
    detector::{Detector, ScanKind, ScanResult},
};
use common::camera::MotionDetectionConfig;

const MOTION_INPUT_WIDTH: u32 = 300;
const MOTION_INPUT_HEIGHT: u32 = 300;

/// Built-in frame-differencing motion detector. Compares the luma of
/// consecutive scanned frames; a frame counts as motion when the
/// fraction of pixels whose delta exceeds `threshold` is above
/// `area`, sustained for `frames` consecutive scans.
pub struct MotionDetector {
    threshold: u8,
    area: f32,
    frames: u32,

    prev_luma: Option<Vec<u8>>,
    consecutive: u32,
    motion: bool,
}

impl MotionDetector {
    #[must_use]
    pub fn new(config: &MotionDetectionConfig) -> Self {
        Self {
            threshold: config.threshold,
            area: config.area,
            frames: config.frames,
            prev_luma: None,
            consecutive: 0,
            motion: false,
        }
    }

    #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
    fn changed_fraction(&self, prev: &[u8], current: &[u8]) -> f32 {
        let changed = prev
            .iter()
            .zip(current)
            .filter(|(a, b)| a.abs_diff(**b) > self.threshold)
            .count();
        changed as f32 / current.len() as f32
    }
}

impl Detector for MotionDetector {
    fn name(&self) -> &str {
        "motion"
    }

    fn kind(&self) -> ScanKind {
        ScanKind::Motion
    }

    fn input_size(&self) -> (u32, u32) {
        (MOTION_INPUT_WIDTH, MOTION_INPUT_HEIGHT)
    }

    fn infer(&mut self, frame: &RgbImage) -> ScanResult {
        let luma = frame.to_luma();

        if let Some(prev) = &self.prev_luma {
            if prev.len() == luma.len() && self.changed_fraction(prev, &luma) > self.area {
                self.consecutive += 1;
                if self.consecutive >= self.frames {
                    self.motion = true;
                }
            } else {
                self.consecutive = 0;
                self.motion = false;
            }
        }

        self.prev_luma = Some(luma);
        ScanResult::Motion(self.motion)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config(frames: u32) -> MotionDetectionConfig {
        MotionDetectionConfig {
            enable: true,
            scan_fps: 2.0,
            trigger_event_recording: false,
            threshold: 25,
            area: 0.05,
            frames,
        }
    }

    fn gray_frame(luma: u8) -> RgbImage {
        RgbImage::new(4, 4, vec![luma; 4 * 4 * 3])
    }

    #[test]
    fn test_motion_after_consecutive_frames() {
        let mut d = MotionDetector::new(&config(2));

        // First frame only seeds the state.
        assert_eq!(ScanResult::Motion(false), d.infer(&gray_frame(0)));
        // One changed frame is not enough with frames = 2.
        assert_eq!(ScanResult::Motion(false), d.infer(&gray_frame(200)));
        assert_eq!(ScanResult::Motion(true), d.infer(&gray_frame(0)));
    }

    #[test]
    fn test_motion_resets_on_still_frame() {
        let mut d = MotionDetector::new(&config(1));

        d.infer(&gray_frame(0));
        assert_eq!(ScanResult::Motion(true), d.infer(&gray_frame(200)));
        // Same frame again, no motion.
        assert_eq!(ScanResult::Motion(false), d.infer(&gray_frame(200)));
    }

    #[test]
    fn test_small_delta_below_threshold() {
        let mut d = MotionDetector::new(&config(1));

        d.infer(&gray_frame(100));
        assert_eq!(ScanResult::Motion(false), d.infer(&gray_frame(110)));
    }
}
