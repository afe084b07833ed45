// SPDX-License-Identifier: GPL-2.0-or-later

use common::{Detections, camera::LabelFilterConfig};
use std::collections::HashMap;

/// Per-label object filters. A detection is dropped when its label is
/// not configured, its confidence is below threshold, its relative
/// size falls outside the configured bounds, or the label requires
/// motion and none is currently present.
pub struct ObjectFilters(HashMap<String, LabelFilterConfig>);

impl ObjectFilters {
    #[must_use]
    pub fn new(labels: &[LabelFilterConfig]) -> Self {
        Self(
            labels
                .iter()
                .map(|f| (f.label.clone(), f.clone()))
                .collect(),
        )
    }

    /// Returns the detections that pass and whether any of them has
    /// `trigger_event_recording` set.
    #[must_use]
    pub fn apply(&self, detections: &Detections, motion_detected: bool) -> (Detections, bool) {
        let mut passed = Vec::new();
        let mut triggers = false;

        for detection in detections {
            let Some(filter) = self.0.get(&*detection.label) else {
                continue;
            };
            if detection.score < filter.confidence {
                continue;
            }
            let width = detection.region.width;
            let height = detection.region.height;
            if width < filter.width_min || width > filter.width_max {
                continue;
            }
            if height < filter.height_min || height > filter.height_max {
                continue;
            }
            if filter.require_motion && !motion_detected {
                continue;
            }

            if filter.trigger_event_recording {
                triggers = true;
            }
            passed.push(detection.clone());
        }

        (passed, triggers)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use common::{Detection, RectangleNormalized};
    use pretty_assertions::assert_eq;

    fn filter(label: &str) -> LabelFilterConfig {
        LabelFilterConfig {
            label: label.to_owned(),
            confidence: 0.8,
            width_min: 0.0,
            width_max: 1.0,
            height_min: 0.0,
            height_max: 1.0,
            trigger_event_recording: true,
            require_motion: false,
        }
    }

    fn detection(label: &str, score: f32, width: f32) -> Detection {
        Detection {
            label: label.parse().unwrap(),
            score,
            region: RectangleNormalized {
                x: 0.1,
                y: 0.1,
                width,
                height: 0.5,
            },
        }
    }

    #[test]
    fn test_label_not_configured() {
        let filters = ObjectFilters::new(&[filter("person")]);
        let (passed, triggers) = filters.apply(&vec![detection("cat", 0.9, 0.5)], false);
        assert!(passed.is_empty());
        assert!(!triggers);
    }

    #[test]
    fn test_confidence_threshold() {
        let filters = ObjectFilters::new(&[filter("person")]);
        let (passed, _) = filters.apply(&vec![detection("person", 0.7, 0.5)], false);
        assert!(passed.is_empty());

        let (passed, triggers) = filters.apply(&vec![detection("person", 0.9, 0.5)], false);
        assert_eq!(1, passed.len());
        assert!(triggers);
    }

    #[test]
    fn test_size_bounds() {
        let mut f = filter("person");
        f.width_min = 0.2;
        f.width_max = 0.8;
        let filters = ObjectFilters::new(&[f]);

        let (passed, _) = filters.apply(&vec![detection("person", 0.9, 0.1)], false);
        assert!(passed.is_empty());
        let (passed, _) = filters.apply(&vec![detection("person", 0.9, 0.9)], false);
        assert!(passed.is_empty());
        let (passed, _) = filters.apply(&vec![detection("person", 0.9, 0.5)], false);
        assert_eq!(1, passed.len());
    }

    #[test]
    fn test_require_motion() {
        let mut f = filter("person");
        f.require_motion = true;
        let filters = ObjectFilters::new(&[f]);

        let (passed, triggers) = filters.apply(&vec![detection("person", 0.9, 0.5)], false);
        assert!(passed.is_empty());
        assert!(!triggers);

        let (passed, triggers) = filters.apply(&vec![detection("person", 0.9, 0.5)], true);
        assert_eq!(1, passed.len());
        assert!(triggers);
    }

    #[test]
    fn test_non_triggering_label_passes_without_trigger() {
        let mut f = filter("person");
        f.trigger_event_recording = false;
        let filters = ObjectFilters::new(&[f]);

        let (passed, triggers) = filters.apply(&vec![detection("person", 0.9, 0.5)], false);
        assert_eq!(1, passed.len());
        assert!(!triggers);
    }
}
