// SPDX-License-Identifier: GPL-2.0-or-later

// Recording state machine. `tick` is pure over the injected clock so
// the scenarios around countdown, keepalive and manual overrides are
// tested with synthetic timestamps instead of real sleeps. The actor
// in the crate root executes the returned actions.
//
//   IDLE -- trigger --> RECORDING
//   RECORDING -- no trigger --> COUNTDOWN (stop at now + idle_timeout)
//   COUNTDOWN -- trigger --> RECORDING (countdown cleared)
//   COUNTDOWN -- deadline --> IDLE
//   RECORDING|COUNTDOWN -- max recording time --> IDLE (forced)
//   any -- manual override --> RECORDING (trigger MANUAL)

use crate::filter::ObjectFilters;
use common::{
    Detections, LogLevel,
    recording::TriggerType,
    time::{Duration, SECOND, UnixNano},
};

#[derive(Clone, Debug)]
pub struct StateConfig {
    pub idle_timeout: Duration,
    pub max_recording_time: Duration,
    pub recorder_keepalive: bool,
    pub max_recorder_keepalive: Duration,

    pub object_detection_enabled: bool,
    pub scan_on_motion_only: bool,

    pub motion_detection_enabled: bool,
    pub motion_trigger_recording: bool,
}

/// Scanner results drained since the previous tick.
#[derive(Clone, Debug, Default)]
pub struct TickInput {
    pub object_result: Option<Detections>,
    pub motion_result: Option<bool>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    StartRecording {
        trigger: TriggerType,
    },
    StopRecording,
    ArmObjectScanner(bool),
    ArmMotionScanner(bool),
    MotionStarted,
    MotionEnded,
    RecordObjects(Detections),
    Log(LogLevel, String),
}

pub struct NvrState {
    config: StateConfig,
    filters: ObjectFilters,

    is_recording: bool,
    trigger_type: Option<TriggerType>,
    recording_start: Option<UnixNano>,
    manual_duration: Option<Duration>,

    /// Deadline after which the recorder stops if nothing re-triggers.
    stop_recorder_at: Option<UnixNano>,

    motion_detected: bool,
    objects_in_fov: Detections,
    object_triggers: bool,

    /// Set while motion alone is holding an object recording open.
    motion_only_since: Option<UnixNano>,
    keepalive_capped: bool,

    last_countdown_log: Option<i64>,

    pending_manual_start: Option<Option<Duration>>,
    pending_manual_stop: bool,

    object_armed: Option<bool>,
    motion_armed: Option<bool>,
}

impl NvrState {
    #[must_use]
    pub fn new(config: StateConfig, filters: ObjectFilters) -> Self {
        Self {
            config,
            filters,
            is_recording: false,
            trigger_type: None,
            recording_start: None,
            manual_duration: None,
            stop_recorder_at: None,
            motion_detected: false,
            objects_in_fov: Vec::new(),
            object_triggers: false,
            motion_only_since: None,
            keepalive_capped: false,
            last_countdown_log: None,
            pending_manual_start: None,
            pending_manual_stop: false,
            object_armed: None,
            motion_armed: None,
        }
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    #[must_use]
    pub fn objects_in_fov(&self) -> &Detections {
        &self.objects_in_fov
    }

    pub fn request_manual_start(&mut self, duration: Option<Duration>) {
        self.pending_manual_start = Some(duration);
    }

    pub fn request_manual_stop(&mut self) {
        self.pending_manual_stop = true;
    }

    /// Used by the actor when a reconnect gap exceeded the idle
    /// timeout and the open event must close.
    pub fn force_stop(&mut self, reason: &str) -> Vec<Action> {
        if !self.is_recording {
            return Vec::new();
        }
        let mut actions = vec![Action::Log(LogLevel::Info, reason.to_owned())];
        actions.extend(self.stop());
        actions
    }

    #[must_use]
    pub fn tick(&mut self, now: UnixNano, input: &TickInput) -> Vec<Action> {
        let mut actions = Vec::new();

        // 1. Drain scanner results and apply the object filters.
        if let Some(motion) = input.motion_result {
            if motion != self.motion_detected {
                actions.push(if motion {
                    Action::MotionStarted
                } else {
                    Action::MotionEnded
                });
                self.motion_detected = motion;
            }
        }
        if let Some(raw) = &input.object_result {
            let (objects, triggers) = self.filters.apply(raw, self.motion_detected);
            if !objects.is_empty() {
                actions.push(Action::RecordObjects(objects.clone()));
            }
            self.objects_in_fov = objects;
            self.object_triggers = triggers;
        }

        // 2. Compute the trigger.
        let manual_start = self.pending_manual_start.take();
        let manual_stop = std::mem::take(&mut self.pending_manual_stop);

        if manual_stop && self.is_recording {
            actions.extend(self.stop());
        }

        let trigger = if manual_start.is_some() {
            Some(TriggerType::Manual)
        } else if self.object_triggers {
            Some(TriggerType::Object)
        } else if self.config.motion_trigger_recording && self.motion_detected {
            Some(TriggerType::Motion)
        } else {
            None
        };

        // 3. Record start/stop.
        match trigger {
            Some(trigger) if !self.is_recording => {
                let duration = manual_start.flatten();
                actions.extend(self.start(now, trigger, duration));
            }
            Some(TriggerType::Manual) if self.trigger_type != Some(TriggerType::Manual) => {
                actions.push(Action::Log(
                    LogLevel::Info,
                    "manual recording overrides active event recording".to_owned(),
                ));
                actions.extend(self.stop());
                actions.extend(self.start(now, TriggerType::Manual, manual_start.flatten()));
            }
            Some(_) => {
                // Re-armed.
                if let Some(duration) = manual_start {
                    self.manual_duration = duration;
                }
                self.clear_countdown();
            }
            None if self.is_recording => {
                self.run_countdown(now, &mut actions);
            }
            None => {}
        }

        // Hard upper bounds, independent of triggers.
        if self.is_recording {
            if let Some(start) = self.recording_start {
                let elapsed = now.sub(start).unwrap_or_default();
                if elapsed >= self.config.max_recording_time {
                    actions.push(Action::Log(
                        LogLevel::Info,
                        "max recording time exceeded".to_owned(),
                    ));
                    actions.extend(self.stop());
                } else if self.trigger_type == Some(TriggerType::Manual) {
                    if let Some(duration) = self.manual_duration {
                        if elapsed >= duration {
                            actions.extend(self.stop());
                        }
                    }
                }
            }
        }

        // 4. Scanner gating, recomputed at tick end.
        self.update_gating(&mut actions);

        actions
    }

    fn start(
        &mut self,
        now: UnixNano,
        trigger: TriggerType,
        manual_duration: Option<Duration>,
    ) -> Vec<Action> {
        self.is_recording = true;
        self.trigger_type = Some(trigger);
        self.recording_start = Some(now);
        self.manual_duration = manual_duration;
        self.clear_countdown();
        vec![Action::StartRecording { trigger }]
    }

    fn stop(&mut self) -> Vec<Action> {
        self.is_recording = false;
        self.trigger_type = None;
        self.recording_start = None;
        self.manual_duration = None;
        self.clear_countdown();
        vec![Action::StopRecording]
    }

    fn clear_countdown(&mut self) {
        self.stop_recorder_at = None;
        self.motion_only_since = None;
        self.keepalive_capped = false;
        self.last_countdown_log = None;
    }

    /// No trigger while recording: keepalive may hold the event open
    /// on motion alone, capped; otherwise the idle countdown runs.
    fn run_countdown(&mut self, now: UnixNano, actions: &mut Vec<Action>) {
        // Manual recordings stop on their duration or an explicit
        // request, never on the idle countdown.
        if self.trigger_type == Some(TriggerType::Manual) {
            return;
        }

        let keepalive_hold = self.config.recorder_keepalive
            && self.trigger_type == Some(TriggerType::Object)
            && !self.object_triggers
            && self.motion_detected;

        if keepalive_hold {
            let since = *self.motion_only_since.get_or_insert(now);
            let capped = now
                .sub(since)
                .is_some_and(|held| held > self.config.max_recorder_keepalive);
            if capped {
                if !self.keepalive_capped {
                    self.keepalive_capped = true;
                    actions.push(Action::Log(
                        LogLevel::Debug,
                        "max keepalive reached".to_owned(),
                    ));
                }
                // Force the countdown even though motion continues.
                if self.stop_recorder_at.is_none() {
                    self.stop_recorder_at = now.add_duration(self.config.idle_timeout);
                }
            } else {
                self.stop_recorder_at = None;
                self.last_countdown_log = None;
                return;
            }
        } else if self.stop_recorder_at.is_none() {
            self.stop_recorder_at = now.add_duration(self.config.idle_timeout);
        }

        let Some(stop_at) = self.stop_recorder_at else {
            return;
        };

        let seconds_left = stop_at.sub(now).map_or(0, |left| div_ceil(*left, SECOND)).max(0);
        if self.last_countdown_log != Some(seconds_left) {
            self.last_countdown_log = Some(seconds_left);
            actions.push(Action::Log(
                LogLevel::Debug,
                format!("stopping recording in {seconds_left}s"),
            ));
        }
        if seconds_left == 0 {
            actions.extend(self.stop());
        }
    }

    fn update_gating(&mut self, actions: &mut Vec<Action>) {
        let object_on = self.config.object_detection_enabled
            && (!self.config.scan_on_motion_only || self.motion_detected);
        if self.object_armed != Some(object_on) {
            self.object_armed = Some(object_on);
            actions.push(Action::ArmObjectScanner(object_on));
        }

        // Motion stays armed while it can start a recording or gate
        // the object scanner; otherwise it is only armed while a
        // recording needs it for keepalive.
        let motion_on = self.config.motion_detection_enabled
            && (self.config.motion_trigger_recording
                || self.config.scan_on_motion_only
                || (self.is_recording && self.config.recorder_keepalive));
        if self.motion_armed != Some(motion_on) {
            self.motion_armed = Some(motion_on);
            actions.push(Action::ArmMotionScanner(motion_on));
        }
    }
}

fn div_ceil(a: i64, b: i64) -> i64 {
    (a + (b - 1)) / b
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use common::{Detection, RectangleNormalized, camera::LabelFilterConfig};
    use pretty_assertions::assert_eq;

    fn person() -> Detection {
        Detection {
            label: "person".parse().unwrap(),
            score: 0.9,
            region: RectangleNormalized {
                x: 0.1,
                y: 0.1,
                width: 0.3,
                height: 0.5,
            },
        }
    }

    fn filters() -> ObjectFilters {
        ObjectFilters::new(&[LabelFilterConfig {
            label: "person".to_owned(),
            confidence: 0.8,
            width_min: 0.0,
            width_max: 1.0,
            height_min: 0.0,
            height_max: 1.0,
            trigger_event_recording: true,
            require_motion: false,
        }])
    }

    fn config() -> StateConfig {
        StateConfig {
            idle_timeout: Duration::from_secs(2),
            max_recording_time: Duration::from_secs(300),
            recorder_keepalive: false,
            max_recorder_keepalive: Duration::from_secs(30),
            object_detection_enabled: true,
            scan_on_motion_only: false,
            motion_detection_enabled: false,
            motion_trigger_recording: false,
        }
    }

    fn at(secs_tenths: i64) -> UnixNano {
        UnixNano::new(secs_tenths * SECOND / 10)
    }

    fn objects(detections: Vec<Detection>) -> TickInput {
        TickInput {
            object_result: Some(detections),
            motion_result: None,
        }
    }

    fn starts(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::StartRecording { .. }))
            .count()
    }

    fn stops(actions: &[Action]) -> usize {
        actions.iter().filter(|a| **a == Action::StopRecording).count()
    }

    // Object fires once, then nothing. Recording starts immediately
    // and stops after the idle timeout.
    #[test]
    fn test_object_only_short_event() {
        let mut state = NvrState::new(config(), filters());

        let actions = state.tick(at(0), &objects(vec![person()]));
        assert_eq!(1, starts(&actions));
        assert!(actions.contains(&Action::StartRecording {
            trigger: TriggerType::Object
        }));

        // 5 fps, no further detections.
        let mut stopped_at = None;
        for tick in 1..=30 {
            let actions = state.tick(at(tick * 2), &objects(vec![]));
            assert_eq!(0, starts(&actions));
            if stops(&actions) == 1 {
                stopped_at = Some(tick * 2);
                break;
            }
        }
        // First idle tick at t=0.2s arms the countdown for t=2.2s.
        assert_eq!(Some(22), stopped_at);
        assert!(!state.is_recording());
    }

    // Feeding the same result twice per tick boundary must not start
    // a second recording.
    #[test]
    fn test_idempotent_under_stutter() {
        let mut state = NvrState::new(config(), filters());

        let first = state.tick(at(0), &objects(vec![person()]));
        let second = state.tick(at(1), &objects(vec![person()]));
        assert_eq!(1, starts(&first));
        assert_eq!(0, starts(&second));
    }

    // Object disappears and reappears before the countdown elapses.
    #[test]
    fn test_countdown_reset() {
        let mut state = NvrState::new(config(), filters());

        // Frame 0: object.
        let actions = state.tick(at(0), &objects(vec![person()]));
        assert_eq!(1, starts(&actions));
        // Frame 1: gone, countdown armed for t=0.2+2.
        let actions = state.tick(at(2), &objects(vec![]));
        assert_eq!(0, stops(&actions));
        // Frame 3: back, countdown cleared.
        let actions = state.tick(at(6), &objects(vec![person()]));
        assert_eq!(0, starts(&actions));
        assert_eq!(0, stops(&actions));
        // Frame 4: gone again, new countdown from t=0.8.
        let actions = state.tick(at(8), &objects(vec![]));
        assert_eq!(0, stops(&actions));

        // The old deadline (2.2s) passes without stopping.
        let actions = state.tick(at(24), &objects(vec![]));
        assert_eq!(0, stops(&actions));
        // The new deadline (2.8s) fires.
        let actions = state.tick(at(28), &objects(vec![]));
        assert_eq!(1, stops(&actions));
    }

    // Motion keepalive holds the recording after the object is gone,
    // but only up to the cap.
    #[test]
    fn test_keepalive_capped() {
        let mut cfg = config();
        cfg.recorder_keepalive = true;
        cfg.max_recorder_keepalive = Duration::from_secs(1);
        cfg.motion_detection_enabled = true;
        let mut state = NvrState::new(cfg, filters());

        // Object and motion at t=0.
        let actions = state.tick(
            at(0),
            &TickInput {
                object_result: Some(vec![person()]),
                motion_result: Some(true),
            },
        );
        assert_eq!(1, starts(&actions));
        // Motion scanner armed for keepalive.
        assert!(actions.contains(&Action::ArmMotionScanner(true)));

        // Object gone from t=1, motion continues.
        let mut stopped_at = None;
        let mut capped_logged = false;
        for tick in 5..=50 {
            let actions = state.tick(
                at(tick * 2),
                &TickInput {
                    object_result: Some(vec![]),
                    motion_result: Some(true),
                },
            );
            if actions.contains(&Action::Log(
                LogLevel::Debug,
                "max keepalive reached".to_owned(),
            )) {
                capped_logged = true;
            }
            if stops(&actions) == 1 {
                stopped_at = Some(tick * 2);
                // Motion disarmed after stop.
                assert!(actions.contains(&Action::ArmMotionScanner(false)));
                break;
            }
        }
        assert!(capped_logged);
        // Cap exceeded just after t=2 (object gone at 1.0, cap 1s),
        // idle timeout of 2s lands the stop at ~4.2s.
        assert_eq!(Some(42), stopped_at);
    }

    // Manual request overrides an active object event: stop and start
    // in the same tick, then stop again when the duration elapses.
    #[test]
    fn test_manual_override() {
        let mut state = NvrState::new(config(), filters());

        let actions = state.tick(at(0), &objects(vec![person()]));
        assert_eq!(1, starts(&actions));

        state.request_manual_start(Some(Duration::from_secs(2)));
        let actions = state.tick(at(2), &objects(vec![person()]));
        assert_eq!(1, stops(&actions));
        assert_eq!(1, starts(&actions));
        assert!(actions.contains(&Action::StartRecording {
            trigger: TriggerType::Manual
        }));

        // The object trigger no longer applies a countdown to the
        // manual recording.
        let actions = state.tick(at(12), &objects(vec![]));
        assert_eq!(0, stops(&actions));

        // Manual duration of 2s elapsed.
        let actions = state.tick(at(22), &objects(vec![]));
        assert_eq!(1, stops(&actions));
    }

    #[test]
    fn test_manual_stop_request() {
        let mut state = NvrState::new(config(), filters());
        state.request_manual_start(None);
        let actions = state.tick(at(0), &TickInput::default());
        assert_eq!(1, starts(&actions));

        // Null duration runs until explicitly stopped.
        let actions = state.tick(at(100), &TickInput::default());
        assert_eq!(0, stops(&actions));

        state.request_manual_stop();
        let actions = state.tick(at(101), &TickInput::default());
        assert_eq!(1, stops(&actions));
    }

    #[test]
    fn test_max_recording_time() {
        let mut cfg = config();
        cfg.max_recording_time = Duration::from_secs(10);
        let mut state = NvrState::new(cfg, filters());

        state.tick(at(0), &objects(vec![person()]));
        // Continuously re-triggered, but the hard bound wins.
        let mut stopped = false;
        for tick in 1..=60 {
            let actions = state.tick(at(tick * 2), &objects(vec![person()]));
            if stops(&actions) == 1 {
                assert!(actions.contains(&Action::Log(
                    LogLevel::Info,
                    "max recording time exceeded".to_owned()
                )));
                stopped = true;
                assert_eq!(100, tick * 2);
                break;
            }
        }
        assert!(stopped);
    }

    #[test]
    fn test_motion_trigger_recording() {
        let mut cfg = config();
        cfg.object_detection_enabled = false;
        cfg.motion_detection_enabled = true;
        cfg.motion_trigger_recording = true;
        let mut state = NvrState::new(cfg, filters());

        let actions = state.tick(
            at(0),
            &TickInput {
                object_result: None,
                motion_result: Some(true),
            },
        );
        assert!(actions.contains(&Action::MotionStarted));
        assert!(actions.contains(&Action::StartRecording {
            trigger: TriggerType::Motion
        }));

        let actions = state.tick(
            at(2),
            &TickInput {
                object_result: None,
                motion_result: Some(false),
            },
        );
        assert!(actions.contains(&Action::MotionEnded));
        // Countdown starts once motion is gone.
        let actions = state.tick(at(24), &TickInput::default());
        assert_eq!(1, stops(&actions));
    }

    #[test]
    fn test_scan_on_motion_only_gates_object_scanner() {
        let mut cfg = config();
        cfg.scan_on_motion_only = true;
        cfg.motion_detection_enabled = true;
        let mut state = NvrState::new(cfg, filters());

        let actions = state.tick(at(0), &TickInput::default());
        assert!(actions.contains(&Action::ArmObjectScanner(false)));
        assert!(actions.contains(&Action::ArmMotionScanner(true)));

        let actions = state.tick(
            at(2),
            &TickInput {
                object_result: None,
                motion_result: Some(true),
            },
        );
        assert!(actions.contains(&Action::ArmObjectScanner(true)));
    }

    #[test]
    fn test_force_stop() {
        let mut state = NvrState::new(config(), filters());
        state.tick(at(0), &objects(vec![person()]));
        assert!(state.is_recording());

        let actions = state.force_stop("reconnect gap exceeded idle timeout");
        assert_eq!(1, stops(&actions));
        assert!(!state.is_recording());

        assert!(state.force_stop("again").is_empty());
    }
}
