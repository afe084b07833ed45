// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    CameraId,
    recording::{Category, RecordingInfo, Subcategory},
    time::UnixNano,
};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, ops::Deref, path::PathBuf, str::FromStr, sync::Arc};
use thiserror::Error;
use tokio::sync::broadcast;

pub type Detections = Vec<Detection>;

/// A single detection reported by an object detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: Label,
    pub score: f32,
    pub region: RectangleNormalized,
}

/// Rectangle with all coordinates relative to the frame size, range [0, 1].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RectangleNormalized {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

pub type Labels = Vec<Label>;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Label(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseLabelError {
    #[error("bad char: '{0}'")]
    BadChar(char),
}

impl FromStr for Label {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for c in s.chars() {
            if c != ' ' && !c.is_alphanumeric() {
                return Err(Self::Err::BadChar(c));
            }
        }
        Ok(Self(s.to_owned()))
    }
}

impl Serialize for Label {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl Deref for Label {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Connected,
    Disconnected,
}

impl CameraStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraStatus::Connected => "connected",
            CameraStatus::Disconnected => "disconnected",
        }
    }
}

/// Events published between components. All coupling between the
/// pipeline stages goes through this bus or through queues, never
/// through synchronous calls.
#[derive(Clone, Debug)]
pub enum BusEvent {
    CameraStatus {
        camera_id: CameraId,
        status: CameraStatus,
    },
    CameraStarted {
        camera_id: CameraId,
    },
    CameraStopped {
        camera_id: CameraId,
    },
    RecorderStart {
        camera_id: CameraId,
        recording: RecordingInfo,
    },
    RecorderStop {
        camera_id: CameraId,
        recording: RecordingInfo,
    },
    RecorderComplete {
        camera_id: CameraId,
        recording: RecordingInfo,
    },
    FileCreated {
        camera_id: CameraId,
        category: Category,
        subcategory: Subcategory,
        file_name: String,
        path: PathBuf,
        time: UnixNano,
    },
    FileDeleted {
        camera_id: CameraId,
        category: Category,
        subcategory: Subcategory,
        file_name: String,
        path: PathBuf,
    },
    CheckTier {
        camera_id: CameraId,
        tier_id: usize,
        category: Category,
        subcategory: Subcategory,
    },
}

const EVENT_BUS_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct EventBus(broadcast::Sender<BusEvent>);

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self(tx)
    }

    /// Only fails if there are no subscribers, which is fine.
    pub fn send(&self, event: BusEvent) {
        _ = self.0.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.0.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub type ArcEventBus = Arc<EventBus>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_label() {
        Label::from_str("person").unwrap();
        Label::from_str("license plate").unwrap();
        Label::from_str("a!").unwrap_err();
    }

    #[tokio::test]
    async fn test_event_bus() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.send(BusEvent::CameraStarted {
            camera_id: "cam1".parse().unwrap(),
        });

        let got = rx.recv().await.unwrap();
        assert!(matches!(got, BusEvent::CameraStarted { .. }));
    }
}
