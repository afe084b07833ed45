// SPDX-License-Identifier: GPL-2.0-or-later

use crate::time::UnixNano;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr};
use thiserror::Error;

/// What caused an event recording to start.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Object,
    Motion,
    Manual,
}

impl TriggerType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Object => "object",
            TriggerType::Motion => "motion",
            TriggerType::Manual => "manual",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown trigger type: '{0}'")]
pub struct ParseTriggerTypeError(String);

impl FromStr for TriggerType {
    type Err = ParseTriggerTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "object" => Ok(TriggerType::Object),
            "motion" => Ok(TriggerType::Motion),
            "manual" => Ok(TriggerType::Manual),
            _ => Err(ParseTriggerTypeError(s.to_owned())),
        }
    }
}

/// Top-level storage category a file belongs to.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Recorder,
    Snapshots,
}

impl Category {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Recorder => "recorder",
            Category::Snapshots => "snapshots",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown category: '{0}'")]
pub struct ParseCategoryError(String);

impl FromStr for Category {
    type Err = ParseCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recorder" => Ok(Category::Recorder),
            "snapshots" => Ok(Category::Snapshots),
            _ => Err(ParseCategoryError(s.to_owned())),
        }
    }
}

/// Second-level storage category. Snapshots are further split by the
/// detector domain that produced them.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subcategory {
    Segments,
    EventClips,
    Thumbnails,
    Domain(String),
}

impl Subcategory {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Subcategory::Segments => "segments",
            Subcategory::EventClips => "event_clips",
            Subcategory::Thumbnails => "thumbnails",
            Subcategory::Domain(v) => v,
        }
    }
}

impl FromStr for Subcategory {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "segments" => Subcategory::Segments,
            "event_clips" => Subcategory::EventClips,
            "thumbnails" => Subcategory::Thumbnails,
            v => Subcategory::Domain(v.to_owned()),
        })
    }
}

/// Snapshot of a recording row, carried on recorder lifecycle events.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordingInfo {
    pub id: i64,
    pub start_time: UnixNano,
    pub end_time: Option<UnixNano>,
    pub trigger_type: TriggerType,
    pub trigger_id: Option<i64>,
    pub thumbnail_path: PathBuf,
    pub clip_path: Option<PathBuf>,
}
