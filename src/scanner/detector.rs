// SPDX-License-Identifier: GPL-2.0-or-later

use crate::convert::RgbImage;
use common::Detections;

/// What a scanner feeds and what kind of result it produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScanKind {
    Object,
    Motion,

    /// Exists when neither detector is configured. Off unless an
    /// external consumer subscribes to the feed.
    Passthrough,
}

impl ScanKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ScanKind::Object => "object",
            ScanKind::Motion => "motion",
            ScanKind::Passthrough => "passthrough",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ScanResult {
    Objects(Detections),
    Motion(bool),
    Passthrough,
}

/// Detector backend contract. Backends register a name, an input size
/// and an inference function at startup; the decoder worker is
/// generic over this interface so no runtime loading is involved.
///
/// `infer` may keep internal state (the motion detector compares
/// against the previous frame) but must not block on I/O.
pub trait Detector: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> ScanKind;

    /// (width, height) the input frame is resized to.
    fn input_size(&self) -> (u32, u32);

    fn infer(&mut self, frame: &RgbImage) -> ScanResult;
}

/// No-detector passthrough. Hands the frame through untouched for
/// live-view style consumers.
pub struct PassthroughDetector {
    width: u32,
    height: u32,
}

impl PassthroughDetector {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Detector for PassthroughDetector {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn kind(&self) -> ScanKind {
        ScanKind::Passthrough
    }

    fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn infer(&mut self, _frame: &RgbImage) -> ScanResult {
        ScanResult::Passthrough
    }
}
