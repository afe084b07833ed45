// SPDX-License-Identifier: GPL-2.0-or-later

use crate::convert::{ConvertError, RgbImage, nv12_to_rgb, resize};
use bytes::Bytes;
use common::time::UnixNano;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};

/// One decoded picture in planar NV12 at the source resolution.
/// Reference-shared across scanners for one tick; nobody mutates the
/// raw payload and the buffer drops with the last clone. The RGB
/// decode happens at most once, resized variants are cached by input
/// size so scanners with identical models share one resize.
#[derive(Clone)]
pub struct Frame(Arc<FrameInner>);

struct FrameInner {
    raw: Bytes,
    width: u32,
    height: u32,
    time: UnixNano,

    rgb: OnceLock<Result<Arc<RgbImage>, ConvertError>>,
    resized: Mutex<HashMap<(u32, u32), Arc<RgbImage>>>,
}

impl Frame {
    #[must_use]
    pub fn new(raw: Bytes, width: u32, height: u32, time: UnixNano) -> Self {
        Self(Arc::new(FrameInner {
            raw,
            width,
            height,
            time,
            rgb: OnceLock::new(),
            resized: Mutex::new(HashMap::new()),
        }))
    }

    #[must_use]
    pub fn raw(&self) -> &Bytes {
        &self.0.raw
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.0.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.0.height
    }

    #[must_use]
    pub fn time(&self) -> UnixNano {
        self.0.time
    }

    /// Lazy NV12 to RGB conversion, computed once per frame.
    pub fn decode_once(&self) -> Result<Arc<RgbImage>, ConvertError> {
        self.0
            .rgb
            .get_or_init(|| {
                nv12_to_rgb(&self.0.raw, self.0.width, self.0.height).map(Arc::new)
            })
            .clone()
    }

    /// Resized RGB view for a detector input size.
    pub fn resized(&self, width: u32, height: u32) -> Result<Arc<RgbImage>, ConvertError> {
        let decoded = self.decode_once()?;
        let mut cache = self.0.resized.lock().expect("not poisoned");
        if let Some(cached) = cache.get(&(width, height)) {
            return Ok(cached.clone());
        }
        let resized = Arc::new(resize(&decoded, width, height));
        cache.insert((width, height), resized.clone());
        Ok(resized)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_frame() -> Frame {
        let mut raw = vec![128u8; 4 * 2];
        raw.extend(vec![128u8; 4]);
        Frame::new(Bytes::from(raw), 4, 2, UnixNano::new(7))
    }

    #[test]
    fn test_decode_once_shares_result() {
        let frame = test_frame();
        let a = frame.decode_once().unwrap();
        let b = frame.decode_once().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_resized_cached_by_size() {
        let frame = test_frame();
        let a = frame.resized(2, 2).unwrap();
        let b = frame.resized(2, 2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = frame.resized(4, 2).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_decode_bad_buffer() {
        let frame = Frame::new(Bytes::from_static(&[1, 2, 3]), 4, 2, UnixNano::new(0));
        frame.decode_once().unwrap_err();
        // The failure is cached too.
        frame.decode_once().unwrap_err();
    }

    #[test]
    fn test_attributes() {
        let frame = test_frame();
        assert_eq!(4, frame.width());
        assert_eq!(2, frame.height());
        assert_eq!(UnixNano::new(7), frame.time());
    }
}
