// SPDX-License-Identifier: GPL-2.0-or-later

use thiserror::Error;

/// Packed RGB24 image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RgbImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl RgbImage {
    #[must_use]
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            (width as usize) * (height as usize) * 3,
            "rgb buffer size"
        );
        Self {
            width,
            height,
            data,
        }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Average of the three channels per pixel.
    #[must_use]
    pub fn to_luma(&self) -> Vec<u8> {
        self.data
            .chunks_exact(3)
            .map(|px| {
                let sum = u16::from(px[0]) + u16::from(px[1]) + u16::from(px[2]);
                u8::try_from(sum / 3).expect("average of three u8 fits u8")
            })
            .collect()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("bad nv12 buffer size: got {got}, want {want}")]
    BadBufferSize { got: usize, want: usize },

    #[error("odd frame dimensions: {0}x{1}")]
    OddDimensions(u32, u32),
}

/// NV12 to packed RGB24, BT.601 limited range.
#[allow(
    clippy::as_conversions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
pub fn nv12_to_rgb(raw: &[u8], width: u32, height: u32) -> Result<RgbImage, ConvertError> {
    if width % 2 != 0 || height % 2 != 0 {
        return Err(ConvertError::OddDimensions(width, height));
    }
    let w = width as usize;
    let h = height as usize;
    let want = w * h * 3 / 2;
    if raw.len() != want {
        return Err(ConvertError::BadBufferSize {
            got: raw.len(),
            want,
        });
    }

    let (y_plane, uv_plane) = raw.split_at(w * h);
    let mut out = vec![0u8; w * h * 3];

    for row in 0..h {
        for col in 0..w {
            let y = i32::from(y_plane[row * w + col]);
            let uv_base = (row / 2) * w + (col / 2) * 2;
            let u = i32::from(uv_plane[uv_base]);
            let v = i32::from(uv_plane[uv_base + 1]);

            let c = y - 16;
            let d = u - 128;
            let e = v - 128;

            let clamp = |v: i32| v.clamp(0, 255) as u8;
            let r = clamp((298 * c + 409 * e + 128) >> 8);
            let g = clamp((298 * c - 100 * d - 208 * e + 128) >> 8);
            let b = clamp((298 * c + 516 * d + 128) >> 8);

            let i = (row * w + col) * 3;
            out[i] = r;
            out[i + 1] = g;
            out[i + 2] = b;
        }
    }

    Ok(RgbImage::new(width, height, out))
}

/// Nearest-neighbor resize. Detector inputs are small, quality is not
/// a concern here.
#[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
#[must_use]
pub fn resize(src: &RgbImage, dst_width: u32, dst_height: u32) -> RgbImage {
    if src.width == dst_width && src.height == dst_height {
        return src.clone();
    }
    let sw = src.width as usize;
    let dw = dst_width as usize;
    let dh = dst_height as usize;
    let mut out = vec![0u8; dw * dh * 3];

    for row in 0..dh {
        let src_row = row * (src.height as usize) / dh;
        for col in 0..dw {
            let src_col = col * sw / dw;
            let s = (src_row * sw + src_col) * 3;
            let d = (row * dw + col) * 3;
            out[d..d + 3].copy_from_slice(&src.data[s..s + 3]);
        }
    }

    RgbImage::new(dst_width, dst_height, out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn nv12_gray(width: u32, height: u32, luma: u8) -> Vec<u8> {
        let size = (width as usize) * (height as usize);
        let mut raw = vec![luma; size];
        raw.extend(vec![128u8; size / 2]);
        raw
    }

    #[test]
    fn test_nv12_to_rgb_black_and_white() {
        let black = nv12_to_rgb(&nv12_gray(4, 2, 16), 4, 2).unwrap();
        assert!(black.data().iter().all(|&v| v == 0));

        let white = nv12_to_rgb(&nv12_gray(4, 2, 235), 4, 2).unwrap();
        assert!(white.data().iter().all(|&v| v == 255));
    }

    #[test]
    fn test_nv12_to_rgb_bad_size() {
        assert_eq!(
            ConvertError::BadBufferSize { got: 1, want: 12 },
            nv12_to_rgb(&[0], 4, 2).unwrap_err()
        );
    }

    #[test]
    fn test_resize_downscale() {
        let src = RgbImage::new(4, 4, (0..48).collect());
        let dst = resize(&src, 2, 2);
        assert_eq!(2, dst.width());
        assert_eq!(2, dst.height());
        assert_eq!(12, dst.data().len());
    }

    #[test]
    fn test_resize_noop_same_size() {
        let src = RgbImage::new(2, 2, vec![7; 12]);
        assert_eq!(src, resize(&src, 2, 2));
    }

    #[test]
    fn test_to_luma() {
        let img = RgbImage::new(1, 1, vec![30, 60, 90]);
        assert_eq!(vec![60], img.to_luma());
    }
}
