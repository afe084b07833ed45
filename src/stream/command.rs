// SPDX-License-Identifier: GPL-2.0-or-later

// Composes the external decoder argv. The decoder simultaneously
// writes a chain of short MP4 segments (stream copy, no re-encoding)
// and pipes raw NV12 frames to our stdin reader at native fps.

use common::camera::HwAccel;
use std::path::{Path, PathBuf};
use url::Url;

/// Hardware decoder map keyed by the probed codec name. Unknown
/// codecs fall back to software decoding.
#[must_use]
pub fn hwaccel_args(hwaccel: HwAccel, codec: Option<&str>) -> Vec<String> {
    let owned = |args: &[&str]| args.iter().map(|s| (*s).to_owned()).collect();
    match hwaccel {
        HwAccel::None => Vec::new(),
        HwAccel::Cuda => owned(&["-hwaccel", "cuda"]),
        HwAccel::Vaapi => owned(&["-hwaccel", "vaapi"]),
        HwAccel::Rpi => match codec {
            Some("h264") => owned(&["-c:v", "h264_v4l2m2m"]),
            Some("hevc") => owned(&["-c:v", "hevc_v4l2m2m"]),
            _ => Vec::new(),
        },
    }
}

#[derive(Clone, Debug)]
pub struct DecoderCommand {
    pub loglevel: String,
    pub hwaccel: HwAccel,
    pub codec: Option<String>,
    pub url: Url,

    /// Stall timeout for the RTSP input in seconds.
    pub stimeout_secs: u32,

    /// Write the segment chain into this camera temp directory.
    pub write_segments: Option<SegmentOutput>,

    /// Pipe raw NV12 frames to stdout.
    pub pipe_frames: bool,
}

#[derive(Clone, Debug)]
pub struct SegmentOutput {
    pub segment_length: u32,
    pub temp_dir: PathBuf,
}

impl DecoderCommand {
    /// The full argv, without the program name.
    #[must_use]
    pub fn build(&self, single_frame: bool) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        fn push(args: &mut Vec<String>, items: &[&str]) {
            args.extend(items.iter().map(|s| (*s).to_owned()));
        }

        push(&mut args, &["-hide_banner", "-loglevel"]);
        args.push(self.loglevel.clone());

        // Stream-format specific input flags.
        push(&mut args, &["-rtsp_transport", "tcp", "-stimeout"]);
        args.push((u64::from(self.stimeout_secs) * 1_000_000).to_string());
        push(&mut args, &["-fflags", "nobuffer+genpts", "-flags", "low_delay"]);

        args.extend(hwaccel_args(self.hwaccel, self.codec.as_deref()));

        args.push("-i".to_owned());
        args.push(self.url.to_string());

        if single_frame {
            push(&mut args, &["-frames:v", "1"]);
        }

        if !single_frame {
            if let Some(segments) = &self.write_segments {
                push(
                    &mut args,
                    &["-c:v", "copy", "-an", "-f", "segment", "-segment_time"],
                );
                args.push(segments.segment_length.to_string());
                push(&mut args, &["-reset_timestamps", "1", "-strftime", "1"]);
                args.push(segment_pattern(&segments.temp_dir));
            }
        }

        if self.pipe_frames {
            push(
                &mut args,
                &["-an", "-f", "rawvideo", "-pix_fmt", "nv12", "pipe:1"],
            );
        }

        args
    }
}

fn segment_pattern(temp_dir: &Path) -> String {
    temp_dir.join("%s.mp4").to_string_lossy().to_string()
}

/// True if any configured recoverable substring occurs in stderr.
#[must_use]
pub fn stderr_is_recoverable(stderr: &str, recoverable_errors: &[String]) -> bool {
    recoverable_errors.iter().any(|e| stderr.contains(e))
}
