// SPDX-License-Identifier: GPL-2.0-or-later

use serde::Deserialize;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use url::Url;

/// Stream properties reported by the external prober, zeros where the
/// probe could not determine a value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: Option<String>,
}

impl StreamInfo {
    /// A probe that "succeeded" but returned zeros is useless without
    /// operator overrides.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.width > 0 && self.height > 0 && self.fps > 0.0
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("spawn ffprobe: {0}")]
    Spawn(std::io::Error),

    #[error("wait for ffprobe: {0}")]
    Wait(std::io::Error),

    #[error("parse ffprobe output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to connect to stream: {0}")]
    Stream(String),

    #[error("no video stream found")]
    NoStreams,
}

#[derive(Deserialize)]
struct FfprobeOutput {
    error: Option<FfprobeErr>,

    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize)]
struct FfprobeErr {
    string: Option<String>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    codec_name: Option<String>,
}

/// Probes the stream for width, height, fps and codec name.
pub async fn probe_stream(url: &Url) -> Result<StreamInfo, ProbeError> {
    let output = Command::new("ffprobe")
        .args([
            "-hide_banner",
            "-loglevel",
            "fatal",
            "-print_format",
            "json",
            "-show_error",
            "-show_streams",
            "-select_streams",
            "v",
        ])
        .arg(url.as_str())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(ProbeError::Spawn)?;

    parse_probe_output(&output.stdout)
}

fn parse_probe_output(stdout: &[u8]) -> Result<StreamInfo, ProbeError> {
    let output: FfprobeOutput = serde_json::from_slice(stdout)?;

    if let Some(error) = output.error {
        return Err(ProbeError::Stream(
            error.string.unwrap_or_else(|| "unknown error".to_owned()),
        ));
    }

    let Some(stream) = output.streams.first() else {
        return Err(ProbeError::NoStreams);
    };

    Ok(StreamInfo {
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        fps: stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .unwrap_or(0.0),
        codec: stream.codec_name.clone(),
    })
}

#[allow(clippy::as_conversions, clippy::cast_precision_loss)]
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (numerator, denominator) = rate.split_once('/')?;
    let numerator: i64 = numerator.parse().ok()?;
    let denominator: i64 = denominator.parse().ok()?;
    if denominator == 0 {
        return None;
    }
    Some(numerator as f64 / denominator as f64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("5/1", Some(5.0); "integer")]
    #[test_case("30000/1001", Some(29.97002997002997); "ntsc")]
    #[test_case("0/0", None; "zero_denominator")]
    #[test_case("x", None; "garbage")]
    fn test_parse_frame_rate(input: &str, want: Option<f64>) {
        assert_eq!(want, parse_frame_rate(input));
    }

    #[test]
    fn test_parse_probe_output() {
        let raw = br#"{
            "streams": [
                {
                    "width": 1920,
                    "height": 1080,
                    "codec_name": "h264",
                    "avg_frame_rate": "5/1"
                }
            ]
        }"#;
        let got = parse_probe_output(raw).unwrap();
        assert_eq!(
            StreamInfo {
                width: 1920,
                height: 1080,
                fps: 5.0,
                codec: Some("h264".to_owned()),
            },
            got
        );
    }

    #[test]
    fn test_parse_probe_error() {
        let raw = br#"{"error": {"string": "Connection refused"}}"#;
        assert!(matches!(
            parse_probe_output(raw).unwrap_err(),
            ProbeError::Stream(msg) if msg == "Connection refused"
        ));
    }

    #[test]
    fn test_parse_probe_no_streams() {
        assert!(matches!(
            parse_probe_output(b"{}").unwrap_err(),
            ProbeError::NoStreams
        ));
    }

    #[test]
    fn test_parse_probe_missing_fields_are_zero() {
        let raw = br#"{"streams": [{}]}"#;
        let got = parse_probe_output(raw).unwrap();
        assert!(!got.is_complete());
    }
}
