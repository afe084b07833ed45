// SPDX-License-Identifier: GPL-2.0-or-later

// Stream Reader. Spawns and supervises the external decoder that
// simultaneously pipes raw decoded NV12 frames to us and writes a
// continuous chain of short MP4 segments to disk. Owns reconnection.
//
// With a substream configured, the substream supplies the raw-frame
// pipe and the main stream supplies only the segment chain, so two
// child processes run side by side.

mod command;
mod probe;

pub use command::{DecoderCommand, SegmentOutput, hwaccel_args, stderr_is_recoverable};
pub use probe::{ProbeError, StreamInfo, probe_stream};

use bytes::Bytes;
use common::{
    ArcEventBus, ArcMsgLogger, BusEvent, CameraId, CameraStatus, LogLevel, MsgLogger,
    camera::{CameraConfig, SourceConfig},
    time::UnixNano,
};
use scanner::{Frame, Scheduler};
use std::{path::PathBuf, process::Stdio};
use thiserror::Error;
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use url::Url;

const RESTART_SLEEP: std::time::Duration = std::time::Duration::from_secs(5);

/// Surfaced camera health, consumed by status entities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraState {
    pub connected: bool,

    /// False once a non-recoverable error killed this camera.
    pub retrying: bool,

    pub error: Option<String>,
}

impl CameraState {
    fn starting() -> Self {
        Self {
            connected: false,
            retrying: true,
            error: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("stream probe failed and no complete override values are configured")]
    IncompleteStreamInfo,
}

/// Probes the stream and merges operator overrides on top. Returns
/// whether any value came from the probe, in which case a reconnect
/// re-probes.
pub async fn resolve_stream_info(
    logger: &ArcMsgLogger,
    source: &SourceConfig,
    url: &Url,
) -> Result<(StreamInfo, bool), SourceError> {
    let probed = match probe_stream(url).await {
        Ok(v) => v,
        Err(e) => {
            logger.log(
                LogLevel::Warning,
                &format!("probe failed, falling back to configured values: {e}"),
            );
            StreamInfo::default()
        }
    };

    merge_stream_info(probed, source)
}

/// Operator overrides win over probed values.
fn merge_stream_info(
    probed: StreamInfo,
    source: &SourceConfig,
) -> Result<(StreamInfo, bool), SourceError> {
    let info = StreamInfo {
        width: source.width.unwrap_or(probed.width),
        height: source.height.unwrap_or(probed.height),
        fps: source.fps.unwrap_or(probed.fps),
        codec: source.codec.clone().or(probed.codec),
    };
    if !info.is_complete() {
        return Err(SourceError::IncompleteStreamInfo);
    }

    let dynamic = source.width.is_none() || source.height.is_none() || source.fps.is_none();
    Ok((info, dynamic))
}

pub struct CameraSource {
    frame_rx: watch::Receiver<Option<Frame>>,
    state_rx: watch::Receiver<CameraState>,
    info: StreamInfo,
}

impl CameraSource {
    /// Spawns the supervisor. `scheduler` receives every raw frame,
    /// `broken_pipe_rx` restarts the decoder when a worker flags a
    /// desynced pipe.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn start(
        token: CancellationToken,
        shutdown_complete: mpsc::Sender<()>,
        logger: ArcMsgLogger,
        bus: ArcEventBus,
        config: CameraConfig,
        temp_segments_dir: PathBuf,
        info: StreamInfo,
        probe_dynamic: bool,
        scheduler: Scheduler,
        broken_pipe_rx: mpsc::Receiver<()>,
    ) -> Self {
        let (frame_tx, frame_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(CameraState::starting());

        let supervisor = Supervisor {
            token,
            logger,
            bus,
            config,
            temp_segments_dir,
            info: info.clone(),
            probe_dynamic,
            scheduler,
            broken_pipe_rx,
            frame_tx,
            state_tx,
            last_status: None,
        };
        tokio::spawn(async move {
            let _shutdown_complete = shutdown_complete;
            supervisor.run().await;
        });

        Self {
            frame_rx,
            state_rx,
            info,
        }
    }

    /// The "frame ready" signal. Holds the most recent raw frame.
    #[must_use]
    pub fn subscribe_frames(&self) -> watch::Receiver<Option<Frame>> {
        self.frame_rx.clone()
    }

    #[must_use]
    pub fn state(&self) -> watch::Receiver<CameraState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }
}

struct Supervisor {
    token: CancellationToken,
    logger: ArcMsgLogger,
    bus: ArcEventBus,
    config: CameraConfig,
    temp_segments_dir: PathBuf,
    info: StreamInfo,
    probe_dynamic: bool,
    scheduler: Scheduler,
    broken_pipe_rx: mpsc::Receiver<()>,
    frame_tx: watch::Sender<Option<Frame>>,
    state_tx: watch::Sender<CameraState>,
    last_status: Option<CameraStatus>,
}

#[derive(Debug, Error)]
enum RunStreamError {
    #[error("create temp segments dir: {0}")]
    CreateTempDir(std::io::Error),

    #[error("dry run decoder: {0}")]
    DryRun(std::io::Error),

    #[error("non-recoverable decoder error: {0}")]
    Fatal(String),

    #[error("spawn decoder: {0}")]
    SpawnDecoder(std::io::Error),

    #[error("decoder has no stdout")]
    NoStdout,

    #[error("decoder exited unexpectedly: {0}")]
    DecoderExited(std::io::Error),

    #[error("frame pipe broken")]
    BrokenPipe,
}

impl Supervisor {
    fn log(&self, level: LogLevel, msg: &str) {
        self.logger.log(level, msg);
    }

    fn camera_id(&self) -> &CameraId {
        &self.config.id
    }

    fn set_status(&mut self, status: CameraStatus, error: Option<String>, retrying: bool) {
        self.state_tx.send_replace(CameraState {
            connected: status == CameraStatus::Connected,
            retrying,
            error,
        });
        if self.last_status != Some(status) {
            self.last_status = Some(status);
            self.bus.send(BusEvent::CameraStatus {
                camera_id: self.camera_id().clone(),
                status,
            });
        }
    }

    async fn run(mut self) {
        self.bus.send(BusEvent::CameraStarted {
            camera_id: self.camera_id().clone(),
        });

        loop {
            if self.token.is_cancelled() {
                break;
            }
            match self.run_stream().await {
                Ok(()) => break, // Cancelled.
                Err(RunStreamError::Fatal(e)) => {
                    self.log(LogLevel::Error, &format!("fatal decoder error: {e}"));
                    self.set_status(CameraStatus::Disconnected, Some(e), false);
                    break;
                }
                Err(e) => {
                    self.log(LogLevel::Error, &format!("stream crashed: {e}"));
                    self.set_status(CameraStatus::Disconnected, Some(e.to_string()), true);
                }
            }

            tokio::select! {
                () = self.token.cancelled() => break,
                () = tokio::time::sleep(RESTART_SLEEP) => {}
            }

            if self.probe_dynamic {
                if let Ok((info, _)) =
                    resolve_stream_info(&self.logger, &self.config.source, self.pipe_url()).await
                {
                    self.info = info;
                }
            }
        }

        self.bus.send(BusEvent::CameraStopped {
            camera_id: self.camera_id().clone(),
        });
        self.log(LogLevel::Info, "stopped");
    }

    /// The stream feeding the raw-frame pipe.
    fn pipe_url(&self) -> &Url {
        self.config
            .source
            .sub_stream
            .as_ref()
            .unwrap_or(&self.config.source.main_stream)
    }

    fn pipe_command(&self) -> DecoderCommand {
        DecoderCommand {
            loglevel: self.config.ffmpeg.loglevel.clone(),
            hwaccel: self.config.ffmpeg.hwaccel,
            codec: self.info.codec.clone(),
            url: self.pipe_url().clone(),
            stimeout_secs: self.config.ffmpeg.stimeout,
            // Without a substream one process does both jobs.
            write_segments: if self.config.has_sub_stream() {
                None
            } else {
                Some(self.segment_output())
            },
            pipe_frames: true,
        }
    }

    // The segment branch never decodes, hardware accel is pointless
    // there.
    fn segment_command(&self) -> DecoderCommand {
        DecoderCommand {
            loglevel: self.config.ffmpeg.loglevel.clone(),
            hwaccel: common::camera::HwAccel::None,
            codec: None,
            url: self.config.source.main_stream.clone(),
            stimeout_secs: self.config.ffmpeg.stimeout,
            write_segments: Some(self.segment_output()),
            pipe_frames: false,
        }
    }

    fn segment_output(&self) -> SegmentOutput {
        SegmentOutput {
            segment_length: self.config.recorder.segment_length,
            temp_dir: self.temp_segments_dir.clone(),
        }
    }

    #[allow(clippy::as_conversions)]
    async fn run_stream(&mut self) -> Result<(), RunStreamError> {
        use RunStreamError::*;

        tokio::fs::create_dir_all(&self.temp_segments_dir)
            .await
            .map_err(CreateTempDir)?;

        self.dry_run().await?;

        let pipe_cmd = self.pipe_command();
        let mut frame_child = spawn_decoder(&pipe_cmd.build(false), true)?;
        let mut segment_child = if self.config.has_sub_stream() {
            Some(spawn_decoder(&self.segment_command().build(false), false)?)
        } else {
            None
        };

        let mut stdout = frame_child.stdout.take().ok_or(NoStdout)?;

        self.set_status(CameraStatus::Connected, None, true);
        self.log(LogLevel::Info, "connected");

        let width = self.info.width;
        let height = self.info.height;
        let frame_bytes = (width as usize) * (height as usize) * 3 / 2;
        let mut buf = vec![0u8; frame_bytes];

        let result = loop {
            tokio::select! {
                () = self.token.cancelled() => break Ok(()),
                _ = self.broken_pipe_rx.recv() => break Err(BrokenPipe),
                res = stdout.read_exact(&mut buf) => {
                    if let Err(e) = res {
                        break Err(DecoderExited(e));
                    }
                    let frame = Frame::new(
                        Bytes::copy_from_slice(&buf),
                        width,
                        height,
                        UnixNano::now(),
                    );
                    self.scheduler.on_frame(&frame);
                    self.frame_tx.send_replace(Some(frame));
                }
            }
        };

        _ = frame_child.kill().await;
        if let Some(child) = &mut segment_child {
            _ = child.kill().await;
        }
        result
    }

    /// Runs the decoder command with `-frames:v 1`, capturing stderr.
    /// Recoverable errors sleep and retry indefinitely, anything else
    /// is fatal to this camera.
    async fn dry_run(&mut self) -> Result<(), RunStreamError> {
        use RunStreamError::*;
        let args = self.pipe_command().build(true);
        loop {
            let output = Command::new("ffmpeg")
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(DryRun)?;

            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.trim().is_empty() {
                return Ok(());
            }
            if !stderr_is_recoverable(&stderr, &self.config.ffmpeg.recoverable_errors) {
                return Err(Fatal(stderr.trim().to_owned()));
            }

            self.log(
                LogLevel::Error,
                &format!("recoverable decoder error, retrying in 5 seconds: {}", stderr.trim()),
            );
            tokio::select! {
                () = self.token.cancelled() => return Ok(()),
                () = tokio::time::sleep(RESTART_SLEEP) => {}
            }
        }
    }
}

fn spawn_decoder(args: &[String], pipe_stdout: bool) -> Result<Child, RunStreamError> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if pipe_stdout {
        cmd.stdout(Stdio::piped());
    } else {
        cmd.stdout(Stdio::null());
    }
    cmd.spawn().map_err(RunStreamError::SpawnDecoder)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn source_config(width: Option<u32>) -> SourceConfig {
        SourceConfig {
            main_stream: "rtsp://example.com/main".parse().unwrap(),
            sub_stream: None,
            width,
            height: Some(1080),
            fps: Some(5.0),
            codec: Some("h264".to_owned()),
        }
    }

    #[test]
    fn test_merge_stream_info_overrides_win() {
        let probed = StreamInfo {
            width: 640,
            height: 360,
            fps: 30.0,
            codec: Some("hevc".to_owned()),
        };
        let source = source_config(Some(1920));
        let (info, dynamic) = merge_stream_info(probed, &source).unwrap();
        assert_eq!(
            StreamInfo {
                width: 1920,
                height: 1080,
                fps: 5.0,
                codec: Some("h264".to_owned()),
            },
            info
        );
        assert!(!dynamic);
    }

    #[test]
    fn test_merge_stream_info_probe_fills_gaps() {
        let probed = StreamInfo {
            width: 640,
            height: 360,
            fps: 30.0,
            codec: None,
        };
        let source = source_config(None);
        let (info, dynamic) = merge_stream_info(probed, &source).unwrap();
        assert_eq!(640, info.width);
        assert!(dynamic);
    }

    #[test]
    fn test_merge_stream_info_incomplete_is_error() {
        let source = source_config(None);
        assert!(matches!(
            merge_stream_info(StreamInfo::default(), &source),
            Err(SourceError::IncompleteStreamInfo)
        ));
    }
}
