// SPDX-License-Identifier: GPL-2.0-or-later

// Per-camera recording supervisor. Wakes once per raw frame, drains
// scanner results, runs the state machine and executes its actions:
// recording rows, thumbnails, recorder lifecycle events, scanner
// gating and event-clip materialization.

mod filter;
mod state;

pub use filter::ObjectFilters;
pub use state::{Action, NvrState, StateConfig, TickInput};

use common::{
    ArcEventBus, ArcMsgLogger, BusEvent, CameraId, LogLevel, MsgLogger,
    camera::CameraConfig,
    recording::{RecordingInfo, TriggerType},
    time::{Duration, SECOND, UnixNano},
};
use filedb::{FileDb, NewRecording};
use fragmenter::{ClipFragment, concatenate_fragments};
use scanner::{Frame, ScanResult, ScannerCtl};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Bounded wait for the frame-ready signal; ticks still run while a
/// camera is disconnected so countdowns can fire.
const FRAME_WAIT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Clone, Debug)]
pub enum ManualRequest {
    Start { duration: Option<Duration> },
    Stop,
}

/// Handle for manual recording requests.
#[derive(Clone)]
pub struct NvrHandle(mpsc::Sender<ManualRequest>);

impl NvrHandle {
    pub async fn start_manual_recording(&self, duration: Option<Duration>) {
        _ = self.0.send(ManualRequest::Start { duration }).await;
    }

    pub async fn stop_manual_recording(&self) {
        _ = self.0.send(ManualRequest::Stop).await;
    }
}

/// Filesystem locations the recorder writes into, all on the first
/// tier.
#[derive(Clone, Debug)]
pub struct RecorderPaths {
    pub thumbnails_dir: PathBuf,
    pub event_clips_dir: PathBuf,
    pub init_path: PathBuf,
}

#[must_use]
pub fn state_config(config: &CameraConfig) -> StateConfig {
    StateConfig {
        idle_timeout: Duration::from_secs(config.recorder.idle_timeout),
        max_recording_time: Duration::from_secs(config.recorder.max_recording_time),
        recorder_keepalive: config.recorder.recorder_keepalive,
        max_recorder_keepalive: Duration::from_secs(config.recorder.max_recorder_keepalive),
        object_detection_enabled: config
            .object_detection
            .as_ref()
            .is_some_and(|c| c.enable),
        scan_on_motion_only: config
            .object_detection
            .as_ref()
            .is_some_and(|c| c.enable && c.scan_on_motion_only),
        motion_detection_enabled: config
            .motion_detection
            .as_ref()
            .is_some_and(|c| c.enable),
        motion_trigger_recording: config
            .motion_detection
            .as_ref()
            .is_some_and(|c| c.enable && c.trigger_event_recording),
    }
}

#[must_use]
pub fn object_filters(config: &CameraConfig) -> ObjectFilters {
    ObjectFilters::new(
        config
            .object_detection
            .as_ref()
            .map(|c| c.labels.as_slice())
            .unwrap_or_default(),
    )
}

#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn start_nvr(
    token: CancellationToken,
    shutdown_complete: mpsc::Sender<()>,
    logger: ArcMsgLogger,
    bus: ArcEventBus,
    db: Arc<FileDb>,
    config: &CameraConfig,
    paths: RecorderPaths,
    frame_rx: watch::Receiver<Option<Frame>>,
    object_ctl: Option<ScannerCtl>,
    motion_ctl: Option<ScannerCtl>,
) -> NvrHandle {
    let (manual_tx, manual_rx) = mpsc::channel(1);

    let actor = NvrActor {
        token,
        logger,
        bus,
        db,
        camera_id: config.id.clone(),
        lookback: Duration::from_secs(config.recorder.lookback),
        segment_length: Duration::from_secs(config.recorder.segment_length),
        idle_timeout: Duration::from_secs(config.recorder.idle_timeout),
        create_event_clip: config.recorder.create_event_clip,
        paths,
        state: NvrState::new(state_config(config), object_filters(config)),
        object_ctl,
        motion_ctl,
        frame_rx,
        manual_rx,
        active_recording: None,
        motion_row: None,
        last_frame_at: None,
    };
    tokio::spawn(async move {
        let _shutdown_complete = shutdown_complete;
        actor.run().await;
    });

    NvrHandle(manual_tx)
}

#[derive(Clone, Debug)]
struct ActiveRecording {
    id: i64,
    start_time: UnixNano,
    trigger: TriggerType,
    thumbnail_path: PathBuf,
}

struct NvrActor {
    token: CancellationToken,
    logger: ArcMsgLogger,
    bus: ArcEventBus,
    db: Arc<FileDb>,

    camera_id: CameraId,
    lookback: Duration,
    segment_length: Duration,
    idle_timeout: Duration,
    create_event_clip: bool,
    paths: RecorderPaths,

    state: NvrState,
    object_ctl: Option<ScannerCtl>,
    motion_ctl: Option<ScannerCtl>,
    frame_rx: watch::Receiver<Option<Frame>>,
    manual_rx: mpsc::Receiver<ManualRequest>,

    active_recording: Option<ActiveRecording>,
    motion_row: Option<i64>,
    last_frame_at: Option<UnixNano>,
}

impl NvrActor {
    fn log(&self, level: LogLevel, msg: &str) {
        self.logger.log(level, msg);
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.token.cancelled() => {
                    // Keep the row consistent on teardown.
                    if self.active_recording.is_some() {
                        self.stop_recording(UnixNano::now()).await;
                    }
                    return;
                }
                request = self.manual_rx.recv() => {
                    match request {
                        Some(ManualRequest::Start { duration }) => {
                            self.state.request_manual_start(duration);
                        }
                        Some(ManualRequest::Stop) => self.state.request_manual_stop(),
                        None => return,
                    }
                }
                changed = tokio::time::timeout(FRAME_WAIT, self.frame_rx.changed()) => {
                    match changed {
                        Ok(Ok(())) => {}
                        // Frame source is gone.
                        Ok(Err(_)) => return,
                        // Bounded wait elapsed, tick anyway.
                        Err(_) => {}
                    }
                }
            }

            let frame = self.frame_rx.borrow_and_update().clone();
            let now = UnixNano::now();
            let mut actions = Vec::new();

            // A reconnect after a gap longer than the idle timeout
            // closes the open event; the hole stays visible in the
            // playlist as a gap.
            if let Some(frame) = &frame {
                if self.state.is_recording() {
                    let gap_exceeded = self
                        .last_frame_at
                        .and_then(|last| frame.time().sub(last))
                        .is_some_and(|gap| gap > self.idle_timeout);
                    if gap_exceeded {
                        actions.extend(
                            self.state
                                .force_stop("reconnect gap exceeded idle timeout"),
                        );
                    }
                }
                self.last_frame_at = Some(frame.time());
            }

            let input = TickInput {
                object_result: self.object_ctl.as_mut().and_then(|ctl| {
                    match ctl.try_result() {
                        Some(ScanResult::Objects(detections)) => Some(detections),
                        _ => None,
                    }
                }),
                motion_result: self.motion_ctl.as_mut().and_then(|ctl| {
                    match ctl.try_result() {
                        Some(ScanResult::Motion(motion)) => Some(motion),
                        _ => None,
                    }
                }),
            };

            actions.extend(self.state.tick(now, &input));
            self.apply(actions, frame.as_ref(), now).await;
        }
    }

    async fn apply(&mut self, actions: Vec<Action>, frame: Option<&Frame>, now: UnixNano) {
        for action in actions {
            match action {
                Action::StartRecording { trigger } => {
                    self.start_recording(now, trigger, frame).await;
                }
                Action::StopRecording => self.stop_recording(now).await,
                Action::ArmObjectScanner(armed) => {
                    if let Some(ctl) = &self.object_ctl {
                        ctl.set_scan(armed);
                    }
                }
                Action::ArmMotionScanner(armed) => {
                    if let Some(ctl) = &self.motion_ctl {
                        ctl.set_scan(armed);
                    }
                }
                Action::MotionStarted => {
                    if let Some(time) = now.as_naive_utc() {
                        self.motion_row = self
                            .db
                            .writer()
                            .insert_motion(self.camera_id.clone(), time)
                            .await
                            .ok();
                    }
                }
                Action::MotionEnded => {
                    if let (Some(id), Some(time)) = (self.motion_row.take(), now.as_naive_utc()) {
                        _ = self.db.writer().close_motion(id, time).await;
                    }
                }
                Action::RecordObjects(detections) => {
                    _ = self
                        .db
                        .writer()
                        .insert_objects(self.camera_id.clone(), detections, now)
                        .await;
                }
                Action::Log(level, msg) => self.log(level, &msg),
            }
        }
    }

    async fn start_recording(&mut self, now: UnixNano, trigger: TriggerType, frame: Option<&Frame>) {
        let Some(start_time) = now.as_naive_utc() else {
            return;
        };
        let adjusted_start_time = now
            .sub_duration(self.lookback)
            .and_then(|t| t.sub_duration(self.segment_length))
            .and_then(|t| t.as_naive_utc())
            .unwrap_or(start_time);

        let inserted = self
            .db
            .writer()
            .insert_recording(NewRecording {
                camera_id: self.camera_id.clone(),
                start_time,
                adjusted_start_time,
                trigger_type: trigger,
                trigger_id: None,
                thumbnail_path: PathBuf::new(),
            })
            .await;
        let id = match inserted {
            Ok(v) => v,
            Err(e) => {
                self.log(LogLevel::Error, &format!("insert recording: {e}"));
                return;
            }
        };

        let thumbnail_path = self.paths.thumbnails_dir.join(format!("{id}.jpg"));
        _ = self
            .db
            .writer()
            .set_thumbnail_path(id, &thumbnail_path)
            .await;

        self.log(LogLevel::Info, &format!("starting recording {id}"));

        if let Some(frame) = frame {
            if let Err(e) = write_thumbnail(frame, &thumbnail_path).await {
                self.log(LogLevel::Error, &format!("failed to generate thumbnail: {e}"));
            }
        }

        let active = ActiveRecording {
            id,
            start_time: now,
            trigger,
            thumbnail_path: thumbnail_path.clone(),
        };
        self.bus.send(BusEvent::RecorderStart {
            camera_id: self.camera_id.clone(),
            recording: self.recording_info(&active, None, None),
        });
        self.active_recording = Some(active);
    }

    async fn stop_recording(&mut self, now: UnixNano) {
        let Some(active) = self.active_recording.take() else {
            return;
        };
        let Some(end_time) = now.as_naive_utc() else {
            return;
        };

        if let Err(e) = self.db.writer().close_recording(active.id, end_time).await {
            self.log(LogLevel::Error, &format!("close recording: {e}"));
        }
        self.log(LogLevel::Info, &format!("recording {} stopped", active.id));

        // Results that arrive after the stop belong to no recording.
        if let Some(ctl) = &mut self.object_ctl {
            _ = ctl.try_result();
        }
        if let Some(ctl) = &mut self.motion_ctl {
            _ = ctl.try_result();
        }

        let stop_info = self.recording_info(&active, Some(now), None);
        self.bus.send(BusEvent::RecorderStop {
            camera_id: self.camera_id.clone(),
            recording: stop_info.clone(),
        });

        if self.create_event_clip {
            self.spawn_clip_materialization(active, now);
        } else {
            self.bus.send(BusEvent::RecorderComplete {
                camera_id: self.camera_id.clone(),
                recording: stop_info,
            });
        }
    }

    fn recording_info(
        &self,
        active: &ActiveRecording,
        end_time: Option<UnixNano>,
        clip_path: Option<PathBuf>,
    ) -> RecordingInfo {
        RecordingInfo {
            id: active.id,
            start_time: active.start_time,
            end_time,
            trigger_type: active.trigger,
            trigger_id: None,
            thumbnail_path: active.thumbnail_path.clone(),
            clip_path,
        }
    }

    /// The final fragment only exists after the fragmenter's next
    /// sweep, so materialization waits one segment plus one sweep
    /// before reading the index. Retried once, then given up with the
    /// clip path left unset.
    fn spawn_clip_materialization(&self, active: ActiveRecording, now: UnixNano) {
        let db = self.db.clone();
        let bus = self.bus.clone();
        let logger = self.logger.clone();
        let camera_id = self.camera_id.clone();
        let lookback = self.lookback;
        let delay = self
            .segment_length
            .checked_add(Duration::new(6 * SECOND))
            .and_then(|d| d.as_std())
            .unwrap_or(std::time::Duration::from_secs(11));
        let clip_path = self.paths.event_clips_dir.join(format!("{}.mp4", active.id));
        let init_path = self.paths.init_path.clone();
        let info = self.recording_info(&active, Some(now), Some(clip_path.clone()));

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut clip_created = false;
            for attempt in 0..2 {
                match create_event_clip(&db, active.id, lookback, &init_path, &clip_path).await {
                    Ok(()) => {
                        clip_created = true;
                        break;
                    }
                    Err(e) => {
                        logger.log(
                            LogLevel::Warning,
                            &format!(
                                "create event clip for {} (attempt {}): {e}",
                                active.id,
                                attempt + 1
                            ),
                        );
                    }
                }
            }

            let mut info = info;
            if clip_created {
                _ = db.writer().set_clip_path(active.id, &clip_path).await;
            } else {
                info.clip_path = None;
            }
            bus.send(BusEvent::RecorderComplete {
                camera_id,
                recording: info,
            });
        });
    }
}

#[derive(Debug, thiserror::Error)]
enum CreateClipError {
    #[error("recording disappeared")]
    RecordingGone,

    #[error("query fragments: {0}")]
    Query(#[from] filedb::QueryError),

    #[error("concatenate: {0}")]
    Concat(#[from] fragmenter::ConcatError),

    #[error("create clip directory: {0}")]
    CreateDir(std::io::Error),
}

async fn create_event_clip(
    db: &Arc<FileDb>,
    recording_id: i64,
    lookback: Duration,
    init_path: &std::path::Path,
    clip_path: &std::path::Path,
) -> Result<(), CreateClipError> {
    use CreateClipError::*;
    let now = UnixNano::now()
        .as_naive_utc()
        .expect("time representable");

    let recording = db
        .recording_by_id(recording_id)
        .await?
        .ok_or(RecordingGone)?;
    let rows = db.fragments_for_recording(&recording, lookback, now).await?;
    let fragments: Vec<ClipFragment> = rows
        .iter()
        .filter_map(|row| {
            Some(ClipFragment {
                path: row.path.clone(),
                duration: row.duration?,
            })
        })
        .collect();

    if let Some(parent) = clip_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(CreateDir)?;
    }
    concatenate_fragments(&fragments, &init_path.to_string_lossy(), clip_path).await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum ThumbnailError {
    #[error("decode frame: {0}")]
    Decode(#[from] scanner::ConvertError),

    #[error("encode jpeg: {0}")]
    Encode(#[from] jpeg_encoder::EncodingError),

    #[error("frame too large for encoder")]
    TooLarge(#[from] std::num::TryFromIntError),

    #[error("create thumbnail directory: {0}")]
    CreateDir(std::io::Error),

    #[error("write file: {0}")]
    WriteFile(std::io::Error),
}

/// The thumbnail is the current decoded frame at event start, encoded
/// once.
async fn write_thumbnail(frame: &Frame, path: &std::path::Path) -> Result<(), ThumbnailError> {
    use ThumbnailError::*;
    let frame = frame.clone();
    let jpeg = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ThumbnailError> {
        let rgb = frame.decode_once()?;
        let mut jpeg = Vec::new();
        let encoder = jpeg_encoder::Encoder::new(&mut jpeg, 75);
        encoder.encode(
            rgb.data(),
            u16::try_from(rgb.width())?,
            u16::try_from(rgb.height())?,
            jpeg_encoder::ColorType::Rgb,
        )?;
        Ok(jpeg)
    })
    .await
    .expect("join")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(CreateDir)?;
    }
    tokio::fs::write(path, jpeg).await.map_err(WriteFile)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::{DummyLogger, EventBus};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn nv12_frame() -> Frame {
        let mut raw = vec![128u8; 16 * 8];
        raw.extend(vec![128u8; 16 * 8 / 2]);
        Frame::new(Bytes::from(raw), 16, 8, UnixNano::now())
    }

    fn camera_config() -> CameraConfig {
        toml::from_str(
            "
            id = \"cam1\"
            name = \"front\"
            [source]
            main_stream = \"rtsp://example.com/main\"
            [recorder]
            idle_timeout = 1
            ",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_manual_recording_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let db = FileDb::open(DummyLogger::new(), &tmp.path().join("files.db"))
            .await
            .unwrap();
        let bus = Arc::new(EventBus::new());
        let mut bus_rx = bus.subscribe();
        let token = CancellationToken::new();
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let (frame_tx, frame_rx) = watch::channel(None);

        let handle = start_nvr(
            token.clone(),
            shutdown_tx,
            DummyLogger::new(),
            bus,
            db.clone(),
            &camera_config(),
            RecorderPaths {
                thumbnails_dir: tmp.path().join("thumbnails").join("cam1"),
                event_clips_dir: tmp.path().join("event_clips").join("cam1"),
                init_path: tmp.path().join("segments").join("cam1").join("init.mp4"),
            },
            frame_rx,
            None,
            None,
        );

        // The frame must be current before the manual request ticks,
        // otherwise there is nothing to snapshot.
        frame_tx.send_replace(Some(nv12_frame()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.start_manual_recording(None).await;

        let event = bus_rx.recv().await.unwrap();
        let BusEvent::RecorderStart { recording, .. } = event else {
            panic!("expected recorder start, got {event:?}");
        };
        assert_eq!(TriggerType::Manual, recording.trigger_type);

        let row = db.recording_by_id(recording.id).await.unwrap().unwrap();
        assert_eq!("manual", row.trigger_type.as_deref().unwrap());
        assert!(row.end_time.is_none());
        assert!(row.thumbnail_path.ends_with(&format!("{}.jpg", recording.id)));
        // Thumbnail written from the current decoded frame.
        assert!(PathBuf::from(&row.thumbnail_path).is_file());

        handle.stop_manual_recording().await;
        frame_tx.send_replace(Some(nv12_frame()));

        loop {
            let event = bus_rx.recv().await.unwrap();
            if let BusEvent::RecorderStop { recording: stopped, .. } = event {
                assert_eq!(recording.id, stopped.id);
                assert!(stopped.end_time.is_some());
                break;
            }
        }
        let event = bus_rx.recv().await.unwrap();
        assert!(matches!(event, BusEvent::RecorderComplete { .. }));

        let row = db.recording_by_id(recording.id).await.unwrap().unwrap();
        assert!(row.end_time.is_some());
        assert!(row.clip_path.is_none());

        token.cancel();
        db.close().await;
    }
}
