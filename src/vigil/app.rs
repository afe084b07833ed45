// SPDX-License-Identifier: GPL-2.0-or-later

// Application assembly and ordered teardown. Components communicate
// through the event bus and queues only; this is the one place that
// knows how everything is wired together.
//
// Shutdown walks through the phases in order: Stopping (no new work),
// per-camera stop, LastWrite (fragmenter final sweeps and tier
// drains), Shutdown (database closed).

use crate::config::{AppConfig, ConfigError, load_config};
use common::{
    ArcEventBus, ArcLogger, ArcMsgLogger, CameraId, EventBus, ILogger, LogEntry, LogLevel,
    MsgLogger, ShutdownPhase,
    camera::CameraConfig,
    recording::Subcategory,
    time::{Duration, UnixNano},
};
use filedb::{FileDb, OpenDbError, OrigCtimes, WatchError, WatchedPath, WatcherHub};
use fragmenter::FragmenterConfig;
use nvr::{NvrHandle, RecorderPaths};
use scanner::{
    Detector, MotionDetector, PassthroughDetector, Scheduler, new_scanner,
};
use std::{collections::HashMap, path::Path, sync::Arc};
use stream::{CameraSource, SourceError, resolve_stream_info};
use thiserror::Error;
use tiers::{CameraRetention, TierManager};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Object detector backends registered at startup, keyed by name.
/// The core ships none; plugins contribute theirs before `run`.
pub type DetectorFactory = Box<dyn Fn() -> Box<dyn Detector> + Send + Sync>;

#[derive(Default)]
pub struct DetectorRegistry(HashMap<String, DetectorFactory>);

impl DetectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, factory: DetectorFactory) {
        self.0.insert(name.to_owned(), factory);
    }

    fn any(&self) -> Option<&DetectorFactory> {
        self.0.values().next()
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("load config: {0}")]
    LoadConfig(#[from] ConfigError),

    #[error("open database: {0}")]
    OpenDb(#[from] OpenDbError),

    #[error("start watcher: {0}")]
    StartWatcher(#[from] WatchError),

    #[error("create directory: {0}")]
    CreateDir(std::io::Error),

    #[error("listen for shutdown signal: {0}")]
    SignalListener(std::io::Error),

    #[error("query: {0}")]
    Query(#[from] filedb::QueryError),

    #[error("assemble playlist: {0}")]
    AssemblePlaylist(#[from] hls::AssembleError),

    #[error("recording {0} not found")]
    RecordingNotFound(i64),
}

/// Operator tool: prints the HLS playlist for a recording, referencing
/// the fragment files on disk.
pub async fn print_playlist(config_path: &Path, recording_id: i64) -> Result<(), RunError> {
    let (config, _) = load_config(config_path)?;
    let logger: ArcLogger = Arc::new(log::Logger::new(Vec::new(), LogLevel::Error));

    let db = FileDb::open(logger, &config.storage.database_path()).await?;

    let Some(recording) = db.recording_by_id(recording_id).await? else {
        db.close().await;
        return Err(RunError::RecordingNotFound(recording_id));
    };
    let lookback = config
        .cameras
        .iter()
        .find(|c| *c.id == recording.camera_identifier)
        .map_or(5, |c| c.recorder.lookback);

    let assembler = hls::HlsAssembler::new(String::new());
    let playlist = assembler
        .playlist_for_recording(
            &db,
            recording_id,
            Duration::from_secs(lookback),
            UnixNano::now(),
        )
        .await?
        .ok_or(RunError::RecordingNotFound(recording_id))?;
    println!("{playlist}");

    db.close().await;
    Ok(())
}

pub async fn run(config_path: &Path, detectors: &DetectorRegistry) -> Result<(), RunError> {
    let (config, warnings) = load_config(config_path)?;

    let logger: ArcLogger = Arc::new(log::Logger::new(Vec::new(), config.log_level));
    for warning in warnings {
        logger.log(LogEntry::new(LogLevel::Warning, "app", None, warning));
    }

    let token = CancellationToken::new();
    let bus: ArcEventBus = Arc::new(EventBus::new());
    let (phase_tx, phase_rx) = watch::channel(ShutdownPhase::Running);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);
    let (last_write_tx, mut last_write_rx) = mpsc::channel::<()>(1);

    for tier in &config.storage.tiers {
        std::fs::create_dir_all(&tier.path).map_err(RunError::CreateDir)?;
    }
    std::fs::create_dir_all(&config.storage.temp_dir).map_err(RunError::CreateDir)?;

    let db = FileDb::open(logger.clone(), &config.storage.database_path()).await?;
    let orig_ctimes = OrigCtimes::new();

    let watched: Vec<WatchedPath> = config
        .storage
        .tiers
        .iter()
        .enumerate()
        .map(|(i, tier)| WatchedPath {
            tier_id: i64::try_from(i).unwrap_or(0),
            tier_path: tier.path.clone(),
            poll: tier.poll,
        })
        .collect();
    let _watcher = WatcherHub::start(
        token.child_token(),
        logger.clone(),
        bus.clone(),
        db.writer().clone(),
        orig_ctimes.clone(),
        watched,
    )?;

    let retention: Vec<CameraRetention> = config
        .cameras
        .iter()
        .filter(|c| c.enable)
        .map(|c| CameraRetention {
            camera_id: c.id.clone(),
            lookback: Duration::from_secs(c.recorder.lookback),
            segment_length: Duration::from_secs(c.recorder.segment_length),
            continuous_recording: c.recorder.continuous_recording,
        })
        .collect();
    let _tier_manager = TierManager::start(
        token.child_token(),
        last_write_tx.clone(),
        logger.clone(),
        bus.clone(),
        db.clone(),
        orig_ctimes.clone(),
        config.storage.tiers.clone(),
        retention,
        Vec::new(),
        phase_rx.clone(),
    );

    let mut cameras = Vec::new();
    for camera_config in config.cameras.iter().filter(|c| c.enable) {
        let camera = start_camera(
            &token,
            logger.clone(),
            bus.clone(),
            db.clone(),
            orig_ctimes.clone(),
            &config,
            camera_config,
            last_write_tx.clone(),
            phase_rx.clone(),
            detectors,
        )
        .await;
        match camera {
            Ok(v) => cameras.push(v),
            Err(e) => {
                logger.log(LogEntry::new(
                    LogLevel::Error,
                    "app",
                    Some(camera_config.id.clone()),
                    format!("failed to start camera: {e}"),
                ));
            }
        }
    }

    log_app(&logger, LogLevel::Info, "running");
    wait_for_shutdown_signal().await?;

    // Stopping: no new work.
    log_app(&logger, LogLevel::Info, "shutting down");
    _ = phase_tx.send(ShutdownPhase::Stopping);

    // Per-camera stop, in order.
    for camera in &mut cameras {
        camera.token.cancel();
        while camera.shutdown_complete_rx.recv().await.is_some() {}
    }

    // Last write: fragmenter final sweeps, tier drains.
    _ = phase_tx.send(ShutdownPhase::LastWrite);
    drop(last_write_tx);
    while last_write_rx.recv().await.is_some() {}

    // Shutdown: everything else, then the database.
    _ = phase_tx.send(ShutdownPhase::Shutdown);
    token.cancel();
    drop(shutdown_complete_tx);
    while shutdown_complete_rx.recv().await.is_some() {}
    db.close().await;

    log_app(&logger, LogLevel::Info, "shutdown complete");
    Ok(())
}

fn log_app(logger: &ArcLogger, level: LogLevel, msg: &str) {
    logger.log(LogEntry::new(level, "app", None, msg.to_owned()));
}

async fn wait_for_shutdown_signal() -> Result<(), RunError> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(RunError::SignalListener)?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

struct Camera {
    token: CancellationToken,
    shutdown_complete_rx: mpsc::Receiver<()>,

    #[allow(dead_code)]
    nvr: NvrHandle,
}

#[derive(Debug, Error)]
enum StartCameraError {
    #[error("resolve stream info: {0}")]
    ResolveStreamInfo(#[from] SourceError),

    #[error("create directory: {0}")]
    CreateDir(std::io::Error),
}

#[allow(clippy::too_many_arguments, clippy::too_many_lines)]
async fn start_camera(
    app_token: &CancellationToken,
    logger: ArcLogger,
    bus: ArcEventBus,
    db: Arc<FileDb>,
    orig_ctimes: OrigCtimes,
    app_config: &AppConfig,
    config: &CameraConfig,
    last_write_tx: mpsc::Sender<()>,
    phase_rx: watch::Receiver<ShutdownPhase>,
    detectors: &DetectorRegistry,
) -> Result<Camera, StartCameraError> {
    let camera_id = config.id.clone();
    let camera_token = app_token.child_token();
    let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

    let msg_logger = camera_logger(&logger, &camera_id, "camera");

    let pipe_url = config
        .source
        .sub_stream
        .as_ref()
        .unwrap_or(&config.source.main_stream);
    let (info, probe_dynamic) =
        resolve_stream_info(&msg_logger, &config.source, pipe_url).await?;

    // Scanners. Decode failures flag the pipe broken back to the
    // stream reader.
    let (broken_pipe_tx, broken_pipe_rx) = mpsc::channel(1);
    let mut slots = Vec::new();
    let mut object_ctl = None;
    let mut motion_ctl = None;

    if let Some(od) = config.object_detection.as_ref().filter(|c| c.enable) {
        if let Some(factory) = detectors.any() {
            let (slot, ctl) = new_scanner(
                camera_token.child_token(),
                camera_logger(&logger, &camera_id, "nvr"),
                factory(),
                info.fps,
                od.scan_fps,
                broken_pipe_tx.clone(),
            );
            slots.push(slot);
            object_ctl = Some(ctl);
        } else {
            msg_logger.log(
                LogLevel::Warning,
                "object detection configured but no detector backend is registered",
            );
        }
    }
    if let Some(md) = config.motion_detection.as_ref().filter(|c| c.enable) {
        let (slot, ctl) = new_scanner(
            camera_token.child_token(),
            camera_logger(&logger, &camera_id, "nvr"),
            Box::new(MotionDetector::new(md)),
            info.fps,
            md.scan_fps,
            broken_pipe_tx.clone(),
        );
        slots.push(slot);
        motion_ctl = Some(ctl);
    }
    if slots.is_empty() {
        // Disarmed unless an external consumer subscribes.
        let (slot, _ctl) = new_scanner(
            camera_token.child_token(),
            camera_logger(&logger, &camera_id, "nvr"),
            Box::new(PassthroughDetector::new(info.width, info.height)),
            info.fps,
            info.fps,
            broken_pipe_tx.clone(),
        );
        slots.push(slot);
    }
    let scheduler = Scheduler::new(slots);

    let temp_segments_dir = app_config.storage.temp_dir.join(&*camera_id);
    let tier0 = &app_config.storage.tiers[0];
    let segments_dir = tier0
        .path
        .join(Subcategory::Segments.as_str())
        .join(&*camera_id);
    let thumbnails_dir = tier0
        .path
        .join(Subcategory::Thumbnails.as_str())
        .join(&*camera_id);
    let event_clips_dir = tier0
        .path
        .join(Subcategory::EventClips.as_str())
        .join(&*camera_id);
    for dir in [&segments_dir, &thumbnails_dir, &event_clips_dir] {
        std::fs::create_dir_all(dir).map_err(StartCameraError::CreateDir)?;
    }

    let source = CameraSource::start(
        camera_token.clone(),
        shutdown_complete_tx.clone(),
        msg_logger,
        bus.clone(),
        config.clone(),
        temp_segments_dir.clone(),
        info,
        probe_dynamic,
        scheduler,
        broken_pipe_rx,
    );

    // The fragmenter lives on the app token so it can run its final
    // sweep after the camera has stopped.
    fragmenter::start_fragmenter(
        app_token.child_token(),
        last_write_tx,
        camera_logger(&logger, &camera_id, "fragmenter"),
        db.writer().clone(),
        orig_ctimes,
        FragmenterConfig {
            camera_id: camera_id.clone(),
            temp_segments_dir,
            segments_dir: segments_dir.clone(),
            tier_id: 0,
            tier_path: tier0.path.clone(),
        },
        phase_rx,
    );

    let nvr_handle = nvr::start_nvr(
        camera_token.clone(),
        shutdown_complete_tx,
        camera_logger(&logger, &camera_id, "nvr"),
        bus,
        db,
        config,
        RecorderPaths {
            thumbnails_dir,
            event_clips_dir,
            init_path: segments_dir.join("init.mp4"),
        },
        source.subscribe_frames(),
        object_ctl,
        motion_ctl,
    );

    Ok(Camera {
        token: camera_token,
        shutdown_complete_rx,
        nvr: nvr_handle,
    })
}

struct CameraMsgLogger {
    logger: ArcLogger,
    camera_id: CameraId,
    source: &'static str,
}

impl MsgLogger for CameraMsgLogger {
    fn log(&self, level: LogLevel, msg: &str) {
        self.logger.log(LogEntry::new(
            level,
            self.source,
            Some(self.camera_id.clone()),
            msg.to_owned(),
        ));
    }
}

fn camera_logger(logger: &ArcLogger, camera_id: &CameraId, source: &'static str) -> ArcMsgLogger {
    Arc::new(CameraMsgLogger {
        logger: logger.clone(),
        camera_id: camera_id.clone(),
        source,
    })
}
