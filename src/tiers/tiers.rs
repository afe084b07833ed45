// SPDX-License-Identifier: GPL-2.0-or-later

// Tiered storage engine. Per (camera, tier, category, subcategory) a
// throttled job selects files exceeding retention policy and either
// moves them to the next tier or deletes them, keeping the segment
// index consistent. Jobs run on a small worker pool so a heavy sweep
// cannot block the others; concurrent triggers for one key coalesce
// through a per-key lock plus a minimum-interval throttle.

mod config;
mod select;

pub use config::{AgeConfig, RetentionConfig, RetentionParams, SizeConfig, TierConfig};
pub use select::{
    FileAction, FragmentInfo, NextTiers, RecordingMeta, continuous_candidates, decide,
    drain_candidates, event_candidates, fragment_in_window, label_fragments, orphan_candidates,
};

use common::{
    ArcEventBus, ArcLogger, BusEvent, CameraId, ILogger, LogEntry, LogLevel, ShutdownPhase,
    recording::{Category, Subcategory},
    time::{Duration, UnixNano},
};
use filedb::{FileDb, FileRow, MoveFile, OrigCtimes};
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

const WORKER_POOL_SIZE: usize = 4;
const JOB_QUEUE_SIZE: usize = 256;
const THROTTLE: Duration = Duration::new(10 * common::time::SECOND);
const SLEEP_BETWEEN_BATCHES: std::time::Duration = std::time::Duration::from_millis(100);

/// Per-camera knobs the sweeps need.
#[derive(Clone, Debug)]
pub struct CameraRetention {
    pub camera_id: CameraId,
    pub lookback: Duration,
    pub segment_length: Duration,
    pub continuous_recording: bool,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct JobKey {
    pub camera_id: CameraId,
    pub tier_index: usize,
    pub category: Category,
    pub subcategory: Subcategory,
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("query: {0}")]
    Query(#[from] filedb::QueryError),

    #[error("write: {0}")]
    Write(#[from] filedb::WriteError),
}

#[derive(Clone)]
pub struct TierManager(Arc<Inner>);

struct Inner {
    logger: ArcLogger,
    db: Arc<FileDb>,
    orig_ctimes: OrigCtimes,
    tiers: Vec<TierConfig>,
    cameras: Vec<CameraRetention>,
    snapshot_domains: Vec<String>,
    job_tx: mpsc::Sender<JobKey>,
    job_states: Mutex<HashMap<JobKey, Arc<JobState>>>,
}

struct JobState {
    lock: Mutex<()>,
    last_run: std::sync::Mutex<Option<UnixNano>>,
}

impl TierManager {
    /// Wires up workers, interval tickers, the bus listener and the
    /// shutdown drain.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn start(
        token: CancellationToken,
        shutdown_complete: mpsc::Sender<()>,
        logger: ArcLogger,
        bus: ArcEventBus,
        db: Arc<FileDb>,
        orig_ctimes: OrigCtimes,
        tiers: Vec<TierConfig>,
        cameras: Vec<CameraRetention>,
        snapshot_domains: Vec<String>,
        mut phase_rx: watch::Receiver<ShutdownPhase>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel(JOB_QUEUE_SIZE);
        let manager = Self(Arc::new(Inner {
            logger,
            db,
            orig_ctimes,
            tiers,
            cameras,
            snapshot_domains,
            job_tx,
            job_states: Mutex::new(HashMap::new()),
        }));

        // Worker pool.
        let job_rx = Arc::new(Mutex::new(job_rx));
        for _ in 0..WORKER_POOL_SIZE {
            let manager2 = manager.clone();
            let job_rx2 = job_rx.clone();
            let token2 = token.clone();
            let shutdown_complete2 = shutdown_complete.clone();
            tokio::spawn(async move {
                let _shutdown_complete = shutdown_complete2;
                loop {
                    let key = {
                        let mut rx = job_rx2.lock().await;
                        tokio::select! {
                            () = token2.cancelled() => return,
                            key = rx.recv() => key,
                        }
                    };
                    let Some(key) = key else {
                        return;
                    };
                    manager2.run_job(&key).await;
                }
            });
        }

        // Interval tickers per key.
        for camera in &manager.0.cameras {
            for tier_index in 0..manager.0.tiers.len() {
                let interval =
                    std::time::Duration::from_secs(manager.0.tiers[tier_index].check_interval);
                let mut keys = vec![JobKey {
                    camera_id: camera.camera_id.clone(),
                    tier_index,
                    category: Category::Recorder,
                    subcategory: Subcategory::Segments,
                }];
                for domain in &manager.0.snapshot_domains {
                    keys.push(JobKey {
                        camera_id: camera.camera_id.clone(),
                        tier_index,
                        category: Category::Snapshots,
                        subcategory: Subcategory::Domain(domain.clone()),
                    });
                }
                for key in keys {
                    let manager2 = manager.clone();
                    let token2 = token.clone();
                    tokio::spawn(async move {
                        let mut ticker = tokio::time::interval(interval);
                        ticker.tick().await; // Immediate first tick.
                        loop {
                            tokio::select! {
                                () = token2.cancelled() => return,
                                _ = ticker.tick() => {
                                    manager2.run_now(key.clone());
                                }
                            }
                        }
                    });
                }
            }
        }

        // Ad-hoc triggers from the bus.
        {
            let manager2 = manager.clone();
            let token2 = token.clone();
            let mut bus_rx = bus.subscribe();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        () = token2.cancelled() => return,
                        event = bus_rx.recv() => event,
                    };
                    match event {
                        Ok(BusEvent::CheckTier {
                            camera_id,
                            tier_id,
                            category,
                            subcategory,
                        }) => {
                            manager2.run_now(JobKey {
                                camera_id,
                                tier_index: tier_id,
                                category,
                                subcategory,
                            });
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
            });
        }

        // Shutdown drain for move_on_shutdown tiers.
        {
            let manager2 = manager.clone();
            let token2 = token.clone();
            let shutdown_complete2 = shutdown_complete;
            tokio::spawn(async move {
                let _shutdown_complete = shutdown_complete2;
                loop {
                    tokio::select! {
                        () = token2.cancelled() => return,
                        res = phase_rx.changed() => {
                            if res.is_err() {
                                return;
                            }
                        }
                    }
                    if *phase_rx.borrow_and_update() >= ShutdownPhase::LastWrite {
                        manager2.force_move_on_shutdown().await;
                        return;
                    }
                }
            });
        }

        manager
    }

    /// Enqueues the job, dropping the trigger if the queue is full.
    /// The periodic ticker guarantees eventual execution.
    pub fn run_now(&self, key: JobKey) {
        _ = self.0.job_tx.try_send(key);
    }

    async fn run_job(&self, key: &JobKey) {
        let state = {
            let mut states = self.0.job_states.lock().await;
            states
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(JobState {
                        lock: Mutex::new(()),
                        last_run: std::sync::Mutex::new(None),
                    })
                })
                .clone()
        };

        // Coalesce concurrent triggers.
        let Ok(_guard) = state.lock.try_lock() else {
            return;
        };

        let now = UnixNano::now();
        {
            let last_run = state.last_run.lock().expect("not poisoned");
            let throttled = last_run
                .and_then(|last| now.sub(last))
                .is_some_and(|age| age < THROTTLE);
            if throttled {
                return;
            }
        }

        if let Err(e) = self.sweep(key, false).await {
            self.log(
                LogLevel::Error,
                &key.camera_id,
                &format!("tier sweep failed: {e}"),
            );
        }

        *state.last_run.lock().expect("not poisoned") = Some(UnixNano::now());
    }

    fn log(&self, level: LogLevel, camera_id: &CameraId, msg: &str) {
        self.0.logger.log(LogEntry::new(
            level,
            "tiers",
            Some(camera_id.clone()),
            msg.to_owned(),
        ));
    }

    fn camera(&self, camera_id: &CameraId) -> Option<&CameraRetention> {
        self.0.cameras.iter().find(|c| &c.camera_id == camera_id)
    }

    /// Next tier index with the given role enabled, if any.
    fn next_tier(&self, from: usize, role: impl Fn(&TierConfig) -> bool) -> Option<usize> {
        self.0
            .tiers
            .iter()
            .enumerate()
            .skip(from + 1)
            .find(|(_, t)| role(t))
            .map(|(i, _)| i)
    }

    pub async fn sweep(&self, key: &JobKey, drain: bool) -> Result<(), SweepError> {
        match (key.category, &key.subcategory) {
            (Category::Recorder, Subcategory::Segments) => {
                self.sweep_segments(key, drain).await
            }
            (Category::Snapshots, Subcategory::Domain(_)) => {
                self.sweep_snapshots(key, drain).await
            }
            // Thumbnails and event clips are slaved to their
            // recording inside the segments sweep.
            _ => Ok(()),
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn sweep_segments(&self, key: &JobKey, drain: bool) -> Result<(), SweepError> {
        let Some(camera) = self.camera(&key.camera_id).cloned() else {
            return Ok(());
        };
        let tier = &self.0.tiers[key.tier_index];

        let rows = self
            .0
            .db
            .files_by_tier(
                &key.camera_id,
                i64::try_from(key.tier_index).unwrap_or(0),
                Category::Recorder,
                &Subcategory::Segments,
            )
            .await?;
        let rows: Vec<FileRow> = rows
            .into_iter()
            .filter(|r| r.filename.ends_with(".m4s") && r.orig_ctime.is_some())
            .collect();
        if rows.is_empty() {
            return Ok(());
        }

        let now = UnixNano::now();
        let now_naive = now.as_naive_utc().expect("time representable");

        // Recordings whose window intersects the fragment span.
        let span_from = rows
            .first()
            .and_then(|r| r.orig_ctime)
            .expect("filtered on orig_ctime");
        let span_to = rows
            .last()
            .and_then(|r| r.end_time())
            .and_then(|t| t.add_duration(camera.segment_length))
            .and_then(|t| t.as_naive_utc())
            .unwrap_or(now_naive);
        let recordings = self
            .0
            .db
            .recordings_intersecting(&key.camera_id, span_from, span_to, now_naive)
            .await?;

        let windows: Vec<(RecordingMeta, UnixNano, UnixNano)> = recordings
            .iter()
            .map(|r| {
                let start = r.adjusted_start_time.map_or_else(
                    || {
                        UnixNano::from_naive_utc(r.start_time)
                            .sub_duration(camera.lookback)
                            .and_then(|t| t.sub_duration(camera.segment_length))
                            .unwrap_or_else(|| UnixNano::from_naive_utc(r.start_time))
                    },
                    UnixNano::from_naive_utc,
                );
                let end = r
                    .end_time
                    .map_or(now, UnixNano::from_naive_utc)
                    .add_duration(camera.segment_length)
                    .unwrap_or(UnixNano::MAX);
                (
                    RecordingMeta {
                        id: r.id,
                        created_at: UnixNano::from_naive_utc(r.created_at),
                    },
                    start,
                    end,
                )
            })
            .collect();
        let metas: Vec<RecordingMeta> = windows.iter().map(|(m, _, _)| *m).collect();

        let mut infos: Vec<FragmentInfo> = rows
            .iter()
            .map(|r| FragmentInfo {
                file_id: r.id,
                size: u64::try_from(r.size).unwrap_or(0),
                orig_ctime: UnixNano::from_naive_utc(
                    r.orig_ctime.expect("filtered on orig_ctime"),
                ),
                recording_ids: Vec::new(),
            })
            .collect();
        label_fragments(&mut infos, &windows);

        let events_enabled = tier.events.enabled();
        let continuous_enabled = tier.continuous.enabled() && camera.continuous_recording;

        let events_set = if drain {
            drain_candidates(&infos)
        } else if events_enabled {
            event_candidates(&infos, &metas, &tier.events.params(), now)
        } else {
            HashSet::new()
        };
        let continuous_set = if drain {
            drain_candidates(&infos)
        } else if continuous_enabled {
            continuous_candidates(&infos, &tier.continuous.params(), camera.lookback, now)
        } else if !camera.continuous_recording {
            let horizon = camera
                .lookback
                .checked_add(camera.segment_length)
                .unwrap_or(camera.lookback);
            orphan_candidates(&infos, horizon, now)
        } else {
            HashSet::new()
        };

        let next = NextTiers {
            events: self.next_tier(key.tier_index, |t| t.events.enabled()),
            continuous: if camera.continuous_recording {
                self.next_tier(key.tier_index, |t| t.continuous.enabled())
            } else {
                None
            },
        };

        // Apply, tracking per-recording outcomes for the slaved
        // thumbnail and event-clip moves.
        let mut kept: HashSet<i64> = HashSet::new();
        let mut moved_to: HashMap<i64, usize> = HashMap::new();
        let mut deleted: HashSet<i64> = HashSet::new();
        let mut processed = 0;

        for (info, row) in infos.iter().zip(&rows) {
            if processed >= tier.batch_size {
                tokio::time::sleep(SLEEP_BETWEEN_BATCHES).await;
                processed = 0;
            }

            let action = decide(
                info,
                events_set.contains(&info.file_id),
                continuous_set.contains(&info.file_id),
                next,
            );
            match action {
                FileAction::Keep => {
                    kept.extend(&info.recording_ids);
                }
                FileAction::MoveTo(dest) => {
                    processed += 1;
                    if self.move_row_to_tier(&key.camera_id, row, dest).await {
                        for id in &info.recording_ids {
                            moved_to.insert(*id, dest);
                        }
                    } else {
                        kept.extend(&info.recording_ids);
                    }
                }
                FileAction::Delete => {
                    processed += 1;
                    self.delete_row(&key.camera_id, row).await;
                    deleted.extend(&info.recording_ids);
                }
            }
        }

        // Thumbnails and event clips follow once no fragment of the
        // recording remains on this tier.
        for (recording_id, dest) in &moved_to {
            if kept.contains(recording_id) {
                continue;
            }
            self.move_recording_assets(&key.camera_id, *recording_id, key.tier_index, *dest)
                .await;
        }

        // On the last events tier a pruned recording takes its row,
        // thumbnail and clip with it.
        if next.events.is_none() {
            let fully_deleted: Vec<i64> = deleted
                .iter()
                .filter(|id| !kept.contains(*id) && !moved_to.contains_key(*id))
                .copied()
                .collect();
            if !fully_deleted.is_empty() {
                self.delete_recordings_fully(&key.camera_id, key.tier_index, &fully_deleted)
                    .await;
            }
        }

        Ok(())
    }

    async fn sweep_snapshots(&self, key: &JobKey, drain: bool) -> Result<(), SweepError> {
        let tier = &self.0.tiers[key.tier_index];
        let rows = self
            .0
            .db
            .files_by_tier(
                &key.camera_id,
                i64::try_from(key.tier_index).unwrap_or(0),
                Category::Snapshots,
                &key.subcategory,
            )
            .await?;
        if rows.is_empty() {
            return Ok(());
        }

        let now = UnixNano::now();
        let infos: Vec<FragmentInfo> = rows
            .iter()
            .map(|r| FragmentInfo {
                file_id: r.id,
                size: u64::try_from(r.size).unwrap_or(0),
                orig_ctime: r
                    .orig_ctime
                    .map_or(now, UnixNano::from_naive_utc),
                recording_ids: Vec::new(),
            })
            .collect();

        let selected = if drain {
            drain_candidates(&infos)
        } else if tier.snapshots.enabled() {
            continuous_candidates(&infos, &tier.snapshots.params(), Duration::default(), now)
        } else {
            return Ok(());
        };

        let next = self.next_tier(key.tier_index, |t| t.snapshots.enabled());
        let mut processed = 0;
        for (info, row) in infos.iter().zip(&rows) {
            if !selected.contains(&info.file_id) {
                continue;
            }
            if processed >= tier.batch_size {
                tokio::time::sleep(SLEEP_BETWEEN_BATCHES).await;
                processed = 0;
            }
            processed += 1;
            match next {
                Some(dest) => {
                    self.move_row_to_tier(&key.camera_id, row, dest).await;
                }
                None => self.delete_row(&key.camera_id, row).await,
            }
        }
        Ok(())
    }

    /// Copy to the destination tier, rewrite the row, then remove the
    /// source. The row points at the source until the destination
    /// write is durable, so an interrupted move resumes cleanly.
    async fn move_row_to_tier(
        &self,
        camera_id: &CameraId,
        row: &FileRow,
        dest_tier_index: usize,
    ) -> bool {
        let dest_tier = &self.0.tiers[dest_tier_index];
        if !dest_tier.path.is_dir() {
            self.log(
                LogLevel::Error,
                camera_id,
                &format!("move destination missing: {:?}", dest_tier.path),
            );
            return false;
        }

        let source = PathBuf::from(&row.path);
        let relative = match Path::new(&row.path).strip_prefix(&row.tier_path) {
            Ok(v) => v.to_path_buf(),
            Err(_) => {
                self.log(
                    LogLevel::Error,
                    camera_id,
                    &format!("file path outside its tier: {}", row.path),
                );
                return false;
            }
        };
        let destination = dest_tier.path.join(relative);

        if let Err(e) = copy_durable(&source, &destination).await {
            self.log(
                LogLevel::Error,
                camera_id,
                &format!("copy {source:?} to next tier: {e}"),
            );
            if is_disk_full(&e) {
                self.emergency_prune(camera_id, dest_tier_index).await;
            }
            return false;
        }

        if let Some(orig_ctime) = row.orig_ctime {
            self.0.orig_ctimes.insert(destination.clone(), orig_ctime);
        }

        let moved = self
            .0
            .db
            .writer()
            .move_file(MoveFile {
                id: row.id,
                tier_id: i64::try_from(dest_tier_index).unwrap_or(0),
                tier_path: dest_tier.path.clone(),
                path: destination,
            })
            .await;
        if let Err(e) = moved {
            self.log(LogLevel::Error, camera_id, &format!("rewrite row: {e}"));
            return false;
        }

        if let Err(e) = tokio::fs::remove_file(&source).await {
            self.log(
                LogLevel::Error,
                camera_id,
                &format!("remove moved source {source:?}: {e}"),
            );
        }
        true
    }

    async fn delete_row(&self, camera_id: &CameraId, row: &FileRow) {
        if let Err(e) = tokio::fs::remove_file(&row.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                self.log(
                    LogLevel::Error,
                    camera_id,
                    &format!("delete {}: {e}", row.path),
                );
            }
        }
        _ = self.0.db.writer().delete_file(Path::new(&row.path)).await;
    }

    async fn move_recording_assets(
        &self,
        camera_id: &CameraId,
        recording_id: i64,
        src_tier_index: usize,
        dest_tier_index: usize,
    ) {
        let src_tier = &self.0.tiers[src_tier_index];
        let dest_tier = &self.0.tiers[dest_tier_index];

        for (subdir, extension, thumbnail) in [
            ("thumbnails", "jpg", true),
            ("event_clips", "mp4", false),
        ] {
            let name = format!("{recording_id}.{extension}");
            let source = src_tier
                .path
                .join(subdir)
                .join(camera_id.to_string())
                .join(&name);
            if !source.is_file() {
                continue;
            }
            let destination = dest_tier
                .path
                .join(subdir)
                .join(camera_id.to_string())
                .join(&name);

            if let Err(e) = copy_durable(&source, &destination).await {
                self.log(
                    LogLevel::Error,
                    camera_id,
                    &format!("move recording asset {source:?}: {e}"),
                );
                continue;
            }

            if let Ok(Some(row)) = self.0.db.file_by_path(&source).await {
                _ = self
                    .0
                    .db
                    .writer()
                    .move_file(MoveFile {
                        id: row.id,
                        tier_id: i64::try_from(dest_tier_index).unwrap_or(0),
                        tier_path: dest_tier.path.clone(),
                        path: destination.clone(),
                    })
                    .await;
            }
            let writer = self.0.db.writer();
            if thumbnail {
                _ = writer.set_thumbnail_path(recording_id, &destination).await;
            } else {
                _ = writer.set_clip_path(recording_id, &destination).await;
            }
            _ = tokio::fs::remove_file(&source).await;
        }
    }

    /// A recording pruned off the last tier takes its row, thumbnail
    /// and event clip with it.
    async fn delete_recordings_fully(
        &self,
        camera_id: &CameraId,
        tier_index: usize,
        recording_ids: &[i64],
    ) {
        let tier = &self.0.tiers[tier_index];
        for recording_id in recording_ids {
            for (subdir, extension) in [("thumbnails", "jpg"), ("event_clips", "mp4")] {
                let path = tier
                    .path
                    .join(subdir)
                    .join(camera_id.to_string())
                    .join(format!("{recording_id}.{extension}"));
                if path.is_file() {
                    _ = tokio::fs::remove_file(&path).await;
                }
                _ = self.0.db.writer().delete_file(&path).await;
            }
        }
        self.log(
            LogLevel::Debug,
            camera_id,
            &format!("deleting recordings: {recording_ids:?}"),
        );
        _ = self
            .0
            .db
            .writer()
            .delete_recordings(recording_ids.to_vec())
            .await;
    }

    /// Safety valve for a full destination tier. Regular policy is
    /// bypassed and the oldest fragments are dropped outright.
    async fn emergency_prune(&self, camera_id: &CameraId, tier_index: usize) {
        self.log(
            LogLevel::Warning,
            camera_id,
            "tier filesystem full, dropping oldest fragments regardless of retention policy",
        );
        let tier = &self.0.tiers[tier_index];
        let Ok(rows) = self
            .0
            .db
            .files_by_tier(
                camera_id,
                i64::try_from(tier_index).unwrap_or(0),
                Category::Recorder,
                &Subcategory::Segments,
            )
            .await
        else {
            return;
        };
        for row in rows.iter().take(tier.batch_size) {
            self.delete_row(camera_id, row).await;
        }
    }

    async fn force_move_on_shutdown(&self) {
        for (tier_index, tier) in self.0.tiers.iter().enumerate() {
            if !tier.move_on_shutdown {
                continue;
            }
            for camera in self.0.cameras.clone() {
                self.log(LogLevel::Info, &camera.camera_id, "draining tier on shutdown");
                let mut keys = vec![JobKey {
                    camera_id: camera.camera_id.clone(),
                    tier_index,
                    category: Category::Recorder,
                    subcategory: Subcategory::Segments,
                }];
                for domain in &self.0.snapshot_domains {
                    keys.push(JobKey {
                        camera_id: camera.camera_id.clone(),
                        tier_index,
                        category: Category::Snapshots,
                        subcategory: Subcategory::Domain(domain.clone()),
                    });
                }
                for key in keys {
                    if let Err(e) = self.sweep(&key, true).await {
                        self.log(
                            LogLevel::Error,
                            &key.camera_id,
                            &format!("shutdown drain failed: {e}"),
                        );
                    }
                }
            }
        }
    }
}

/// Copy with the destination flushed to disk before the caller
/// removes the source.
async fn copy_durable(source: &Path, destination: &Path) -> std::io::Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(source, destination).await?;
    let file = tokio::fs::File::open(destination).await?;
    file.sync_all().await?;
    Ok(())
}

fn is_disk_full(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(28) // ENOSPC
}
