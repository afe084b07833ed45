// SPDX-License-Identifier: GPL-2.0-or-later

// All row mutations are serialized through a single writer actor so
// watcher events, the fragmenter and tier sweeps never race on the
// same row. Busy errors are retried with exponential backoff up to
// five seconds, after that the request is dropped and logged; sweeps
// are idempotent so a dropped request self-heals on the next pass.

use crate::log_db;
use chrono::NaiveDateTime;
use common::{
    ArcLogger, CameraId, Detections, LogLevel,
    recording::{Category, Subcategory, TriggerType},
    time::UnixNano,
};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Clone, Debug)]
pub struct NewFile {
    pub tier_id: i64,
    pub tier_path: PathBuf,
    pub camera_id: CameraId,
    pub category: Category,
    pub subcategory: Subcategory,
    pub path: PathBuf,
    pub size: i64,
    pub orig_ctime: NaiveDateTime,
    pub duration: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct NewRecording {
    pub camera_id: CameraId,
    pub start_time: NaiveDateTime,
    pub adjusted_start_time: NaiveDateTime,
    pub trigger_type: TriggerType,
    pub trigger_id: Option<i64>,
    pub thumbnail_path: PathBuf,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("database busy")]
    Busy,

    #[error("writer stopped")]
    Stopped,

    #[error("query: {0}")]
    Query(sqlx::Error),
}

#[rustfmt::skip]
enum WriteRequest {
    InsertFile((oneshot::Sender<Result<i64, WriteError>>, NewFile)),
    UpdateFileSize((oneshot::Sender<Result<(), WriteError>>, PathBuf, i64)),
    SetFileDuration((oneshot::Sender<Result<(), WriteError>>, PathBuf, f64)),
    MoveFile((oneshot::Sender<Result<(), WriteError>>, MoveFile)),
    DeleteFile((oneshot::Sender<Result<(), WriteError>>, PathBuf)),
    InsertRecording((oneshot::Sender<Result<i64, WriteError>>, NewRecording)),
    CloseRecording((oneshot::Sender<Result<(), WriteError>>, i64, NaiveDateTime)),
    SetClipPath((oneshot::Sender<Result<(), WriteError>>, i64, PathBuf)),
    SetThumbnailPath((oneshot::Sender<Result<(), WriteError>>, i64, PathBuf)),
    DeleteRecordings((oneshot::Sender<Result<(), WriteError>>, Vec<i64>)),
    InsertObjects((oneshot::Sender<Result<(), WriteError>>, CameraId, Detections, NaiveDateTime)),
    InsertMotion((oneshot::Sender<Result<i64, WriteError>>, CameraId, NaiveDateTime)),
    CloseMotion((oneshot::Sender<Result<(), WriteError>>, i64, NaiveDateTime)),
    Stop(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct MoveFile {
    pub id: i64,
    pub tier_id: i64,
    pub tier_path: PathBuf,
    pub path: PathBuf,
}

#[derive(Clone)]
pub struct FileDbWriter(mpsc::Sender<WriteRequest>);

macro_rules! request {
    ($self:ident, $variant:ident, $($arg:expr),*) => {{
        let (tx, rx) = oneshot::channel();
        if $self
            .0
            .send(WriteRequest::$variant((tx, $($arg),*)))
            .await
            .is_err()
        {
            return Err(WriteError::Stopped);
        }
        rx.await.map_err(|_| WriteError::Stopped)?
    }};
}

impl FileDbWriter {
    #[must_use]
    pub(crate) fn new(logger: ArcLogger, pool: SqlitePool) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            run_writer(logger, pool, rx).await;
        });
        Self(tx)
    }

    pub async fn insert_file(&self, file: NewFile) -> Result<i64, WriteError> {
        request!(self, InsertFile, file)
    }

    pub async fn update_file_size(&self, path: &Path, size: i64) -> Result<(), WriteError> {
        request!(self, UpdateFileSize, path.to_path_buf(), size)
    }

    pub async fn set_file_duration(&self, path: &Path, duration: f64) -> Result<(), WriteError> {
        request!(self, SetFileDuration, path.to_path_buf(), duration)
    }

    /// Rewrites tier and path atomically after the destination write
    /// is durable. The row points at the source until this commits.
    pub async fn move_file(&self, req: MoveFile) -> Result<(), WriteError> {
        request!(self, MoveFile, req)
    }

    pub async fn delete_file(&self, path: &Path) -> Result<(), WriteError> {
        request!(self, DeleteFile, path.to_path_buf())
    }

    pub async fn insert_recording(&self, rec: NewRecording) -> Result<i64, WriteError> {
        request!(self, InsertRecording, rec)
    }

    pub async fn close_recording(
        &self,
        id: i64,
        end_time: NaiveDateTime,
    ) -> Result<(), WriteError> {
        request!(self, CloseRecording, id, end_time)
    }

    pub async fn set_clip_path(&self, id: i64, clip_path: &Path) -> Result<(), WriteError> {
        request!(self, SetClipPath, id, clip_path.to_path_buf())
    }

    pub async fn set_thumbnail_path(&self, id: i64, path: &Path) -> Result<(), WriteError> {
        request!(self, SetThumbnailPath, id, path.to_path_buf())
    }

    pub async fn delete_recordings(&self, ids: Vec<i64>) -> Result<(), WriteError> {
        request!(self, DeleteRecordings, ids)
    }

    pub async fn insert_objects(
        &self,
        camera_id: CameraId,
        detections: Detections,
        time: UnixNano,
    ) -> Result<(), WriteError> {
        let Some(time) = time.as_naive_utc() else {
            return Ok(());
        };
        request!(self, InsertObjects, camera_id, detections, time)
    }

    pub async fn insert_motion(
        &self,
        camera_id: CameraId,
        start_time: NaiveDateTime,
    ) -> Result<i64, WriteError> {
        request!(self, InsertMotion, camera_id, start_time)
    }

    pub async fn close_motion(&self, id: i64, end_time: NaiveDateTime) -> Result<(), WriteError> {
        request!(self, CloseMotion, id, end_time)
    }

    pub(crate) async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.0.send(WriteRequest::Stop(tx)).await.is_ok() {
            _ = rx.await;
        }
    }
}

async fn run_writer(logger: ArcLogger, pool: SqlitePool, mut rx: mpsc::Receiver<WriteRequest>) {
    while let Some(request) = rx.recv().await {
        match request {
            WriteRequest::InsertFile((res, file)) => {
                _ = res.send(with_backoff(&logger, || insert_file(&pool, &file)).await);
            }
            WriteRequest::UpdateFileSize((res, path, size)) => {
                _ = res.send(
                    with_backoff(&logger, || update_file_size(&pool, &path, size)).await,
                );
            }
            WriteRequest::SetFileDuration((res, path, duration)) => {
                _ = res.send(
                    with_backoff(&logger, || set_file_duration(&pool, &path, duration)).await,
                );
            }
            WriteRequest::MoveFile((res, req)) => {
                _ = res.send(with_backoff(&logger, || move_file(&pool, &req)).await);
            }
            WriteRequest::DeleteFile((res, path)) => {
                _ = res.send(with_backoff(&logger, || delete_file(&pool, &path)).await);
            }
            WriteRequest::InsertRecording((res, rec)) => {
                _ = res.send(with_backoff(&logger, || insert_recording(&pool, &rec)).await);
            }
            WriteRequest::CloseRecording((res, id, end_time)) => {
                _ = res.send(
                    with_backoff(&logger, || close_recording(&pool, id, end_time)).await,
                );
            }
            WriteRequest::SetClipPath((res, id, clip_path)) => {
                _ = res.send(
                    with_backoff(&logger, || set_clip_path(&pool, id, &clip_path)).await,
                );
            }
            WriteRequest::SetThumbnailPath((res, id, path)) => {
                _ = res.send(
                    with_backoff(&logger, || set_thumbnail_path(&pool, id, &path)).await,
                );
            }
            WriteRequest::DeleteRecordings((res, ids)) => {
                _ = res.send(with_backoff(&logger, || delete_recordings(&pool, &ids)).await);
            }
            WriteRequest::InsertObjects((res, camera_id, detections, time)) => {
                _ = res.send(
                    with_backoff(&logger, || insert_objects(&pool, &camera_id, &detections, time))
                        .await,
                );
            }
            WriteRequest::InsertMotion((res, camera_id, start_time)) => {
                _ = res.send(
                    with_backoff(&logger, || insert_motion(&pool, &camera_id, start_time)).await,
                );
            }
            WriteRequest::CloseMotion((res, id, end_time)) => {
                _ = res.send(with_backoff(&logger, || close_motion(&pool, id, end_time)).await);
            }
            WriteRequest::Stop(res) => {
                _ = res.send(());
                return;
            }
        }
    }
}

const BACKOFF_START_MS: u64 = 100;
const BACKOFF_TOTAL_MS: u64 = 5000;

fn is_busy(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            let code = db.code();
            matches!(code.as_deref(), Some("5" | "6" | "517"))
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

async fn with_backoff<T, F, Fut>(logger: &ArcLogger, mut op: F) -> Result<T, WriteError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut delay_ms = BACKOFF_START_MS;
    let mut total_ms = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_busy(&e) => {
                if total_ms + delay_ms > BACKOFF_TOTAL_MS {
                    log_db(logger, LogLevel::Warning, "database busy, skipping write");
                    return Err(WriteError::Busy);
                }
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                total_ms += delay_ms;
                delay_ms *= 2;
            }
            Err(e) => return Err(WriteError::Query(e)),
        }
    }
}

fn split_path(path: &Path) -> (String, String) {
    let directory = path
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();
    let filename = path
        .file_name()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();
    (directory, filename)
}

fn now_naive() -> NaiveDateTime {
    UnixNano::now()
        .as_naive_utc()
        .expect("current time should be representable")
}

// Idempotent per path: a second insert only refreshes the size, the
// original orig_ctime and duration win.
async fn insert_file(pool: &SqlitePool, file: &NewFile) -> Result<i64, sqlx::Error> {
    let (directory, filename) = split_path(&file.path);
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO files (tier_id, tier_path, camera_identifier, category, \
            subcategory, path, directory, filename, size, orig_ctime, duration, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(path) DO UPDATE SET \
            size = excluded.size, \
            updated_at = excluded.created_at \
         RETURNING id",
    )
    .bind(file.tier_id)
    .bind(file.tier_path.to_string_lossy())
    .bind(file.camera_id.to_string())
    .bind(file.category.as_str())
    .bind(file.subcategory.as_str())
    .bind(file.path.to_string_lossy())
    .bind(directory)
    .bind(filename)
    .bind(file.size)
    .bind(file.orig_ctime)
    .bind(file.duration)
    .bind(now_naive())
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

async fn update_file_size(pool: &SqlitePool, path: &Path, size: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE files SET size = ?, updated_at = ? WHERE path = ?")
        .bind(size)
        .bind(now_naive())
        .bind(path.to_string_lossy())
        .execute(pool)
        .await?;
    Ok(())
}

async fn set_file_duration(
    pool: &SqlitePool,
    path: &Path,
    duration: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE files SET duration = ?, updated_at = ? WHERE path = ?")
        .bind(duration)
        .bind(now_naive())
        .bind(path.to_string_lossy())
        .execute(pool)
        .await?;
    Ok(())
}

async fn move_file(pool: &SqlitePool, req: &MoveFile) -> Result<(), sqlx::Error> {
    let (directory, filename) = split_path(&req.path);
    sqlx::query(
        "UPDATE files SET tier_id = ?, tier_path = ?, path = ?, directory = ?, \
            filename = ?, updated_at = ? WHERE id = ?",
    )
    .bind(req.tier_id)
    .bind(req.tier_path.to_string_lossy())
    .bind(req.path.to_string_lossy())
    .bind(directory)
    .bind(filename)
    .bind(now_naive())
    .bind(req.id)
    .execute(pool)
    .await?;
    Ok(())
}

async fn delete_file(pool: &SqlitePool, path: &Path) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM files WHERE path = ?")
        .bind(path.to_string_lossy())
        .execute(pool)
        .await?;
    Ok(())
}

async fn insert_recording(pool: &SqlitePool, rec: &NewRecording) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO recordings (camera_identifier, start_time, adjusted_start_time, \
            trigger_type, trigger_id, thumbnail_path, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(rec.camera_id.to_string())
    .bind(rec.start_time)
    .bind(rec.adjusted_start_time)
    .bind(rec.trigger_type.as_str())
    .bind(rec.trigger_id)
    .bind(rec.thumbnail_path.to_string_lossy())
    .bind(now_naive())
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

async fn close_recording(
    pool: &SqlitePool,
    id: i64,
    end_time: NaiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE recordings SET end_time = ?, updated_at = ? WHERE id = ?")
        .bind(end_time)
        .bind(now_naive())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn set_clip_path(pool: &SqlitePool, id: i64, clip_path: &Path) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE recordings SET clip_path = ?, updated_at = ? WHERE id = ?")
        .bind(clip_path.to_string_lossy())
        .bind(now_naive())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn set_thumbnail_path(
    pool: &SqlitePool,
    id: i64,
    path: &Path,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE recordings SET thumbnail_path = ?, updated_at = ? WHERE id = ?")
        .bind(path.to_string_lossy())
        .bind(now_naive())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn delete_recordings(pool: &SqlitePool, ids: &[i64]) -> Result<(), sqlx::Error> {
    for id in ids {
        sqlx::query("DELETE FROM recordings WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
    }
    Ok(())
}

async fn insert_objects(
    pool: &SqlitePool,
    camera_id: &CameraId,
    detections: &Detections,
    time: NaiveDateTime,
) -> Result<(), sqlx::Error> {
    for d in detections {
        sqlx::query(
            "INSERT INTO objects (camera_identifier, label, confidence, width, height, \
                x1, y1, x2, y2, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(camera_id.to_string())
        .bind(&*d.label)
        .bind(f64::from(d.score))
        .bind(f64::from(d.region.width))
        .bind(f64::from(d.region.height))
        .bind(f64::from(d.region.x))
        .bind(f64::from(d.region.y))
        .bind(f64::from(d.region.x + d.region.width))
        .bind(f64::from(d.region.y + d.region.height))
        .bind(time)
        .execute(pool)
        .await?;
    }
    Ok(())
}

async fn insert_motion(
    pool: &SqlitePool,
    camera_id: &CameraId,
    start_time: NaiveDateTime,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO motion (camera_identifier, start_time, created_at) \
         VALUES (?, ?, ?) RETURNING id",
    )
    .bind(camera_id.to_string())
    .bind(start_time)
    .bind(now_naive())
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

async fn close_motion(
    pool: &SqlitePool,
    id: i64,
    end_time: NaiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE motion SET end_time = ?, updated_at = ? WHERE id = ?")
        .bind(end_time)
        .bind(now_naive())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
