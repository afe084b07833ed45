// SPDX-License-Identifier: GPL-2.0-or-later

// Relational catalog of every file on disk under a monitored tier
// path. Single source of truth for HLS playlist generation and tier
// migration. All mutations funnel through one serialized writer, see
// `writer.rs`. Readers query the pool directly.

mod watcher;
mod writer;

pub use watcher::{
    FsEvent, FsEventKind, OrigCtimes, PollWatcher, WatchError, WatchedPath, Watcher, WatcherHub,
};
pub use writer::{FileDbWriter, MoveFile, NewFile, NewRecording, WriteError};

use chrono::NaiveDateTime;
use common::{
    ArcLogger, CameraId, ILogger, LogEntry, LogLevel,
    recording::{Category, Subcategory},
    time::{Duration, UnixNano},
};
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use thiserror::Error;

/// One row in the `files` table. `orig_ctime` is the wall-clock
/// capture time of the first frame in the fragment, `duration` is the
/// authoritative EXTINF value written by the fragmenter.
#[derive(Clone, Debug, PartialEq, FromRow)]
pub struct FileRow {
    pub id: i64,
    pub tier_id: i64,
    pub tier_path: String,
    pub camera_identifier: String,
    pub category: String,
    pub subcategory: String,
    pub path: String,
    pub directory: String,
    pub filename: String,
    pub size: i64,
    pub orig_ctime: Option<NaiveDateTime>,
    pub duration: Option<f64>,
    pub created_at: NaiveDateTime,
    pub updated_at: Option<NaiveDateTime>,
}

impl FileRow {
    #[must_use]
    pub fn duration_nanos(&self) -> Duration {
        Duration::from_secs_f64(self.duration.unwrap_or_default())
    }

    /// End of the fragment interval, None if `orig_ctime` is unset.
    #[must_use]
    pub fn end_time(&self) -> Option<UnixNano> {
        let start = UnixNano::from_naive_utc(self.orig_ctime?);
        start.add_duration(self.duration_nanos())
    }
}

#[derive(Clone, Debug, PartialEq, FromRow)]
pub struct RecordingRow {
    pub id: i64,
    pub camera_identifier: String,
    pub start_time: NaiveDateTime,
    pub adjusted_start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub trigger_type: Option<String>,
    pub trigger_id: Option<i64>,
    pub thumbnail_path: String,
    pub clip_path: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: Option<NaiveDateTime>,
}

#[derive(Debug, Error)]
pub enum OpenDbError {
    #[error("parse options: {0}")]
    ParseOptions(sqlx::Error),

    #[error("connect: {0}")]
    Connect(sqlx::Error),

    #[error("migrate: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Error)]
#[error("query: {0}")]
pub struct QueryError(#[from] sqlx::Error);

const FILE_COLUMNS: &str = "id, tier_id, tier_path, camera_identifier, category, \
    subcategory, path, directory, filename, size, orig_ctime, duration, \
    created_at, updated_at";

pub struct FileDb {
    pool: SqlitePool,
    writer: FileDbWriter,
}

impl FileDb {
    /// Opens the database, applying any pending migrations. An empty
    /// database is created at the latest schema version.
    pub async fn open(logger: ArcLogger, db_path: &Path) -> Result<Arc<Self>, OpenDbError> {
        use OpenDbError::*;
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.to_string_lossy()))
                .map_err(ParseOptions)?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_millis(250));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(Connect)?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let writer = FileDbWriter::new(logger, pool.clone());
        Ok(Arc::new(Self { pool, writer }))
    }

    #[must_use]
    pub fn writer(&self) -> &FileDbWriter {
        &self.writer
    }

    pub async fn close(&self) {
        self.writer.stop().await;
        self.pool.close().await;
    }

    pub async fn recording_by_id(&self, id: i64) -> Result<Option<RecordingRow>, QueryError> {
        let row = sqlx::query_as::<_, RecordingRow>("SELECT * FROM recordings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn recordings_by_ids(&self, ids: &[i64]) -> Result<Vec<RecordingRow>, QueryError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.recording_by_id(*id).await? {
                out.push(row);
            }
        }
        Ok(out)
    }

    /// Fragments whose interval intersects `[from, to]`, including the
    /// single fragment that started before the window but ends inside
    /// it. Duplicated filenames keep the row with the newest
    /// `created_at`, which handles the in-flight tier-move case.
    pub async fn fragments_in_range(
        &self,
        camera_id: &CameraId,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<FileRow>, QueryError> {
        let rows = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files \
             WHERE camera_identifier = ? \
               AND category = 'recorder' \
               AND subcategory = 'segments' \
               AND filename LIKE '%.m4s' \
               AND orig_ctime IS NOT NULL \
               AND julianday(orig_ctime) * 86400.0 + COALESCE(duration, 0.0) \
                   >= julianday(?) * 86400.0 \
               AND orig_ctime <= ? \
             ORDER BY orig_ctime ASC"
        ))
        .bind(camera_id.to_string())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(deduplicate_by_filename(rows))
    }

    /// The set of fragments belonging to a recording:
    /// `[start_time - lookback, end_time or now]` plus the leading
    /// fragment rule.
    pub async fn fragments_for_recording(
        &self,
        recording: &RecordingRow,
        lookback: Duration,
        now: NaiveDateTime,
    ) -> Result<Vec<FileRow>, QueryError> {
        let camera_id: CameraId = recording
            .camera_identifier
            .parse()
            .map_err(|_| QueryError(sqlx::Error::RowNotFound))?;
        let from = UnixNano::from_naive_utc(recording.start_time)
            .sub_duration(lookback)
            .and_then(|v| v.as_naive_utc())
            .unwrap_or(recording.start_time);
        let to = recording.end_time.unwrap_or(now);
        self.fragments_in_range(&camera_id, from, to).await
    }

    /// All files for a tier sweep, oldest first.
    pub async fn files_by_tier(
        &self,
        camera_id: &CameraId,
        tier_id: i64,
        category: Category,
        subcategory: &Subcategory,
    ) -> Result<Vec<FileRow>, QueryError> {
        let rows = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files \
             WHERE camera_identifier = ? \
               AND tier_id = ? \
               AND category = ? \
               AND subcategory = ? \
             ORDER BY orig_ctime ASC, id ASC"
        ))
        .bind(camera_id.to_string())
        .bind(tier_id)
        .bind(category.as_str())
        .bind(subcategory.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Recordings whose `[adjusted_start_time, end_time or now]`
    /// intersects `[from, to]`.
    pub async fn recordings_intersecting(
        &self,
        camera_id: &CameraId,
        from: NaiveDateTime,
        to: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<Vec<RecordingRow>, QueryError> {
        let rows = sqlx::query_as::<_, RecordingRow>(
            "SELECT * FROM recordings \
             WHERE camera_identifier = ? \
               AND COALESCE(adjusted_start_time, start_time) <= ? \
               AND COALESCE(end_time, ?) >= ? \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(camera_id.to_string())
        .bind(to)
        .bind(now)
        .bind(from)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn file_by_path(&self, path: &Path) -> Result<Option<FileRow>, QueryError> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE path = ?"
        ))
        .bind(path.to_string_lossy())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn file_paths(&self) -> Result<Vec<PathBuf>, QueryError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT path FROM files")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(p,)| PathBuf::from(p)).collect())
    }
}

/// Keeps the most recently indexed row per filename. The query orders
/// by `orig_ctime`, so the output stays sorted.
fn deduplicate_by_filename(rows: Vec<FileRow>) -> Vec<FileRow> {
    let mut newest: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Option<FileRow>> = Vec::with_capacity(rows.len());

    for row in rows {
        if let Some(&prev) = newest.get(&row.filename) {
            let keep_new = out[prev]
                .as_ref()
                .is_some_and(|p| row.created_at > p.created_at);
            if keep_new {
                out[prev] = Some(row);
            }
            continue;
        }
        newest.insert(row.filename.clone(), out.len());
        out.push(Some(row));
    }

    out.into_iter().flatten().collect()
}

pub(crate) fn log_db(logger: &ArcLogger, level: LogLevel, msg: &str) {
    logger.log(LogEntry::new(level, "filedb", None, msg.to_owned()));
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use common::DummyLogger;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn naive(secs: i64) -> NaiveDateTime {
        DateTime::from_timestamp(secs, 0).unwrap().naive_utc()
    }

    async fn test_db() -> (TempDir, Arc<FileDb>) {
        let tmp = TempDir::new().unwrap();
        let db = FileDb::open(DummyLogger::new(), &tmp.path().join("files.db"))
            .await
            .unwrap();
        (tmp, db)
    }

    fn cam(s: &str) -> CameraId {
        s.parse().unwrap()
    }

    fn new_fragment(camera: &str, tier_path: &str, stem: i64, duration: f64) -> NewFile {
        NewFile {
            tier_id: 0,
            tier_path: PathBuf::from(tier_path),
            camera_id: cam(camera),
            category: Category::Recorder,
            subcategory: Subcategory::Segments,
            path: PathBuf::from(format!("{tier_path}/segments/{camera}/{stem}.m4s")),
            size: 10,
            orig_ctime: naive(stem),
            duration: Some(duration),
        }
    }

    #[tokio::test]
    async fn test_open_empty_db_migrates_to_latest() {
        let (_tmp, db) = test_db().await;
        // files_meta is gone after the final migration.
        let err = sqlx::query("SELECT count(*) FROM files_meta")
            .fetch_one(&db.pool)
            .await;
        assert!(err.is_err());
        sqlx::query("SELECT orig_ctime, duration FROM files")
            .fetch_all(&db.pool)
            .await
            .unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_fragments_in_range_leading_fragment() {
        let (_tmp, db) = test_db().await;
        let w = db.writer();

        // 100..105, 105..110, 110..115.
        for stem in [100, 105, 110] {
            w.insert_file(new_fragment("cam1", "/tier0", stem, 5.0))
                .await
                .unwrap();
        }

        // Window starts inside the first fragment.
        let got = db
            .fragments_in_range(&cam("cam1"), naive(103), naive(111))
            .await
            .unwrap();
        let stems: Vec<&str> = got.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(vec!["100.m4s", "105.m4s", "110.m4s"], stems);

        // Window starts exactly at a boundary excludes the closed one.
        let got = db
            .fragments_in_range(&cam("cam1"), naive(106), naive(111))
            .await
            .unwrap();
        let stems: Vec<&str> = got.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(vec!["105.m4s", "110.m4s"], stems);
        db.close().await;
    }

    #[tokio::test]
    async fn test_fragments_dedupe_prefers_newest_row() {
        let (_tmp, db) = test_db().await;
        let w = db.writer();

        let id = w
            .insert_file(new_fragment("cam1", "/tier0", 100, 5.0))
            .await
            .unwrap();
        // Same filename in-flight on the next tier.
        let mut moved = new_fragment("cam1", "/tier1", 100, 5.0);
        moved.tier_id = 1;
        w.insert_file(moved).await.unwrap();

        let got = db
            .fragments_in_range(&cam("cam1"), naive(90), naive(120))
            .await
            .unwrap();
        assert_eq!(1, got.len());
        assert_eq!(1, got[0].tier_id);
        assert_ne!(id, got[0].id);
        db.close().await;
    }

    #[tokio::test]
    async fn test_insert_file_idempotent_per_path() {
        let (_tmp, db) = test_db().await;
        let w = db.writer();

        let first = new_fragment("cam1", "/tier0", 100, 5.0);
        w.insert_file(first.clone()).await.unwrap();

        // Second insert for the same path must not reset orig_ctime.
        let mut second = first.clone();
        second.orig_ctime = naive(999);
        second.size = 77;
        w.insert_file(second).await.unwrap();

        let row = db.file_by_path(&first.path).await.unwrap().unwrap();
        assert_eq!(Some(naive(100)), row.orig_ctime);
        assert_eq!(77, row.size);
        db.close().await;
    }

    #[tokio::test]
    async fn test_recordings_intersecting() {
        let (_tmp, db) = test_db().await;
        let w = db.writer();

        let id = w
            .insert_recording(NewRecording {
                camera_id: cam("cam1"),
                start_time: naive(100),
                adjusted_start_time: naive(90),
                trigger_type: common::recording::TriggerType::Object,
                trigger_id: None,
                thumbnail_path: PathBuf::from("/t/1.jpg"),
            })
            .await
            .unwrap();
        w.close_recording(id, naive(120)).await.unwrap();

        let got = db
            .recordings_intersecting(&cam("cam1"), naive(110), naive(130), naive(200))
            .await
            .unwrap();
        assert_eq!(1, got.len());

        let got = db
            .recordings_intersecting(&cam("cam1"), naive(121), naive(130), naive(200))
            .await
            .unwrap();
        assert!(got.is_empty());
        db.close().await;
    }

    #[test]
    fn test_deduplicate_by_filename_keeps_order() {
        let mk = |filename: &str, created: i64| FileRow {
            id: 0,
            tier_id: 0,
            tier_path: String::new(),
            camera_identifier: "cam1".to_owned(),
            category: "recorder".to_owned(),
            subcategory: "segments".to_owned(),
            path: format!("/x/{filename}/{created}"),
            directory: String::new(),
            filename: filename.to_owned(),
            size: 0,
            orig_ctime: None,
            duration: None,
            created_at: naive(created),
            updated_at: None,
        };
        let rows = vec![
            mk("1.m4s", 10),
            mk("2.m4s", 10),
            mk("1.m4s", 20),
            mk("3.m4s", 10),
        ];
        let got = deduplicate_by_filename(rows);
        let names: Vec<(&str, i64)> = got
            .iter()
            .map(|r| {
                (
                    r.filename.as_str(),
                    r.created_at.and_utc().timestamp(),
                )
            })
            .collect();
        assert_eq!(vec![("1.m4s", 20), ("2.m4s", 10), ("3.m4s", 10)], names);
    }
}
