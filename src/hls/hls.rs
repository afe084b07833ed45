// SPDX-License-Identifier: GPL-2.0-or-later

// HLS playlist assembly against the segment index. Playlists are
// built on demand for either a recording id or an explicit time
// window. Correctness leans on the fragmenter invariants: fragments
// are indexed in capture order with authoritative EXTINF durations,
// and every fragment decodes against the camera's current init
// segment.

use chrono::NaiveDateTime;
use common::{
    CameraId,
    time::{Duration, SECOND, UnixNano},
};
use filedb::{FileDb, FileRow, QueryError, RecordingRow};
use thiserror::Error;

/// Fragments separated by more than this are treated as a hole in the
/// stream.
const GAP_TOLERANCE: Duration = Duration::new(SECOND / 2);

/// Force ENDLIST if the recording ended this long ago even when the
/// trailing fragment looks unfinished. Prevents players from waiting
/// forever on a final segment that never closed.
const STALE_AFTER: Duration = Duration::new(60 * SECOND);

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("query: {0}")]
    Query(#[from] QueryError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlaylistFragment {
    pub uri: String,
    pub duration: f64,
    pub start: UnixNano,
}

pub struct HlsAssembler {
    /// Prefix turning an indexed path into a servable URI.
    files_route: String,
}

impl HlsAssembler {
    #[must_use]
    pub fn new(files_route: String) -> Self {
        Self { files_route }
    }

    /// Playlist for a recording. Returns None when the recording does
    /// not exist; in-progress recordings yield a playlist without
    /// ENDLIST.
    pub async fn playlist_for_recording(
        &self,
        db: &FileDb,
        recording_id: i64,
        lookback: Duration,
        now: UnixNano,
    ) -> Result<Option<String>, AssembleError> {
        let now_naive = now.as_naive_utc().expect("time representable");
        let Some(recording) = db.recording_by_id(recording_id).await? else {
            return Ok(None);
        };

        let rows = db
            .fragments_for_recording(&recording, lookback, now_naive)
            .await?;
        let fragments = self.to_fragments(&rows);
        let init_uri = self.init_uri(&recording.camera_identifier, &rows);
        let end = playlist_ended(&recording, &rows, now);

        Ok(Some(assemble_playlist(&fragments, &init_uri, 0, end)))
    }

    /// Playlist for an arbitrary time window.
    pub async fn playlist_for_range(
        &self,
        db: &FileDb,
        camera_id: &CameraId,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<String, AssembleError> {
        let rows = db.fragments_in_range(camera_id, from, to).await?;
        let fragments = self.to_fragments(&rows);
        let init_uri = self.init_uri(camera_id, &rows);
        Ok(assemble_playlist(&fragments, &init_uri, 0, true))
    }

    fn to_fragments(&self, rows: &[FileRow]) -> Vec<PlaylistFragment> {
        rows.iter()
            .filter_map(|row| {
                let orig_ctime = row.orig_ctime?;
                let duration = row.duration?;
                Some(PlaylistFragment {
                    uri: format!("{}{}", self.files_route, row.path),
                    duration,
                    start: UnixNano::from_naive_utc(orig_ctime),
                })
            })
            .collect()
    }

    /// All fragments of a camera share one init segment next to them.
    fn init_uri(&self, camera_identifier: &str, rows: &[FileRow]) -> String {
        if let Some(first) = rows.first() {
            return format!("{}{}/init.mp4", self.files_route, first.directory);
        }
        format!("{}segments/{}/init.mp4", self.files_route, camera_identifier)
    }
}

/// ENDLIST decision for a recording playlist.
fn playlist_ended(recording: &RecordingRow, rows: &[FileRow], now: UnixNano) -> bool {
    let Some(end_time) = recording.end_time else {
        return false;
    };
    let end_time = UnixNano::from_naive_utc(end_time);

    // Ended long ago, the trailing fragment is never going to close.
    let stale = now
        .sub(end_time)
        .is_some_and(|age| age > STALE_AFTER);
    if stale {
        return true;
    }

    // Ended, but the fragment covering the end has not appeared yet.
    if let Some(last) = rows.last() {
        if let Some(last_end) = last.end_time() {
            if end_time.after(last_end) {
                return false;
            }
        }
    }
    true
}

/// Renders the playlist. Every fragment is independently decodable,
/// so each entry is preceded by a discontinuity plus its wall-clock
/// timestamp; holes in the chain are marked with EXT-X-GAP.
#[must_use]
#[allow(
    clippy::as_conversions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn assemble_playlist(
    fragments: &[PlaylistFragment],
    init_uri: &str,
    media_sequence: u64,
    end: bool,
) -> String {
    let mut lines = Vec::new();
    lines.push("#EXTM3U".to_owned());
    lines.push("#EXT-X-VERSION:6".to_owned());
    lines.push(format!("#EXT-X-MEDIA-SEQUENCE:{media_sequence}"));

    // EXTINF rounded to the nearest integer must not exceed
    // TARGETDURATION.
    let target_duration = fragments
        .iter()
        .map(|f| f.duration.ceil() as u64)
        .max()
        .unwrap_or(1);
    lines.push(format!("#EXT-X-TARGETDURATION:{target_duration}"));
    lines.push("#EXT-X-INDEPENDENT-SEGMENTS".to_owned());
    lines.push(format!("#EXT-X-MAP:URI=\"{init_uri}\""));

    let mut prev_end: Option<UnixNano> = None;
    for fragment in fragments {
        lines.push("#EXT-X-DISCONTINUITY".to_owned());
        if let Some(prev_end) = prev_end {
            let hole = fragment
                .start
                .sub(prev_end)
                .is_some_and(|gap| gap > GAP_TOLERANCE);
            if hole {
                lines.push("#EXT-X-GAP".to_owned());
            }
        }
        if let Some(date_time) = fragment.start.as_naive_utc() {
            lines.push(format!(
                "#EXT-X-PROGRAM-DATE-TIME:{}",
                date_time.format("%Y-%m-%dT%H:%M:%S%.3fZ")
            ));
        }
        lines.push(format!("#EXTINF:{},", fragment.duration));
        lines.push(fragment.uri.clone());

        prev_end = fragment
            .start
            .add_duration(Duration::from_secs_f64(fragment.duration));
    }

    if end {
        lines.push("#EXT-X-ENDLIST".to_owned());
    }
    lines.join("\n")
}
