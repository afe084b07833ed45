// SPDX-License-Identifier: GPL-2.0-or-later

// Turns closed MP4 segments into HLS-ready fragments. Every five
// seconds the camera temp directory is swept: files no longer held
// open by the decoder are rewritten into an init segment plus one
// media fragment, the exact duration is parsed from the side playlist
// and recorded in the segment index, then the fragment is moved into
// the first tier's segments directory.

mod concat;
mod openfiles;

pub use concat::{ClipFragment, ConcatError, concatenate_fragments, generate_concat_playlist};
pub use openfiles::files_in_use;

use chrono::NaiveDateTime;
use common::{
    ArcMsgLogger, CameraId, LogLevel, MsgLogger, ShutdownPhase,
    recording::{Category, Subcategory},
    time::UnixNano,
};
use filedb::{FileDbWriter, NewFile, OrigCtimes};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
};
use thiserror::Error;
use tokio::{process::Command, sync::{mpsc, watch}};
use tokio_util::sync::CancellationToken;

const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
const QUARANTINE_AFTER_FAILURES: u32 = 3;
const QUARANTINE_DIR: &str = "quarantine";

pub struct FragmenterConfig {
    pub camera_id: CameraId,

    /// Where the external decoder writes `${ts}.mp4` files.
    pub temp_segments_dir: PathBuf,

    /// `<tier_root>/segments/<camera_id>`.
    pub segments_dir: PathBuf,

    /// Row coordinates of the first tier.
    pub tier_id: i64,
    pub tier_path: PathBuf,
}

/// Spawns the sweep loop. On `LastWrite` the loop runs one final
/// sweep and exits; the app only enters that phase after the camera's
/// stream reader has stopped.
pub fn start_fragmenter(
    token: CancellationToken,
    shutdown_complete: mpsc::Sender<()>,
    logger: ArcMsgLogger,
    writer: FileDbWriter,
    orig_ctimes: OrigCtimes,
    config: FragmenterConfig,
    mut phase_rx: watch::Receiver<ShutdownPhase>,
) {
    let mut fragmenter = Fragmenter {
        logger,
        writer,
        orig_ctimes,
        config,
        failures: HashMap::new(),
    };
    tokio::spawn(async move {
        let _shutdown_complete = shutdown_complete;
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = interval.tick() => {
                    fragmenter.sweep().await;
                }
                res = phase_rx.changed() => {
                    if res.is_err() {
                        return;
                    }
                    if *phase_rx.borrow_and_update() >= ShutdownPhase::LastWrite {
                        fragmenter.log(LogLevel::Debug, "running final sweep");
                        fragmenter.sweep().await;
                        return;
                    }
                }
            }
        }
    });
}

struct Fragmenter {
    logger: ArcMsgLogger,
    writer: FileDbWriter,
    orig_ctimes: OrigCtimes,
    config: FragmenterConfig,

    /// Consecutive failure count per source file.
    failures: HashMap<PathBuf, u32>,
}

#[derive(Debug, Error)]
enum FragmentFileError {
    #[error("create workdir: {0}")]
    CreateWorkdir(std::io::Error),

    #[error("run fragmenting tool: {0}")]
    RunTool(std::io::Error),

    #[error("fragmenting tool exited with {0}")]
    ToolStatus(std::process::ExitStatus),

    #[error("read side playlist: {0}")]
    ReadPlaylist(std::io::Error),

    #[error("no EXTINF in side playlist")]
    NoExtinf,

    #[error("register fragment: {0}")]
    Register(#[from] filedb::WriteError),

    #[error("move fragment: {0}")]
    MoveFragment(std::io::Error),

    #[error("move init: {0}")]
    MoveInit(std::io::Error),
}

impl Fragmenter {
    fn log(&self, level: LogLevel, msg: &str) {
        self.logger.log(level, msg);
    }

    async fn sweep(&mut self) {
        self.log(LogLevel::Debug, "checking for new segments to fragment");

        let temp_dir = self.config.temp_segments_dir.clone();
        let mut mp4s = match list_mp4s(&temp_dir).await {
            Ok(v) => v,
            Err(e) => {
                self.log(LogLevel::Error, &format!("list temp segments: {e}"));
                return;
            }
        };
        mp4s.sort();

        let in_use = tokio::task::spawn_blocking(move || files_in_use(&temp_dir))
            .await
            .expect("join");

        for mp4 in mp4s {
            if in_use.contains(&mp4) {
                continue;
            }
            match self.fragment_file(&mp4).await {
                Ok(()) => {
                    self.failures.remove(&mp4);
                    self.cleanup_source(&mp4).await;
                }
                Err(e) => {
                    self.log(LogLevel::Error, &format!("fragment {mp4:?}: {e}"));
                    let failures = self.failures.entry(mp4.clone()).or_insert(0);
                    *failures += 1;
                    if *failures >= QUARANTINE_AFTER_FAILURES {
                        self.quarantine(&mp4).await;
                        self.failures.remove(&mp4);
                    }
                }
            }
        }
    }

    async fn fragment_file(&self, mp4: &Path) -> Result<(), FragmentFileError> {
        use FragmentFileError::*;

        let stem = file_stem(mp4);
        let workdir = self.config.temp_segments_dir.join(&stem);
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(CreateWorkdir)?;

        let status = Command::new("MP4Box")
            .args([
                "-logs",
                "dash@error:ncl",
                "-noprog",
                "-dash",
                "10000",
                "-rap",
                "-frag-rap",
                "-segment-name",
                "clip_",
                "-out",
            ])
            .arg(workdir.join("master.m3u8"))
            .arg(mp4)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(RunTool)?;
        if !status.success() {
            return Err(ToolStatus(status));
        }

        // The first EXTINF in the side playlist is the authoritative
        // duration.
        let playlist = tokio::fs::read_to_string(workdir.join("master_1.m3u8"))
            .await
            .map_err(ReadPlaylist)?;
        let extinf = extract_extinf(&playlist).ok_or(NoExtinf)?;

        let orig_ctime = self.segment_start_time(mp4, &stem).await;
        let destination = self.config.segments_dir.join(format!("{stem}.m4s"));

        // Hand the capture time to the watcher so its created-event
        // insert is populated correctly whichever write lands first.
        self.orig_ctimes.insert(destination.clone(), orig_ctime);

        let size = tokio::fs::metadata(workdir.join("clip_1.m4s"))
            .await
            .map(|m| i64::try_from(m.len()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        self.writer
            .insert_file(NewFile {
                tier_id: self.config.tier_id,
                tier_path: self.config.tier_path.clone(),
                camera_id: self.config.camera_id.clone(),
                category: Category::Recorder,
                subcategory: Subcategory::Segments,
                path: destination.clone(),
                size,
                orig_ctime,
                duration: Some(extinf),
            })
            .await?;

        move_file(&workdir.join("clip_1.m4s"), &destination)
            .await
            .map_err(MoveFragment)?;
        // The per-camera init is overwritten on every segment.
        move_file(
            &workdir.join("clip_init.mp4"),
            &self.config.segments_dir.join("init.mp4"),
        )
        .await
        .map_err(MoveInit)?;

        Ok(())
    }

    /// The segment muxer names files by their start unix time.
    async fn segment_start_time(&self, mp4: &Path, stem: &str) -> NaiveDateTime {
        if let Some(t) = stem
            .parse::<i64>()
            .ok()
            .and_then(|secs| UnixNano::from_secs(secs).as_naive_utc())
        {
            return t;
        }
        if let Ok(modified) = tokio::fs::metadata(mp4)
            .await
            .and_then(|m| m.modified())
        {
            let since_epoch = modified
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            if let Some(t) =
                UnixNano::from_secs(i64::try_from(since_epoch.as_secs()).unwrap_or(0))
                    .as_naive_utc()
            {
                return t;
            }
        }
        UnixNano::now()
            .as_naive_utc()
            .expect("current time representable")
    }

    async fn cleanup_source(&self, mp4: &Path) {
        if let Err(e) = tokio::fs::remove_file(mp4).await {
            self.log(LogLevel::Error, &format!("remove source {mp4:?}: {e}"));
        }
        let workdir = self.config.temp_segments_dir.join(file_stem(mp4));
        if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
            self.log(LogLevel::Error, &format!("remove workdir {workdir:?}: {e}"));
        }
    }

    /// Same file failing three times in a row is parked so it cannot
    /// wedge the sweep.
    async fn quarantine(&self, mp4: &Path) {
        let Some(file_name) = mp4.file_name() else {
            return;
        };
        let quarantine_dir = self.config.temp_segments_dir.join(QUARANTINE_DIR);
        if let Err(e) = tokio::fs::create_dir_all(&quarantine_dir).await {
            self.log(LogLevel::Error, &format!("create quarantine dir: {e}"));
            return;
        }
        let target = quarantine_dir.join(file_name);
        match move_file(mp4, &target).await {
            Ok(()) => {
                self.log(
                    LogLevel::Warning,
                    &format!("quarantined {mp4:?} after repeated fragmentation failures"),
                );
                let workdir = self.config.temp_segments_dir.join(file_stem(mp4));
                _ = tokio::fs::remove_dir_all(&workdir).await;
            }
            Err(e) => {
                self.log(LogLevel::Error, &format!("quarantine {mp4:?}: {e}"));
            }
        }
    }
}

async fn list_mp4s(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "mp4")
            && entry.file_type().await?.is_file()
        {
            out.push(path);
        }
    }
    Ok(out)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Rename, falling back to copy and remove across filesystems. The
/// copy lands under a temporary name so readers never observe a
/// partial file at the destination.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    let tmp = to.with_extension("tmp");
    tokio::fs::copy(from, &tmp).await?;
    tokio::fs::rename(&tmp, to).await?;
    tokio::fs::remove_file(from).await
}

/// Extracts the first EXTINF value from a playlist.
#[must_use]
pub fn extract_extinf(playlist: &str) -> Option<f64> {
    for line in playlist.lines() {
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let value = rest.trim_end_matches(',');
            return value.parse().ok();
        }
    }
    None
}
