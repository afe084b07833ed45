// SPDX-License-Identifier: GPL-2.0-or-later

// Filesystem watcher feeding the segment index. Two backends behind
// the same event shape: inotify via the `notify` crate and a polling
// fallback selected per tier. Modified events coalesce with a one
// second debounce before the size is re-read.

use crate::{FileDbWriter, NewFile, log_db};
use chrono::NaiveDateTime;
use common::{
    ArcEventBus, ArcLogger, BusEvent, CameraId, LogLevel,
    recording::{Category, Subcategory},
    time::{Duration, UnixNano},
};
use notify::Watcher as _;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
}

/// A tier root to watch. `poll` selects the polling backend.
#[derive(Clone, Debug)]
pub struct WatchedPath {
    pub tier_id: i64,
    pub tier_path: PathBuf,
    pub poll: bool,
}

/// In-memory hand-off of the original capture time for files that the
/// fragmenter or tier manager is about to place. Lets the watcher
/// populate `orig_ctime` without guessing.
#[derive(Clone, Default)]
pub struct OrigCtimes(Arc<Mutex<HashMap<PathBuf, NaiveDateTime>>>);

impl OrigCtimes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: PathBuf, orig_ctime: NaiveDateTime) {
        self.0
            .lock()
            .expect("not poisoned")
            .insert(path, orig_ctime);
    }

    pub fn take(&self, path: &Path) -> Option<NaiveDateTime> {
        self.0.lock().expect("not poisoned").remove(path)
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("create watcher: {0}")]
    CreateWatcher(notify::Error),

    #[error("watch path: {0}")]
    WatchPath(notify::Error),

    #[error("create directory: {0}")]
    CreateDir(std::io::Error),
}

pub trait Watcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatchError>;
}

/// Inotify-backed watcher. The notify callback runs on its own thread
/// and forwards into the hub's channel.
pub struct NotifyWatcher {
    inner: notify::RecommendedWatcher,
}

impl NotifyWatcher {
    pub fn new(tx: mpsc::UnboundedSender<FsEvent>) -> Result<Self, WatchError> {
        let inner = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            let Ok(event) = res else {
                return;
            };
            let kind = match event.kind {
                notify::EventKind::Create(_) => FsEventKind::Created,
                notify::EventKind::Modify(_) => FsEventKind::Modified,
                notify::EventKind::Remove(_) => FsEventKind::Deleted,
                _ => return,
            };
            for path in event.paths {
                _ = tx.send(FsEvent { kind, path });
            }
        })
        .map_err(WatchError::CreateWatcher)?;
        Ok(Self { inner })
    }
}

impl Watcher for NotifyWatcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatchError> {
        std::fs::create_dir_all(path).map_err(WatchError::CreateDir)?;
        self.inner
            .watch(path, notify::RecursiveMode::Recursive)
            .map_err(WatchError::WatchPath)
    }
}

/// Polling fallback for filesystems without inotify support.
pub struct PollWatcher {
    tx: mpsc::UnboundedSender<FsEvent>,
    interval: std::time::Duration,
    token: CancellationToken,
}

impl PollWatcher {
    #[must_use]
    pub fn new(
        token: CancellationToken,
        tx: mpsc::UnboundedSender<FsEvent>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            tx,
            interval,
            token,
        }
    }
}

impl Watcher for PollWatcher {
    fn watch(&mut self, path: &Path) -> Result<(), WatchError> {
        std::fs::create_dir_all(path).map_err(WatchError::CreateDir)?;
        let tx = self.tx.clone();
        let token = self.token.clone();
        let interval = self.interval;
        let root = path.to_path_buf();
        tokio::spawn(async move {
            let mut seen: HashMap<PathBuf, (u64, Option<std::time::SystemTime>)> = snapshot(&root);
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }
                let current = snapshot(&root);
                for (path, state) in &current {
                    match seen.get(path) {
                        None => {
                            _ = tx.send(FsEvent {
                                kind: FsEventKind::Created,
                                path: path.clone(),
                            });
                        }
                        Some(prev) if prev != state => {
                            _ = tx.send(FsEvent {
                                kind: FsEventKind::Modified,
                                path: path.clone(),
                            });
                        }
                        Some(_) => {}
                    }
                }
                for path in seen.keys() {
                    if !current.contains_key(path) {
                        _ = tx.send(FsEvent {
                            kind: FsEventKind::Deleted,
                            path: path.clone(),
                        });
                    }
                }
                seen = current;
            }
        });
        Ok(())
    }
}

fn snapshot(root: &Path) -> HashMap<PathBuf, (u64, Option<std::time::SystemTime>)> {
    let mut out = HashMap::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let path = entry.path();
            if metadata.is_dir() {
                dirs.push(path);
            } else {
                out.insert(path, (metadata.len(), metadata.modified().ok()));
            }
        }
    }
    out
}

const MODIFY_DEBOUNCE: Duration = Duration::new(common::time::SECOND);
const DEBOUNCE_FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);

const INDEXED_EXTENSIONS: [&str; 3] = ["m4s", "mp4", "jpg"];

/// Owns the watcher backends and applies their events to the index.
pub struct WatcherHub {
    // Backends deliver events for as long as this is alive.
    _notify: Option<NotifyWatcher>,
}

impl WatcherHub {
    pub fn start(
        token: CancellationToken,
        logger: ArcLogger,
        bus: ArcEventBus,
        writer: FileDbWriter,
        orig_ctimes: OrigCtimes,
        paths: Vec<WatchedPath>,
    ) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut notify_watcher = None;
        let mut poll_watcher = PollWatcher::new(
            token.clone(),
            tx.clone(),
            std::time::Duration::from_secs(1),
        );
        for watched in &paths {
            if watched.poll {
                poll_watcher.watch(&watched.tier_path)?;
            } else {
                if notify_watcher.is_none() {
                    notify_watcher = Some(NotifyWatcher::new(tx.clone())?);
                }
                if let Some(w) = &mut notify_watcher {
                    w.watch(&watched.tier_path)?;
                }
            }
        }

        tokio::spawn(async move {
            run_hub(token, logger, bus, writer, orig_ctimes, paths, rx).await;
        });

        Ok(Self {
            _notify: notify_watcher,
        })
    }
}

async fn run_hub(
    token: CancellationToken,
    logger: ArcLogger,
    bus: ArcEventBus,
    writer: FileDbWriter,
    orig_ctimes: OrigCtimes,
    paths: Vec<WatchedPath>,
    mut rx: mpsc::UnboundedReceiver<FsEvent>,
) {
    let mut pending_modified: HashMap<PathBuf, UnixNano> = HashMap::new();
    let mut flush = tokio::time::interval(DEBOUNCE_FLUSH_INTERVAL);
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            _ = flush.tick() => {
                let now = UnixNano::now();
                let due: Vec<PathBuf> = pending_modified
                    .iter()
                    .filter(|(_, first_seen)| {
                        now.sub(**first_seen).is_some_and(|age| age >= MODIFY_DEBOUNCE)
                    })
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    pending_modified.remove(&path);
                    apply_modified(&writer, &path).await;
                }
            }
            event = rx.recv() => {
                let Some(event) = event else {
                    return;
                };
                let Some(location) = locate(&paths, &event.path) else {
                    continue;
                };
                if !indexable(&event.path) {
                    continue;
                }
                match event.kind {
                    FsEventKind::Created => {
                        apply_created(
                            &logger,
                            &bus,
                            &writer,
                            &orig_ctimes,
                            &location,
                            &event.path,
                        )
                        .await;
                    }
                    FsEventKind::Modified => {
                        pending_modified
                            .entry(event.path)
                            .or_insert_with(UnixNano::now);
                    }
                    FsEventKind::Deleted => {
                        pending_modified.remove(&event.path);
                        apply_deleted(&bus, &writer, &location, &event.path).await;
                    }
                }
            }
        }
    }
}

struct Location {
    tier_id: i64,
    tier_path: PathBuf,
    camera_id: CameraId,
    category: Category,
    subcategory: Subcategory,
}

fn locate(paths: &[WatchedPath], path: &Path) -> Option<Location> {
    for watched in paths {
        let Ok(rel) = path.strip_prefix(&watched.tier_path) else {
            continue;
        };
        let mut components = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string());
        let first = components.next()?;
        let (category, subcategory, camera) = match first.as_str() {
            "segments" => (Category::Recorder, Subcategory::Segments, components.next()?),
            "event_clips" => (
                Category::Recorder,
                Subcategory::EventClips,
                components.next()?,
            ),
            "thumbnails" => (
                Category::Recorder,
                Subcategory::Thumbnails,
                components.next()?,
            ),
            "snapshots" => {
                let domain = components.next()?;
                (
                    Category::Snapshots,
                    Subcategory::Domain(domain),
                    components.next()?,
                )
            }
            _ => return None,
        };
        // The next component must be the file itself.
        components.next()?;
        let camera_id = camera.parse().ok()?;
        return Some(Location {
            tier_id: watched.tier_id,
            tier_path: watched.tier_path.clone(),
            camera_id,
            category,
            subcategory,
        });
    }
    None
}

fn indexable(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    if name.starts_with('.') || name == "init.mp4" {
        return false;
    }
    path.extension()
        .map(|e| e.to_string_lossy())
        .is_some_and(|ext| INDEXED_EXTENSIONS.contains(&ext.as_ref()))
}

async fn apply_created(
    logger: &ArcLogger,
    bus: &ArcEventBus,
    writer: &FileDbWriter,
    orig_ctimes: &OrigCtimes,
    location: &Location,
    path: &Path,
) {
    // The file may already be gone again.
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return;
    };

    let now = UnixNano::now();
    let orig_ctime = orig_ctimes.take(path).unwrap_or_else(|| {
        now.as_naive_utc().expect("current time representable")
    });

    let result = writer
        .insert_file(NewFile {
            tier_id: location.tier_id,
            tier_path: location.tier_path.clone(),
            camera_id: location.camera_id.clone(),
            category: location.category,
            subcategory: location.subcategory.clone(),
            path: path.to_path_buf(),
            size: i64::try_from(metadata.len()).unwrap_or(i64::MAX),
            orig_ctime,
            duration: None,
        })
        .await;
    if let Err(e) = result {
        log_db(logger, LogLevel::Error, &format!("index created file: {e}"));
        return;
    }

    bus.send(BusEvent::FileCreated {
        camera_id: location.camera_id.clone(),
        category: location.category,
        subcategory: location.subcategory.clone(),
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        path: path.to_path_buf(),
        time: now,
    });
}

async fn apply_modified(writer: &FileDbWriter, path: &Path) {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return;
    };
    _ = writer
        .update_file_size(path, i64::try_from(metadata.len()).unwrap_or(i64::MAX))
        .await;
}

async fn apply_deleted(
    bus: &ArcEventBus,
    writer: &FileDbWriter,
    location: &Location,
    path: &Path,
) {
    _ = writer.delete_file(path).await;
    bus.send(BusEvent::FileDeleted {
        camera_id: location.camera_id.clone(),
        category: location.category,
        subcategory: location.subcategory.clone(),
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        path: path.to_path_buf(),
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn watched(tier_id: i64, path: &str) -> WatchedPath {
        WatchedPath {
            tier_id,
            tier_path: PathBuf::from(path),
            poll: false,
        }
    }

    #[test]
    fn test_locate_segments() {
        let paths = vec![watched(0, "/tier0"), watched(1, "/tier1")];
        let loc = locate(&paths, Path::new("/tier1/segments/cam1/123.m4s")).unwrap();
        assert_eq!(1, loc.tier_id);
        assert_eq!("cam1", &*loc.camera_id);
        assert_eq!(Category::Recorder, loc.category);
        assert_eq!(Subcategory::Segments, loc.subcategory);
    }

    #[test]
    fn test_locate_snapshots() {
        let paths = vec![watched(0, "/tier0")];
        let loc = locate(&paths, Path::new("/tier0/snapshots/object/cam1/a.jpg")).unwrap();
        assert_eq!(Category::Snapshots, loc.category);
        assert_eq!(Subcategory::Domain("object".to_owned()), loc.subcategory);
    }

    #[test]
    fn test_locate_unknown() {
        let paths = vec![watched(0, "/tier0")];
        assert!(locate(&paths, Path::new("/tier0/other/cam1/a.jpg")).is_none());
        assert!(locate(&paths, Path::new("/elsewhere/segments/cam1/a.m4s")).is_none());
        // Directory itself, no file component.
        assert!(locate(&paths, Path::new("/tier0/segments/cam1")).is_none());
    }

    #[test_case("/a/123.m4s", true; "m4s")]
    #[test_case("/a/clip.mp4", true; "mp4")]
    #[test_case("/a/thumb.jpg", true; "jpg")]
    #[test_case("/a/init.mp4", false; "init")]
    #[test_case("/a/.hidden.mp4", false; "hidden")]
    #[test_case("/a/master.m3u8", false; "playlist")]
    fn test_indexable(path: &str, want: bool) {
        assert_eq!(want, indexable(Path::new(path)));
    }

    #[test]
    fn test_orig_ctimes_take_removes() {
        let ctimes = OrigCtimes::new();
        let path = PathBuf::from("/x/1.m4s");
        let t = chrono::DateTime::from_timestamp(100, 0).unwrap().naive_utc();
        ctimes.insert(path.clone(), t);
        assert_eq!(Some(t), ctimes.take(&path));
        assert_eq!(None, ctimes.take(&path));
    }

    #[tokio::test]
    async fn test_poll_watcher_detects_changes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("segments").join("cam1");
        std::fs::create_dir_all(&dir).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let mut watcher = PollWatcher::new(
            token.clone(),
            tx,
            std::time::Duration::from_millis(20),
        );
        watcher.watch(tmp.path()).unwrap();

        let file = dir.join("100.m4s");
        std::fs::write(&file, b"abc").unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(
            FsEvent {
                kind: FsEventKind::Created,
                path: file.clone()
            },
            event
        );

        std::fs::write(&file, b"abcdef").unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(FsEventKind::Modified, event.kind);

        std::fs::remove_file(&file).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(FsEventKind::Deleted, event.kind);

        token.cancel();
    }
}
