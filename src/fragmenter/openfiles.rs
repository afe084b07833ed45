// SPDX-License-Identifier: GPL-2.0-or-later

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

const DECODER_PROCESS_PATTERNS: [&str; 2] = ["ffmpeg", "gst"];

/// Files under `dir` currently held open by an external decoder
/// process. The segment muxer keeps the newest MP4 open until it
/// rolls over, fragmenting it early would truncate it.
#[must_use]
pub fn files_in_use(dir: &Path) -> HashSet<PathBuf> {
    files_in_use_from_proc(Path::new("/proc"), dir)
}

fn files_in_use_from_proc(proc_root: &Path, dir: &Path) -> HashSet<PathBuf> {
    let mut in_use = HashSet::new();
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return in_use;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }

        let pid_dir = entry.path();
        let Ok(comm) = std::fs::read_to_string(pid_dir.join("comm")) else {
            continue;
        };
        if !DECODER_PROCESS_PATTERNS
            .iter()
            .any(|p| comm.contains(p))
        {
            continue;
        }

        let Ok(fds) = std::fs::read_dir(pid_dir.join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            if target.starts_with(dir) {
                in_use.insert(target);
            }
        }
    }

    in_use
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_files_in_use_from_fake_proc() {
        let tmp = TempDir::new().unwrap();
        let proc_root = tmp.path().join("proc");
        let watched = tmp.path().join("segments");
        std::fs::create_dir_all(&watched).unwrap();

        let open_file = watched.join("100.mp4");
        std::fs::write(&open_file, b"x").unwrap();
        let other_file = tmp.path().join("other.mp4");
        std::fs::write(&other_file, b"x").unwrap();

        // An ffmpeg process holding one file inside the watched dir
        // and one outside it.
        let pid = proc_root.join("1234");
        std::fs::create_dir_all(pid.join("fd")).unwrap();
        std::fs::write(pid.join("comm"), "ffmpeg\n").unwrap();
        symlink(&open_file, pid.join("fd").join("3")).unwrap();
        symlink(&other_file, pid.join("fd").join("4")).unwrap();

        // An unrelated process holding a watched file.
        let pid = proc_root.join("5678");
        std::fs::create_dir_all(pid.join("fd")).unwrap();
        std::fs::write(pid.join("comm"), "bash\n").unwrap();
        symlink(&open_file, pid.join("fd").join("3")).unwrap();

        let got = files_in_use_from_proc(&proc_root, &watched);
        assert_eq!(HashSet::from([open_file]), got);
    }

    #[test]
    fn test_files_in_use_missing_proc() {
        let got = files_in_use_from_proc(Path::new("/nonexistent"), Path::new("/x"));
        assert!(got.is_empty());
    }
}
