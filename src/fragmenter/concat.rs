// SPDX-License-Identifier: GPL-2.0-or-later

// Event-clip materialization. An in-memory HLS playlist referencing
// the required fragments is piped to the external decoder in
// stream-copy concat mode.

use std::{path::Path, process::Stdio};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};

#[derive(Clone, Debug, PartialEq)]
pub struct ClipFragment {
    pub path: String,
    pub duration: f64,
}

/// The `file:` directive is required when the decoder reads a
/// playlist from stdin.
fn file_path(path: &str, file_directive: bool) -> String {
    if file_directive {
        format!("file:{path}")
    } else {
        path.to_owned()
    }
}

/// Builds the concat playlist. Fragment order is the playback order.
#[must_use]
#[allow(
    clippy::as_conversions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn generate_concat_playlist(
    fragments: &[ClipFragment],
    init_path: &str,
    sequence_number: u64,
    file_directive: bool,
) -> String {
    let mut playlist = Vec::new();
    playlist.push("#EXTM3U".to_owned());
    playlist.push("#EXT-X-VERSION:6".to_owned());
    playlist.push(format!("#EXT-X-MEDIA-SEQUENCE:{sequence_number}"));
    if sequence_number != 0 {
        playlist.push(format!("#EXT-X-DISCONTINUITY-SEQUENCE:{sequence_number}"));
    }

    if !fragments.is_empty() {
        let target_duration = fragments
            .iter()
            .map(|f| f.duration.ceil() as u64)
            .max()
            .unwrap_or(0);
        playlist.push(format!("#EXT-X-TARGETDURATION:{target_duration}"));
    }

    playlist.push("#EXT-X-INDEPENDENT-SEGMENTS".to_owned());
    playlist.push(format!(
        "#EXT-X-MAP:URI=\"{}\"",
        file_path(init_path, file_directive)
    ));
    for fragment in fragments {
        playlist.push(format!("#EXTINF:{},", fragment.duration));
        playlist.push(file_path(&fragment.path, file_directive));
        playlist.push("#EXT-X-DISCONTINUITY".to_owned());
    }
    playlist.push("#EXT-X-ENDLIST".to_owned());
    playlist.join("\n")
}

#[derive(Debug, Error)]
pub enum ConcatError {
    #[error("no fragments to concatenate")]
    NoFragments,

    #[error("spawn decoder: {0}")]
    Spawn(std::io::Error),

    #[error("decoder has no stdin")]
    NoStdin,

    #[error("write playlist: {0}")]
    WritePlaylist(std::io::Error),

    #[error("wait for decoder: {0}")]
    Wait(std::io::Error),

    #[error("decoder exited with {0}")]
    ExitStatus(std::process::ExitStatus),
}

/// Concatenates fragments into a single MP4 at `output_path`.
pub async fn concatenate_fragments(
    fragments: &[ClipFragment],
    init_path: &str,
    output_path: &Path,
) -> Result<(), ConcatError> {
    use ConcatError::*;
    if fragments.is_empty() {
        return Err(NoFragments);
    }

    let playlist = generate_concat_playlist(fragments, init_path, 0, true);

    let mut child = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-protocol_whitelist",
            "file,pipe",
            "-i",
            "-",
            "-acodec",
            "copy",
            "-vcodec",
            "copy",
        ])
        .arg(output_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(Spawn)?;

    let mut stdin = child.stdin.take().ok_or(NoStdin)?;
    stdin
        .write_all(playlist.as_bytes())
        .await
        .map_err(WritePlaylist)?;
    drop(stdin);

    let status = child.wait().await.map_err(Wait)?;
    if !status.success() {
        return Err(ExitStatus(status));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_generate_concat_playlist() {
        let fragments = vec![
            ClipFragment {
                path: "/seg/100.m4s".to_owned(),
                duration: 5.005,
            },
            ClipFragment {
                path: "/seg/105.m4s".to_owned(),
                duration: 4.8,
            },
        ];
        let got = generate_concat_playlist(&fragments, "/seg/init.mp4", 0, true);
        let want = "\
#EXTM3U
#EXT-X-VERSION:6
#EXT-X-MEDIA-SEQUENCE:0
#EXT-X-TARGETDURATION:6
#EXT-X-INDEPENDENT-SEGMENTS
#EXT-X-MAP:URI=\"file:/seg/init.mp4\"
#EXTINF:5.005,
file:/seg/100.m4s
#EXT-X-DISCONTINUITY
#EXTINF:4.8,
file:/seg/105.m4s
#EXT-X-DISCONTINUITY
#EXT-X-ENDLIST";
        assert_eq!(want, got);
    }

    #[test]
    fn test_generate_concat_playlist_sequence_number() {
        let got = generate_concat_playlist(&[], "/seg/init.mp4", 3, false);
        assert!(got.contains("#EXT-X-MEDIA-SEQUENCE:3"));
        assert!(got.contains("#EXT-X-DISCONTINUITY-SEQUENCE:3"));
        assert!(got.contains("#EXT-X-MAP:URI=\"/seg/init.mp4\""));
    }

    #[tokio::test]
    async fn test_concatenate_no_fragments() {
        assert!(matches!(
            concatenate_fragments(&[], "/seg/init.mp4", Path::new("/tmp/out.mp4")).await,
            Err(ConcatError::NoFragments)
        ));
    }
}
