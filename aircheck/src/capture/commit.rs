//! Commit policy: decide whether a staging tree is a publishable capture.

use std::path::Path;

use chrono::Duration;

use crate::error::{Error, Result};

/// Name of the media playlist inside a capture tree.
pub const PLAYLIST_NAME: &str = "recording.m3u8";

/// What a staging tree amounted to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureStats {
    pub duration_secs: f64,
    pub size_bytes: u64,
    pub segment_count: usize,
}

/// Inspect a finished staging tree against the commit policy.
///
/// A capture is publishable iff the playlist parses as a media playlist
/// with at least one segment, the captured duration reaches
/// `min(50% of scheduled, 60 s)`, and the last segment file exists and is
/// non-empty.
pub fn inspect(staging_dir: &Path, scheduled: Duration) -> Result<CaptureStats> {
    let playlist_path = staging_dir.join(PLAYLIST_NAME);
    let bytes = std::fs::read(&playlist_path)
        .map_err(|e| Error::CaptureFailed(format!("no playlist was produced: {e}")))?;

    let playlist = match m3u8_rs::parse_media_playlist_res(&bytes) {
        Ok(playlist) => playlist,
        Err(e) => {
            return Err(Error::CaptureFailed(format!(
                "playlist does not parse: {e:?}"
            )));
        }
    };
    if playlist.segments.is_empty() {
        return Err(Error::CaptureFailed("playlist has no segments".to_string()));
    }

    let captured: f64 = playlist.segments.iter().map(|s| s.duration as f64).sum();
    let scheduled_secs = scheduled.num_milliseconds() as f64 / 1000.0;
    let required = (scheduled_secs * 0.5).min(60.0);
    if captured < required {
        return Err(Error::CaptureFailed(format!(
            "captured {captured:.1}s of {scheduled_secs:.1}s scheduled (needed {required:.1}s)"
        )));
    }

    let last = &playlist.segments[playlist.segments.len() - 1];
    let last_path = staging_dir.join(&last.uri);
    match std::fs::metadata(&last_path) {
        Ok(meta) if meta.len() > 0 => {}
        Ok(_) => {
            return Err(Error::CaptureFailed(format!(
                "last segment '{}' is empty",
                last.uri
            )));
        }
        Err(e) => {
            return Err(Error::CaptureFailed(format!(
                "last segment '{}' is missing: {e}",
                last.uri
            )));
        }
    }

    let mut size_bytes = bytes.len() as u64;
    for segment in &playlist.segments {
        if let Ok(meta) = std::fs::metadata(staging_dir.join(&segment.uri)) {
            size_bytes += meta.len();
        }
    }

    Ok(CaptureStats {
        duration_secs: captured,
        size_bytes,
        segment_count: playlist.segments.len(),
    })
}

/// Ensure the playlist carries an end marker so later playback is a plain
/// file serve of a complete, non-live playlist.
pub fn finalise_playlist(staging_dir: &Path) -> Result<()> {
    let playlist_path = staging_dir.join(PLAYLIST_NAME);
    let contents = std::fs::read_to_string(&playlist_path)
        .map_err(|e| Error::storage_io("reading playlist", &playlist_path, e))?;
    if contents.lines().any(|line| line.trim() == "#EXT-X-ENDLIST") {
        return Ok(());
    }
    let mut amended = contents;
    if !amended.ends_with('\n') {
        amended.push('\n');
    }
    amended.push_str("#EXT-X-ENDLIST\n");
    std::fs::write(&playlist_path, amended)
        .map_err(|e| Error::storage_io("finalising playlist", &playlist_path, e))
}
