//! On-demand conversion of a stored HLS tree into a single audio container.
//!
//! The converter shells out to the same external muxer binary the capture
//! path uses, remuxing the playlist into an `.m4a` without re-encoding.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// File extension of the produced container.
pub const CONTAINER_EXTENSION: &str = "m4a";

pub struct Converter {
    binary: PathBuf,
}

impl Converter {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Remux `recording_dir`'s HLS tree into one container and return its
    /// bytes. The intermediate file lives in the system temp directory and
    /// is removed when this call returns.
    pub async fn to_container(&self, recording_dir: &Path) -> Result<Vec<u8>> {
        let playlist = recording_dir.join("recording.m3u8");
        if !playlist.is_file() {
            return Err(Error::internal(format!(
                "recording playlist missing at {}",
                playlist.display()
            )));
        }

        let output = tempfile::Builder::new()
            .prefix("aircheck-convert-")
            .suffix(&format!(".{CONTAINER_EXTENSION}"))
            .tempfile()
            .map_err(|e| Error::internal(format!("cannot create temp output: {e}")))?;
        let output_path = output.path().to_path_buf();

        debug!(
            playlist = %playlist.display(),
            output = %output_path.display(),
            "converting recording"
        );
        let result = tokio::process::Command::new(&self.binary)
            .args([
                "-y",
                "-hide_banner",
                "-loglevel",
                "error",
                "-i",
                &playlist.to_string_lossy().replace('\\', "/"),
                "-vn",
                "-c",
                "copy",
                // TS carries ADTS AAC; MP4 wants raw AAC.
                "-bsf:a",
                "aac_adtstoasc",
                "-movflags",
                "+faststart",
            ])
            .arg(&output_path)
            .output()
            .await
            .map_err(|e| Error::internal(format!("failed to run converter: {e}")))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(Error::internal(format!(
                "converter exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }

        tokio::fs::read(&output_path)
            .await
            .map_err(|e| Error::storage_io("reading converted container", &output_path, e))
    }
}
