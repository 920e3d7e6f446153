//! The external segment muxer behind a trait seam.
//!
//! The production implementation spawns ffmpeg with a fixed argument
//! contract: live HLS input with reconnect flags, no video stream, stream
//! copy, and an HLS tree written into the staging directory. Tests plug in
//! a fake muxer.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One capture attempt's muxer invocation.
#[derive(Debug, Clone)]
pub struct MuxerJob {
    /// Live HLS playlist to read.
    pub input_url: String,
    /// Output playlist path inside the staging directory.
    pub playlist_path: PathBuf,
    /// Zero-padded segment filename template inside the staging directory.
    pub segment_template: PathBuf,
    /// Target segment duration in seconds.
    pub segment_duration_secs: u32,
}

/// A running muxer process.
#[async_trait]
pub trait MuxerProcess: Send {
    /// Wait for the process to exit; `None` when no exit code is available.
    async fn wait(&mut self) -> Option<i32>;

    /// Request graceful termination (the muxer finishes the current segment
    /// and writes the playlist trailer).
    async fn terminate(&mut self);

    /// Force termination.
    async fn kill(&mut self);
}

#[async_trait]
pub trait Muxer: Send + Sync {
    async fn spawn(&self, job: &MuxerJob) -> Result<Box<dyn MuxerProcess>>;
}

/// ffmpeg-based segment muxer.
pub struct FfmpegMuxer {
    binary: PathBuf,
}

impl FfmpegMuxer {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    fn build_args(job: &MuxerJob) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "warning".to_string(),
            // Ride out short network gaps on the live input.
            "-reconnect".to_string(),
            "1".to_string(),
            "-reconnect_streamed".to_string(),
            "1".to_string(),
            "-reconnect_delay_max".to_string(),
            "10".to_string(),
            "-i".to_string(),
            job.input_url.clone(),
            "-vn".to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            job.segment_duration_secs.to_string(),
            "-hls_list_size".to_string(),
            "0".to_string(),
            "-hls_segment_filename".to_string(),
            job.segment_template.to_string_lossy().replace('\\', "/"),
            job.playlist_path.to_string_lossy().replace('\\', "/"),
        ]
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn spawn(&self, job: &MuxerJob) -> Result<Box<dyn MuxerProcess>> {
        let args = Self::build_args(job);
        debug!(binary = %self.binary.display(), ?args, "spawning segment muxer");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped()) // graceful stop via 'q'
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::CaptureFailed(format!("failed to spawn muxer: {e}")))?;

        let stdin = child.stdin.take();

        // Surface muxer chatter in our logs instead of losing it.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "aircheck::muxer", "{line}");
                }
            });
        }

        Ok(Box::new(FfmpegProcess { child, stdin }))
    }
}

struct FfmpegProcess {
    child: tokio::process::Child,
    stdin: Option<tokio::process::ChildStdin>,
}

#[async_trait]
impl MuxerProcess for FfmpegProcess {
    async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(error = %e, "error waiting for muxer process");
                Some(-1)
            }
        }
    }

    async fn terminate(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
            let _ = stdin.shutdown().await;
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill muxer process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_contract_is_stable() {
        let job = MuxerJob {
            input_url: "https://example.jp/live/master.m3u8".to_string(),
            playlist_path: PathBuf::from("/tmp/cap/recording.m3u8"),
            segment_template: PathBuf::from("/tmp/cap/segments/%05d.ts"),
            segment_duration_secs: 10,
        };
        let args = FfmpegMuxer::build_args(&job);

        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "https://example.jp/live/master.m3u8");
        assert!(args.contains(&"-vn".to_string()));
        assert!(args.contains(&"copy".to_string()));
        assert!(args.contains(&"-reconnect".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/cap/recording.m3u8");

        let template = args.iter().position(|a| a == "-hls_segment_filename").unwrap();
        assert_eq!(args[template + 1], "/tmp/cap/segments/%05d.ts");
    }
}
