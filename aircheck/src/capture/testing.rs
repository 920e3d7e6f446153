//! Fake muxers shared by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{Error, Result};

use super::muxer::{Muxer, MuxerJob, MuxerProcess};

/// Writes a staging tree synchronously on spawn and exits at once.
pub struct InstantMuxer {
    pub segment_durations: Vec<f64>,
}

#[async_trait]
impl Muxer for InstantMuxer {
    async fn spawn(&self, job: &MuxerJob) -> Result<Box<dyn MuxerProcess>> {
        let staging = job
            .playlist_path
            .parent()
            .ok_or_else(|| Error::internal("playlist path has no parent"))?;
        let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n");
        for (i, duration) in self.segment_durations.iter().enumerate() {
            let name = format!("segments/{i:05}.ts");
            playlist.push_str(&format!("#EXTINF:{duration:.3},\n{name}\n"));
            std::fs::write(staging.join(&name), vec![1u8; 256])
                .map_err(|e| Error::internal(e.to_string()))?;
        }
        std::fs::write(&job.playlist_path, playlist).map_err(|e| Error::internal(e.to_string()))?;
        Ok(Box::new(ExitedProcess))
    }
}

pub struct ExitedProcess;

#[async_trait]
impl MuxerProcess for ExitedProcess {
    async fn wait(&mut self) -> Option<i32> {
        Some(0)
    }
    async fn terminate(&mut self) {}
    async fn kill(&mut self) {}
}

/// Runs until terminated, producing nothing.
pub struct HangingMuxer;

#[async_trait]
impl Muxer for HangingMuxer {
    async fn spawn(&self, _job: &MuxerJob) -> Result<Box<dyn MuxerProcess>> {
        Ok(Box::new(HangingProcess {
            stopped: Arc::new(Notify::new()),
            done: false,
        }))
    }
}

pub struct HangingProcess {
    stopped: Arc<Notify>,
    done: bool,
}

#[async_trait]
impl MuxerProcess for HangingProcess {
    async fn wait(&mut self) -> Option<i32> {
        if !self.done {
            self.stopped.notified().await;
            self.done = true;
        }
        Some(0)
    }
    async fn terminate(&mut self) {
        self.done = true;
        self.stopped.notify_waiters();
    }
    async fn kill(&mut self) {
        self.done = true;
        self.stopped.notify_waiters();
    }
}

/// Refuses to spawn, counting the attempts.
pub struct FailingMuxer {
    pub attempts: AtomicU32,
}

impl FailingMuxer {
    pub fn new() -> Self {
        Self {
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Default for FailingMuxer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Muxer for FailingMuxer {
    async fn spawn(&self, _job: &MuxerJob) -> Result<Box<dyn MuxerProcess>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::CaptureFailed("spawn refused".to_string()))
    }
}
