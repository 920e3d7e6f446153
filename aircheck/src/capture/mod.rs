//! One supervised capture attempt: spawn the segment muxer, hold it for the
//! scheduled window, then commit or discard the staging tree.

pub mod commit;
pub mod muxer;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SleepOutcome};
use crate::domain::{BroadcastEvent, Recording};
use crate::error::{Error, Result};
use crate::store::Store;
use muxer::{Muxer, MuxerJob, MuxerProcess};

/// Delay between muxer spawn attempts.
const SPAWN_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(2);
/// Initial attempt plus two retries.
const MAX_SPAWN_ATTEMPTS: u32 = 3;

/// Everything one capture attempt needs to know.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    /// Staging directory name; unique per attempt.
    pub capture_id: String,
    pub reservation_id: String,
    pub event: BroadcastEvent,
    /// Resolved live HLS playlist URL.
    pub input_url: String,
    /// Effective capture window used by the commit policy; shorter than the
    /// event duration when the capture started late.
    pub scheduled: Duration,
    /// Absolute stop deadline (scheduled end plus tail-out).
    pub stop_at: DateTime<Utc>,
}

/// Runs capture attempts. One worker instance is shared by all plans; each
/// `run` call supervises exactly one muxer process.
pub struct CaptureWorker {
    clock: Arc<dyn Clock>,
    muxer: Arc<dyn Muxer>,
    store: Arc<Store>,
    grace_period: std::time::Duration,
    segment_duration_secs: u32,
}

impl CaptureWorker {
    pub fn new(
        clock: Arc<dyn Clock>,
        muxer: Arc<dyn Muxer>,
        store: Arc<Store>,
        grace_period: std::time::Duration,
        segment_duration_secs: u32,
    ) -> Self {
        Self {
            clock,
            muxer,
            store,
            grace_period,
            segment_duration_secs,
        }
    }

    /// Run one capture to completion. On success the recording has been
    /// atomically committed; on every other outcome the staging directory
    /// is gone and nothing is visible.
    pub async fn run(
        &self,
        request: CaptureRequest,
        cancel: &CancellationToken,
    ) -> Result<Recording> {
        let staging_dir = self.store.staging_root().join(&request.capture_id);
        tokio::fs::create_dir_all(staging_dir.join("segments"))
            .await
            .map_err(|e| Error::storage_io("creating staging directory", &staging_dir, e))?;

        let outcome = self.capture(&request, &staging_dir, cancel).await;
        if outcome.is_err() {
            remove_staging(&staging_dir).await;
        }
        outcome
    }

    async fn capture(
        &self,
        request: &CaptureRequest,
        staging_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Recording> {
        let job = MuxerJob {
            input_url: request.input_url.clone(),
            playlist_path: staging_dir.join(commit::PLAYLIST_NAME),
            segment_template: staging_dir.join("segments").join("%05d.ts"),
            segment_duration_secs: self.segment_duration_secs,
        };

        let mut process = self.spawn_with_retries(&job, request, cancel).await?;

        let mut canceled = false;
        tokio::select! {
            code = process.wait() => {
                debug!(reservation_id = %request.reservation_id, ?code, "muxer exited on its own");
            }
            outcome = self.clock.sleep_until(request.stop_at, cancel) => {
                canceled = outcome == SleepOutcome::Canceled;
                self.stop_muxer(process.as_mut()).await;
            }
        }

        if canceled {
            info!(reservation_id = %request.reservation_id, "capture canceled");
            return Err(Error::Canceled);
        }

        let stats = commit::inspect(staging_dir, request.scheduled)?;
        commit::finalise_playlist(staging_dir)?;

        let mut metadata = BTreeMap::new();
        metadata.insert("title".to_string(), request.event.name.clone());
        if let Some(description) = &request.event.description {
            metadata.insert("description".to_string(), description.clone());
        }

        let recording = Recording {
            id: uuid::Uuid::new_v4().to_string(),
            reservation_id: request.reservation_id.clone(),
            event: request.event.clone(),
            directory: String::new(),
            metadata,
            created_at: self.clock.now(),
            size_bytes: stats.size_bytes,
            duration_secs: stats.duration_secs,
        };

        let recording = self.store.atomic_commit_recording(recording, staging_dir).await?;
        info!(
            reservation_id = %request.reservation_id,
            recording_id = %recording.id,
            duration_secs = recording.duration_secs,
            "capture committed"
        );
        Ok(recording)
    }

    async fn spawn_with_retries(
        &self,
        job: &MuxerJob,
        request: &CaptureRequest,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn MuxerProcess>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            match self.muxer.spawn(job).await {
                Ok(process) => return Ok(process),
                Err(e) => {
                    warn!(
                        reservation_id = %request.reservation_id,
                        attempt,
                        error = %e,
                        "muxer spawn failed"
                    );
                    let retry_at = self.clock.now()
                        + Duration::from_std(SPAWN_RETRY_DELAY).unwrap_or(Duration::zero());
                    if attempt >= MAX_SPAWN_ATTEMPTS || retry_at >= request.stop_at {
                        return Err(e);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(SPAWN_RETRY_DELAY) => {}
                        _ = cancel.cancelled() => return Err(Error::Canceled),
                    }
                }
            }
        }
    }

    /// Graceful stop, escalating to a kill after the grace period.
    async fn stop_muxer(&self, process: &mut dyn MuxerProcess) {
        process.terminate().await;
        if tokio::time::timeout(self.grace_period, process.wait()).await.is_err() {
            warn!("muxer ignored the stop request; killing");
            process.kill().await;
            let _ = process.wait().await;
        }
    }
}

async fn remove_staging(staging_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(staging_dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %staging_dir.display(), error = %e, "failed to remove staging directory");
    }
}

#[cfg(test)]
pub mod testing;

#[cfg(test)]
mod tests {
    use super::testing::{FailingMuxer, HangingMuxer, InstantMuxer};
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{Reservation, ReservationStatus, ServiceId};

    fn sample_event(now: DateTime<Utc>) -> BroadcastEvent {
        BroadcastEvent {
            broadcast_event_id: "E1".to_string(),
            radio_series_id: 42,
            radio_episode_id: None,
            service_id: ServiceId::R2,
            area_id: "tokyo".to_string(),
            start: now,
            end: now + Duration::seconds(30),
            name: "Evening Story".to_string(),
            description: None,
            genres: Vec::new(),
            duration_iso: None,
            location: None,
            url: None,
            image_url: None,
        }
    }

    async fn setup(
        muxer: Arc<dyn Muxer>,
        dir: &std::path::Path,
    ) -> (CaptureWorker, Arc<Store>, ManualClock, Reservation) {
        let clock = ManualClock::new(Utc::now());
        let store = Arc::new(Store::open(dir).await.unwrap());
        let reservation = Reservation::new_single_event(sample_event(clock.now()), None);
        store.create_reservation(reservation.clone()).await.unwrap();
        let worker = CaptureWorker::new(
            Arc::new(clock.clone()),
            muxer,
            Arc::clone(&store),
            std::time::Duration::from_millis(100),
            10,
        );
        (worker, store, clock, reservation)
    }

    fn request(reservation: &Reservation) -> CaptureRequest {
        let event = reservation.event().unwrap().clone();
        CaptureRequest {
            capture_id: "cap-1".to_string(),
            reservation_id: reservation.id.clone(),
            scheduled: event.end - event.start,
            stop_at: event.end + Duration::seconds(30),
            input_url: "https://example.jp/live/master.m3u8".to_string(),
            event,
        }
    }

    #[tokio::test]
    async fn successful_capture_commits_a_recording() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = Arc::new(InstantMuxer {
            segment_durations: vec![10.0, 10.0, 10.0],
        });
        let (worker, store, _clock, reservation) = setup(muxer, dir.path()).await;

        let cancel = CancellationToken::new();
        let recording = worker.run(request(&reservation), &cancel).await.unwrap();

        assert_eq!(recording.metadata.get("title").unwrap(), "Evening Story");
        assert_eq!(store.list_recordings().await.len(), 1);
        assert!(dir
            .path()
            .join("recordings")
            .join(&recording.id)
            .join("recording.m3u8")
            .is_file());
        assert!(!dir.path().join("staging/cap-1").exists());

        // The committed playlist is complete.
        let playlist = std::fs::read_to_string(
            dir.path().join("recordings").join(&recording.id).join("recording.m3u8"),
        )
        .unwrap();
        assert!(playlist.contains("#EXT-X-ENDLIST"));

        let reservation = store.get_reservation(&reservation.id).await.unwrap();
        assert_eq!(reservation.status(), ReservationStatus::Done);
    }

    #[tokio::test]
    async fn insufficient_capture_is_rejected_and_staging_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = Arc::new(InstantMuxer {
            segment_durations: vec![2.0],
        });
        let (worker, store, _clock, reservation) = setup(muxer, dir.path()).await;

        let cancel = CancellationToken::new();
        let err = worker.run(request(&reservation), &cancel).await.unwrap_err();

        assert_eq!(err.kind(), "capture_failed");
        assert!(store.list_recordings().await.is_empty());
        assert!(!dir.path().join("staging/cap-1").exists());
    }

    #[tokio::test]
    async fn cancellation_stops_the_muxer_and_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, store, _clock, reservation) = setup(Arc::new(HangingMuxer), dir.path()).await;

        let cancel = CancellationToken::new();
        let run = {
            let req = request(&reservation);
            let cancel = cancel.clone();
            let worker = Arc::new(worker);
            tokio::spawn(async move { worker.run(req, &cancel).await })
        };

        tokio::task::yield_now().await;
        cancel.cancel();

        let err = run.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "canceled");
        assert!(store.list_recordings().await.is_empty());
        assert!(!dir.path().join("staging/cap-1").exists());
    }

    #[tokio::test]
    async fn spawn_failure_near_the_deadline_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = Arc::new(FailingMuxer::new());
        let (worker, store, clock, reservation) = setup(Arc::clone(&muxer) as Arc<dyn Muxer>, dir.path()).await;

        let mut req = request(&reservation);
        // The stop deadline leaves no room for a retry delay.
        req.stop_at = clock.now() + Duration::seconds(1);

        let cancel = CancellationToken::new();
        let err = worker.run(req, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "capture_failed");
        assert_eq!(muxer.attempt_count(), 1);
        assert!(store.list_recordings().await.is_empty());
    }
}
