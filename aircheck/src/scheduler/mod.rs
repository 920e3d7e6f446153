//! The reservation scheduler.
//!
//! Owns the live capture plans, reconciles the reservation set against the
//! upstream schedule on a periodic tick (or sooner, when an API mutation
//! signals the wake channel), arms a timer per pending capture, and drives
//! one capture worker per due plan.

pub mod plan;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureRequest, CaptureWorker};
use crate::clock::{Clock, SleepOutcome};
use crate::config::Config;
use crate::domain::{BroadcastEvent, Reservation, ReservationKind, ReservationStatus};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::upstream::{ScheduleFeed, SeriesSelector};
use plan::{CapturePlan, PlanState, PlanStateCell};

/// Minimum remaining window worth capturing.
const MIN_CAPTURE_WINDOW: Duration = Duration::seconds(60);

/// Scheduler timing knobs, lifted from the application config.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub reconcile_interval: StdDuration,
    pub lead_in: Duration,
    pub tail_out: Duration,
    pub schedule_horizon: Duration,
    pub watch_horizon: Duration,
    pub grace_period: StdDuration,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            reconcile_interval: config.reconcile_interval,
            lead_in: Duration::from_std(config.lead_in).unwrap_or(Duration::zero()),
            tail_out: Duration::from_std(config.tail_out).unwrap_or(Duration::zero()),
            schedule_horizon: Duration::from_std(config.schedule_horizon)
                .unwrap_or(Duration::hours(25)),
            watch_horizon: Duration::from_std(config.watch_horizon).unwrap_or(Duration::days(7)),
            grace_period: config.grace_period,
        }
    }
}

pub struct Scheduler {
    store: Arc<Store>,
    upstream: Arc<dyn ScheduleFeed>,
    clock: Arc<dyn Clock>,
    worker: Arc<CaptureWorker>,
    config: SchedulerConfig,
    /// Live plans keyed by reservation id; the same lock serialises every
    /// reconciliation pass.
    plans: Mutex<HashMap<String, CapturePlan>>,
    wake: Notify,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        upstream: Arc<dyn ScheduleFeed>,
        clock: Arc<dyn Clock>,
        worker: Arc<CaptureWorker>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            upstream,
            clock,
            worker,
            config,
            plans: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Signal that the reservation set changed; the reconciliation loop
    /// wakes up without waiting for the next interval tick.
    pub fn notify_changed(&self) {
        self.wake.notify_one();
    }

    /// Delete a reservation, cancelling its capture if one is live. No
    /// recording is committed for a capture cancelled this way.
    pub async fn delete_reservation(&self, id: &str) -> Result<Reservation> {
        let removed = self.store.delete_reservation(id).await?;
        {
            let plans = self.plans.lock().await;
            if let Some(plan) = plans.get(id) {
                info!(reservation_id = %id, "cancelling live capture plan");
                plan.cancel.cancel();
            }
        }
        self.notify_changed();
        Ok(removed)
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.config.reconcile_interval.as_secs(),
            "scheduler started"
        );
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "reconciliation tick aborted");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconcile_interval) => {}
                _ = self.wake.notified() => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
        info!("scheduler stopped");
    }

    /// Stop all plans and wait up to the grace period for workers to wind
    /// down. Partial captures are discarded by the workers themselves.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(self.config.grace_period, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("capture workers did not stop within the grace period");
        }
    }

    /// One reconciliation pass. The plan lock is held for the duration, so
    /// plan creation, reaping and concurrent deletions serialise behind it.
    async fn tick(&self) -> Result<()> {
        let mut plans = self.plans.lock().await;
        let now = self.clock.now();

        // Materialise new events for every series watch.
        let reservations = self.store.list_reservations().await;
        for reservation in reservations.iter().filter(|r| r.is_series_watch()) {
            match self.materialise_watch(reservation, now).await {
                Ok(0) => {}
                Ok(count) => {
                    info!(
                        watch_id = %reservation.id,
                        new_children = count,
                        "materialised series watch events"
                    );
                }
                Err(e @ (Error::UpstreamUnavailable(_) | Error::UpstreamMalformed(_))) => {
                    warn!(watch_id = %reservation.id, error = %e, "skipping watch this tick");
                }
                Err(e) => return Err(e),
            }
        }

        // Plan pending single events inside the scheduling horizon.
        let reservations = self.store.list_reservations().await;
        for reservation in &reservations {
            let ReservationKind::SingleEvent { event, status, .. } = &reservation.kind else {
                continue;
            };
            if *status != ReservationStatus::Pending || plans.contains_key(&reservation.id) {
                continue;
            }
            if event.start - now > self.config.schedule_horizon {
                continue;
            }
            if event.start <= now && event.end - now < MIN_CAPTURE_WINDOW {
                // Too late: the remaining window is not worth a capture.
                info!(reservation_id = %reservation.id, "missed window; marking failed");
                let mut failed = reservation.clone();
                failed.set_status(ReservationStatus::Failed);
                self.store.put_reservation(failed).await?;
                continue;
            }
            self.spawn_plan(&mut plans, reservation, event.clone());
        }

        // Reap terminal plans and plans whose reservation is gone.
        plans.retain(|id, plan| {
            if plan.state.get().is_terminal() {
                return false;
            }
            if !reservations.iter().any(|r| &r.id == id) {
                debug!(reservation_id = %id, "reservation gone; cancelling plan");
                plan.cancel.cancel();
                return false;
            }
            true
        });

        Ok(())
    }

    /// Fetch the watched series' upcoming events, subtract the seen set,
    /// and persist new children plus the grown seen set in one catalogue
    /// write. Returns the number of children created.
    async fn materialise_watch(
        &self,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let ReservationKind::SeriesWatch {
            radio_series_id,
            series_code,
            area_id,
            seen_broadcast_event_ids,
            ..
        } = &reservation.kind
        else {
            return Ok(0);
        };

        let selector = match series_code {
            Some(code) => SeriesSelector::Code(code.clone()),
            None => SeriesSelector::Id(*radio_series_id),
        };
        let events = self
            .upstream
            .fetch_events(&selector, now + self.config.watch_horizon)
            .await?;

        let mut seen = seen_broadcast_event_ids.clone();
        let mut children = Vec::new();
        for event in events {
            if seen.contains(&event.broadcast_event_id) {
                continue;
            }
            if let Some(area) = area_id
                && &event.area_id != area
            {
                continue;
            }
            if event.end <= now {
                continue;
            }
            if let Err(e) = event.validate_for_reservation(now, true) {
                debug!(
                    broadcast_event_id = %event.broadcast_event_id,
                    error = %e,
                    "skipping unusable upstream event"
                );
                continue;
            }
            seen.insert(event.broadcast_event_id.clone());
            children.push(Reservation::new_single_event(
                event,
                Some(reservation.id.clone()),
            ));
        }

        if children.is_empty() {
            return Ok(0);
        }
        let count = children.len();

        let mut updated = reservation.clone();
        if let ReservationKind::SeriesWatch {
            seen_broadcast_event_ids,
            ..
        } = &mut updated.kind
        {
            *seen_broadcast_event_ids = seen;
        }
        self.store.put_watch_with_children(updated, children).await?;
        Ok(count)
    }

    /// Create a plan and arm its timer. The caller holds the plan lock.
    fn spawn_plan(
        &self,
        plans: &mut HashMap<String, CapturePlan>,
        reservation: &Reservation,
        event: BroadcastEvent,
    ) {
        let plan = CapturePlan::new(
            reservation.id.clone(),
            event.start,
            event.end,
            &self.shutdown,
        );
        let cancel = plan.cancel.clone();
        let capture_id = plan.capture_id.clone();
        let state = plan.state.clone();
        debug!(
            reservation_id = %reservation.id,
            start = %event.start,
            "arming capture plan"
        );
        plans.insert(reservation.id.clone(), plan);

        let task = PlanTask {
            store: Arc::clone(&self.store),
            upstream: Arc::clone(&self.upstream),
            clock: Arc::clone(&self.clock),
            worker: Arc::clone(&self.worker),
            config: self.config.clone(),
        };
        let reservation_id = reservation.id.clone();
        self.tracker.spawn(async move {
            let terminal = task
                .run_plan(&reservation_id, event, capture_id, &cancel, &state)
                .await;
            state.set(terminal);
        });
    }
}

/// The slice of scheduler state a plan task needs. Plan tasks never touch
/// the plan map; they publish progress through their `PlanStateCell` and
/// the map is reaped by the next tick.
struct PlanTask {
    store: Arc<Store>,
    upstream: Arc<dyn ScheduleFeed>,
    clock: Arc<dyn Clock>,
    worker: Arc<CaptureWorker>,
    config: SchedulerConfig,
}

impl PlanTask {
    /// Drive one plan from its arming deadline to a terminal state.
    async fn run_plan(
        &self,
        reservation_id: &str,
        event: BroadcastEvent,
        capture_id: String,
        cancel: &CancellationToken,
        state: &PlanStateCell,
    ) -> PlanState {
        let arm_at = event.start - self.config.lead_in;
        if self.clock.sleep_until(arm_at, cancel).await == SleepOutcome::Canceled {
            debug!(reservation_id, "plan cancelled before arming");
            return PlanState::Canceled;
        }
        state.set(PlanState::Arming);

        // The reservation may have been deleted while we slept.
        let Ok(mut reservation) = self.store.get_reservation(reservation_id).await else {
            debug!(reservation_id, "reservation vanished before arming");
            return PlanState::Canceled;
        };
        if reservation.status() != ReservationStatus::Pending {
            return PlanState::Canceled;
        }

        // Late start: capture what remains, or give up under a minute.
        let now = self.clock.now();
        let effective_start = event.start.max(now);
        let scheduled = event.end - effective_start;
        if event.start <= now && scheduled < MIN_CAPTURE_WINDOW {
            warn!(reservation_id, "remaining window too short; failing");
            self.mark_failed(reservation).await;
            return PlanState::Failed;
        }

        let input_url = match self
            .upstream
            .fetch_hls_source(event.service_id, &event.area_id)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                warn!(reservation_id, error = %e, "cannot resolve stream source");
                self.mark_failed(reservation).await;
                return PlanState::Failed;
            }
        };

        reservation.set_status(ReservationStatus::InProgress);
        if let Err(e) = self.store.put_reservation(reservation).await {
            error!(reservation_id, error = %e, "failed to mark reservation in progress");
            return PlanState::Failed;
        }

        state.set(PlanState::Running);
        let request = CaptureRequest {
            capture_id,
            reservation_id: reservation_id.to_string(),
            event: event.clone(),
            input_url,
            scheduled,
            stop_at: event.end + self.config.tail_out,
        };

        let outcome = self.worker.run(request, cancel).await;
        state.set(PlanState::Finalising);
        match outcome {
            Ok(recording) => {
                debug!(reservation_id, recording_id = %recording.id, "plan committed");
                PlanState::Committed
            }
            Err(Error::Canceled) => {
                debug!(reservation_id, "capture cancelled");
                PlanState::Canceled
            }
            Err(e) => {
                warn!(reservation_id, error = %e, "capture failed");
                if let Ok(reservation) = self.store.get_reservation(reservation_id).await {
                    self.mark_failed(reservation).await;
                }
                PlanState::Failed
            }
        }
    }

    async fn mark_failed(&self, mut reservation: Reservation) {
        reservation.set_status(ReservationStatus::Failed);
        if let Err(e) = self.store.put_reservation(reservation).await {
            error!(error = %e, "failed to persist failed reservation status");
        }
    }
}
