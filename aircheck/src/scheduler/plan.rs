//! Capture plan bookkeeping.
//!
//! A plan is the scheduler-private handle for one upcoming or running
//! capture. At most one plan exists per reservation id at any instant.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a capture plan.
///
/// Only `Arming -> Running` and the terminal transitions cross task
/// boundaries; everything else happens under the scheduler lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanState {
    /// Waiting for the arming deadline.
    #[default]
    Scheduled,
    /// Arming: resolving the stream source and marking the reservation.
    Arming,
    /// The muxer is running.
    Running,
    /// The muxer has exited; the staging tree is being judged.
    Finalising,
    Committed,
    Failed,
    Canceled,
}

impl PlanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Failed | Self::Canceled)
    }
}

/// Shared handle to one plan's state: the scheduler reads it under its
/// lock, the plan's own task advances it.
#[derive(Debug, Clone, Default)]
pub struct PlanStateCell(Arc<parking_lot::Mutex<PlanState>>);

impl PlanStateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, state: PlanState) {
        *self.0.lock() = state;
    }

    pub fn get(&self) -> PlanState {
        *self.0.lock()
    }
}

/// A live capture plan.
#[derive(Debug)]
pub struct CapturePlan {
    /// The reservation this plan executes.
    pub reservation_id: String,
    /// Staging directory name for this attempt.
    pub capture_id: String,
    /// Scheduled on-air start.
    pub start: DateTime<Utc>,
    /// Scheduled on-air end.
    pub end: DateTime<Utc>,
    pub state: PlanStateCell,
    /// Cancelling this token stops the plan's sleep or capture.
    pub cancel: CancellationToken,
}

impl CapturePlan {
    pub fn new(
        reservation_id: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        parent_token: &CancellationToken,
    ) -> Self {
        Self {
            reservation_id,
            capture_id: uuid::Uuid::new_v4().to_string(),
            start,
            end,
            state: PlanStateCell::new(),
            cancel: parent_token.child_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn parent_cancellation_propagates_to_plans() {
        let parent = CancellationToken::new();
        let now = Utc::now();
        let plan = CapturePlan::new(
            "res-1".to_string(),
            now,
            now + Duration::minutes(30),
            &parent,
        );

        assert!(!plan.cancel.is_cancelled());
        parent.cancel();
        assert!(plan.cancel.is_cancelled());
    }

    #[test]
    fn terminal_states_are_flagged() {
        assert!(!PlanState::Scheduled.is_terminal());
        assert!(!PlanState::Running.is_terminal());
        assert!(PlanState::Committed.is_terminal());
        assert!(PlanState::Canceled.is_terminal());
    }
}
