//! Wall-clock abstraction so the scheduler and tests share one notion of time.
//!
//! Sleeps are absolute: implementations re-check the wall clock after every
//! wakeup and only complete once the deadline has actually been reached, so
//! suspend/resume and spurious wakeups converge on the target instant.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// How a `sleep_until` call completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The deadline was reached (or was already in the past).
    Reached,
    /// The cancellation token fired before the deadline.
    Canceled,
}

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Sleep until `deadline` on the wall clock, honouring cancellation on
    /// every iteration.
    async fn sleep_until(&self, deadline: DateTime<Utc>, cancel: &CancellationToken) -> SleepOutcome;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

/// Upper bound for a single underlying timer so a suspended host re-checks
/// the wall clock at least this often.
const MAX_SLEEP_CHUNK: Duration = Duration::seconds(60);

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>, cancel: &CancellationToken) -> SleepOutcome {
        loop {
            let remaining = deadline - Utc::now();
            if remaining <= Duration::zero() {
                return SleepOutcome::Reached;
            }
            let chunk = remaining.min(MAX_SLEEP_CHUNK);
            let chunk = chunk.to_std().unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(chunk) => {}
                _ = cancel.cancelled() => return SleepOutcome::Canceled,
            }
        }
    }
}

/// A manually driven clock for tests.
///
/// Time only moves when `advance` or `set` is called; due sleepers are
/// released in deadline order because each one re-checks against the new
/// instant when notified.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<ManualClockInner>,
}

struct ManualClockInner {
    now: parking_lot::Mutex<DateTime<Utc>>,
    tick: Notify,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(ManualClockInner {
                now: parking_lot::Mutex::new(start),
                tick: Notify::new(),
            }),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.inner.now.lock();
        *now = *now + by;
        drop(now);
        self.inner.tick.notify_waiters();
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.inner.now.lock() = to;
        self.inner.tick.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.now.lock()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>, cancel: &CancellationToken) -> SleepOutcome {
        loop {
            if *self.inner.now.lock() >= deadline {
                return SleepOutcome::Reached;
            }
            // Register before re-checking so an advance between the check
            // and the await is not lost.
            let notified = self.inner.tick.notified();
            if *self.inner.now.lock() >= deadline {
                return SleepOutcome::Reached;
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return SleepOutcome::Canceled,
            }
        }
    }
}
