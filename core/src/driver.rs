use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info};

use crate::delivery::cancelled;
use crate::job::JobStatus;
use crate::scheduler::{DueOutcome, Scheduler, SkipReason};

/// Re-check period for a cycle held back by a constraint.
pub const DEFAULT_CONSTRAINT_POLL: Duration = Duration::from_secs(30);

/// Fires `on_due` for one job: right away, then every interval measured
/// between cycle starts.
///
/// Stops when the job is no longer scheduled (cancelled, one-shot finished,
/// never enqueued) or when `shutdown` flips to `true`. A cycle already
/// running is always driven to its end.
pub struct Driver {
    scheduler: Arc<Scheduler>,
    name: String,
    constraint_poll: Duration,
}

impl Driver {
    /// Drive the job called `name`.
    pub fn new(scheduler: Arc<Scheduler>, name: impl Into<String>) -> Self {
        Self { scheduler, name: name.into(), constraint_poll: DEFAULT_CONSTRAINT_POLL }
    }

    /// Override how often deferred cycles re-check their constraints.
    pub fn with_constraint_poll(mut self, poll: Duration) -> Self {
        self.constraint_poll = poll;
        self
    }

    /// Run until the job ends or shutdown. `observe` sees the job status
    /// after every completed cycle.
    pub async fn run<F>(self, mut shutdown: watch::Receiver<bool>, mut observe: F)
    where
        F: FnMut(&JobStatus) + Send,
    {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            match self.scheduler.on_due(&self.name).await {
                DueOutcome::Ran(_) => {
                    observe(&self.scheduler.query(&self.name).await);
                }
                DueOutcome::Deferred { constraint } => {
                    debug!(job = %self.name, %constraint, "waiting for constraint");
                    tokio::select! {
                        _ = sleep(self.constraint_poll) => continue,
                        _ = cancelled(&mut shutdown) => break,
                    }
                }
                DueOutcome::Skipped(SkipReason::CycleInFlight) => {}
                DueOutcome::Skipped(reason) => {
                    info!(job = %self.name, ?reason, "driver stopping");
                    break;
                }
            }

            let status = self.scheduler.query(&self.name).await;
            let Some(interval_ms) = status.interval_ms else {
                info!(job = %self.name, state = ?status.state, "one-shot job finished");
                break;
            };
            if !status.state.is_active() {
                info!(job = %self.name, state = ?status.state, "driver stopping");
                break;
            }

            let next = started + Duration::from_millis(interval_ms);
            tokio::select! {
                _ = sleep_until(next) => {}
                _ = cancelled(&mut shutdown) => break,
            }
        }
        debug!(job = %self.name, "driver stopped");
    }
}
