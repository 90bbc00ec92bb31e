use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::delivery::CycleWork;
use crate::error::SchedulerError;
use crate::job::{CycleOutcome, CycleRecord, ExistingJobPolicy, JobState, JobStatus};

/// Smallest interval accepted unless overridden.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Precondition that must hold before a due cycle may run.
#[async_trait]
pub trait Constraint: Send + Sync {
    /// Name used when reporting a deferral.
    fn name(&self) -> &str;
    /// Whether the cycle may run now.
    async fn satisfied(&self) -> bool;
}

/// What to register with the scheduler.
#[derive(Clone)]
pub struct JobSpec {
    /// Unique job name.
    pub name: String,
    /// Time between cycle starts; `None` runs a single cycle.
    pub interval: Option<Duration>,
    /// Checked on every due time; any failing one defers the cycle.
    pub constraints: Vec<Arc<dyn Constraint>>,
}

impl JobSpec {
    /// A job repeating every `interval`.
    pub fn periodic(name: impl Into<String>, interval: Duration) -> Self {
        Self { name: name.into(), interval: Some(interval), constraints: Vec::new() }
    }

    /// A job that runs one cycle and stops.
    pub fn one_shot(name: impl Into<String>) -> Self {
        Self { name: name.into(), interval: None, constraints: Vec::new() }
    }

    /// Add a constraint.
    pub fn with_constraint(mut self, c: Arc<dyn Constraint>) -> Self {
        self.constraints.push(c);
        self
    }
}

/// Effect of an `enqueue` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// No active job had this name; the new one is scheduled.
    Installed,
    /// An active job exists and the policy was `Keep`.
    Kept,
    /// An active job was cancelled and the new one scheduled.
    Replaced,
}

/// Why `on_due` did not run a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No job with this name.
    Unknown,
    /// The job is not `Scheduled`.
    Inactive(JobState),
    /// A cycle of this name is still running.
    CycleInFlight,
}

/// Result of an `on_due` trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DueOutcome {
    /// A cycle ran to a terminal outcome.
    Ran(CycleRecord),
    /// A constraint did not hold; the job stays `Scheduled`.
    Deferred {
        /// Name of the failing constraint.
        constraint: String,
    },
    /// Nothing ran.
    Skipped(SkipReason),
}

struct JobSlot {
    spec: JobSpec,
    state: JobState,
    generation: u64,
    cancel: watch::Sender<bool>,
    in_flight: bool,
    last: Option<CycleRecord>,
}

impl JobSlot {
    fn status(&self) -> JobStatus {
        JobStatus {
            name: self.spec.name.clone(),
            state: self.state,
            interval_ms: self.spec.interval.map(|d| d.as_millis() as u64),
            last: self.last.clone(),
        }
    }
}

#[derive(Default)]
struct Registry {
    slots: HashMap<String, JobSlot>,
    next_generation: u64,
}

impl Registry {
    fn install(&mut self, spec: JobSpec, previous: Option<JobSlot>) {
        self.next_generation += 1;
        let (cancel, _) = watch::channel(false);
        let (in_flight, last) = previous.map(|p| (p.in_flight, p.last)).unwrap_or((false, None));
        let name = spec.name.clone();
        let slot = JobSlot {
            spec,
            state: JobState::Scheduled,
            generation: self.next_generation,
            cancel,
            in_flight,
            last,
        };
        self.slots.insert(name, slot);
    }
}

/// Registry of named jobs and the authority on their state.
///
/// All state lives behind one lock, so `query` never sees a half-applied
/// transition. The lock is never held while a cycle runs.
pub struct Scheduler {
    registry: Mutex<Registry>,
    work: Arc<dyn CycleWork>,
    min_interval: Duration,
}

impl Scheduler {
    /// Build a scheduler running `work` for every due cycle.
    pub fn new(work: Arc<dyn CycleWork>) -> Self {
        Self { registry: Mutex::new(Registry::default()), work, min_interval: DEFAULT_MIN_INTERVAL }
    }

    /// Override the smallest accepted interval.
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// Register a job. Returns without waiting for its first cycle.
    pub async fn enqueue(
        &self,
        spec: JobSpec,
        policy: ExistingJobPolicy,
    ) -> Result<Enqueued, SchedulerError> {
        if let Some(interval) = spec.interval {
            if interval.is_zero() || interval < self.min_interval {
                return Err(SchedulerError::InvalidInterval {
                    requested: interval,
                    minimum: self.min_interval,
                });
            }
        }

        let mut reg = self.registry.lock().await;
        let active = reg.slots.get(&spec.name).map(|s| s.state.is_active()).unwrap_or(false);
        if active && policy == ExistingJobPolicy::Keep {
            debug!(job = %spec.name, "enqueue kept existing job");
            return Ok(Enqueued::Kept);
        }

        let previous = reg.slots.remove(&spec.name);
        if let Some(prev) = &previous {
            prev.cancel.send_replace(true);
        }
        info!(job = %spec.name, interval = ?spec.interval, "job scheduled");
        reg.install(spec, previous);
        Ok(if active { Enqueued::Replaced } else { Enqueued::Installed })
    }

    /// Stop a job. A running cycle finishes its current send but starts no
    /// further attempt. Unknown or already cancelled names are ignored.
    pub async fn cancel(&self, name: &str) {
        let mut reg = self.registry.lock().await;
        let Some(slot) = reg.slots.get_mut(name) else {
            return;
        };
        if slot.state == JobState::Cancelled {
            return;
        }
        slot.state = JobState::Cancelled;
        slot.cancel.send_replace(true);
        info!(job = %name, in_flight = slot.in_flight, "job cancelled");
    }

    /// Current state and last completed cycle of `name`.
    pub async fn query(&self, name: &str) -> JobStatus {
        let reg = self.registry.lock().await;
        reg.slots
            .get(name)
            .map(JobSlot::status)
            .unwrap_or_else(|| JobStatus::not_scheduled(name))
    }

    /// Smallest accepted interval.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Run one cycle of `name` if it is `Scheduled`, idle and its
    /// constraints hold. Cycle failures are recorded, never returned.
    ///
    /// The returned future must be driven to completion once a cycle has
    /// started; dropping it leaves the job marked in flight.
    pub async fn on_due(&self, name: &str) -> DueOutcome {
        let (constraints, generation) = {
            let reg = self.registry.lock().await;
            let Some(slot) = reg.slots.get(name) else {
                return DueOutcome::Skipped(SkipReason::Unknown);
            };
            if slot.in_flight {
                debug!(job = %name, "due while a cycle is running; ignored");
                return DueOutcome::Skipped(SkipReason::CycleInFlight);
            }
            if slot.state != JobState::Scheduled {
                return DueOutcome::Skipped(SkipReason::Inactive(slot.state));
            }
            (slot.spec.constraints.clone(), slot.generation)
        };

        for c in &constraints {
            if !c.satisfied().await {
                debug!(job = %name, constraint = c.name(), "cycle deferred");
                return DueOutcome::Deferred { constraint: c.name().to_string() };
            }
        }

        let cancel = {
            let mut reg = self.registry.lock().await;
            let Some(slot) = reg.slots.get_mut(name) else {
                return DueOutcome::Skipped(SkipReason::Unknown);
            };
            if slot.in_flight {
                return DueOutcome::Skipped(SkipReason::CycleInFlight);
            }
            if slot.generation != generation || slot.state != JobState::Scheduled {
                return DueOutcome::Skipped(SkipReason::Inactive(slot.state));
            }
            slot.state = JobState::Running;
            slot.in_flight = true;
            slot.cancel.subscribe()
        };
        debug!(job = %name, "cycle started");

        let report = self.work.run_cycle(cancel).await;
        let record = CycleRecord {
            outcome: report.outcome,
            attempts: report.attempts,
            finished_at_ms: now_ms(),
        };

        let mut reg = self.registry.lock().await;
        if let Some(slot) = reg.slots.get_mut(name) {
            slot.in_flight = false;
            if slot.generation == generation {
                slot.last = Some(record.clone());
                if slot.state == JobState::Running {
                    slot.state = next_state(slot.spec.interval.is_some(), &record.outcome);
                }
                debug!(job = %name, state = ?slot.state, "cycle finished");
            } else {
                debug!(job = %name, "cycle of a replaced job finished");
            }
        }
        DueOutcome::Ran(record)
    }
}

fn next_state(recurring: bool, outcome: &CycleOutcome) -> JobState {
    if recurring {
        return JobState::Scheduled;
    }
    match outcome {
        CycleOutcome::Succeeded => JobState::Succeeded,
        CycleOutcome::Failed { .. } => JobState::Failed,
        CycleOutcome::Cancelled => JobState::Cancelled,
    }
}

/// Wall clock in ms since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::Notify;

    use crate::delivery::tests::ScriptedSender;
    use crate::delivery::{DeliveryUnit, PingCycle, RetryPolicy};
    use crate::error::SendError;
    use crate::ping::{FixedDeviceId, PingMessage, SendResult, Sender};

    pub(crate) const JOB: &str = "periodic_ping_work";

    pub(crate) fn scheduler_with(sender: Arc<dyn Sender>) -> Arc<Scheduler> {
        let unit = DeliveryUnit::new(sender, RetryPolicy::default());
        let work = PingCycle::new(Arc::new(FixedDeviceId("watch-01".into())), unit);
        Arc::new(Scheduler::new(Arc::new(work)))
    }

    pub(crate) fn every_15m() -> JobSpec {
        JobSpec::periodic(JOB, Duration::from_secs(15 * 60))
    }

    /// Constraint backed by a flag the test flips.
    pub(crate) struct Toggle(pub(crate) AtomicBool);

    #[async_trait]
    impl Constraint for Toggle {
        fn name(&self) -> &str {
            "network"
        }
        async fn satisfied(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Sender that parks every call until released.
    struct GatedSender {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Sender for GatedSender {
        async fn send(&self, _message: &PingMessage) -> SendResult {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn never_enqueued_is_not_scheduled() {
        let s = scheduler_with(ScriptedSender::new(vec![]));
        let st = s.query("nope").await;
        assert_eq!(st.state, JobState::NotScheduled);
        assert!(st.last.is_none());
    }

    #[tokio::test]
    async fn keep_twice_yields_one_job() {
        let s = scheduler_with(ScriptedSender::new(vec![]));
        assert_eq!(s.enqueue(every_15m(), ExistingJobPolicy::Keep).await, Ok(Enqueued::Installed));
        assert_eq!(s.enqueue(every_15m(), ExistingJobPolicy::Keep).await, Ok(Enqueued::Kept));
        assert_eq!(s.query(JOB).await.state, JobState::Scheduled);
        assert_eq!(s.registry.lock().await.slots.len(), 1);
    }

    #[tokio::test]
    async fn replace_installs_new_interval() {
        let s = scheduler_with(ScriptedSender::new(vec![]));
        s.enqueue(every_15m(), ExistingJobPolicy::Keep).await.unwrap();
        let r = s
            .enqueue(JobSpec::periodic(JOB, Duration::from_secs(60)), ExistingJobPolicy::Replace)
            .await;
        assert_eq!(r, Ok(Enqueued::Replaced));
        assert_eq!(s.query(JOB).await.interval_ms, Some(60_000));
    }

    #[tokio::test]
    async fn keep_reinstalls_a_cancelled_job() {
        let s = scheduler_with(ScriptedSender::new(vec![]));
        s.enqueue(every_15m(), ExistingJobPolicy::Keep).await.unwrap();
        s.cancel(JOB).await;
        assert_eq!(s.enqueue(every_15m(), ExistingJobPolicy::Keep).await, Ok(Enqueued::Installed));
        assert_eq!(s.query(JOB).await.state, JobState::Scheduled);
    }

    #[tokio::test]
    async fn short_interval_is_rejected() {
        let s = scheduler_with(ScriptedSender::new(vec![]));
        let err = s
            .enqueue(JobSpec::periodic(JOB, Duration::from_millis(10)), ExistingJobPolicy::Keep)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SchedulerError::InvalidInterval {
                requested: Duration::from_millis(10),
                minimum: DEFAULT_MIN_INTERVAL,
            }
        );
        assert_eq!(s.query(JOB).await.state, JobState::NotScheduled);
    }

    #[tokio::test]
    async fn enqueue_then_cancel_reports_cancelled() {
        let s = scheduler_with(ScriptedSender::new(vec![]));
        s.enqueue(every_15m(), ExistingJobPolicy::Keep).await.unwrap();
        s.cancel(JOB).await;
        s.cancel(JOB).await;
        s.cancel("unknown").await;
        assert_eq!(s.query(JOB).await.state, JobState::Cancelled);
        assert_eq!(s.query("unknown").await.state, JobState::NotScheduled);
        assert_eq!(s.on_due(JOB).await, DueOutcome::Skipped(SkipReason::Inactive(JobState::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_third_attempt_returns_to_scheduled() {
        let sender = ScriptedSender::failing(2);
        let s = scheduler_with(sender.clone());
        s.enqueue(every_15m(), ExistingJobPolicy::Keep).await.unwrap();

        let DueOutcome::Ran(record) = s.on_due(JOB).await else {
            panic!("cycle did not run");
        };
        assert_eq!(record.outcome, CycleOutcome::Succeeded);
        assert_eq!(record.attempts, 3);
        assert_eq!(sender.calls(), 3);

        let st = s.query(JOB).await;
        assert_eq!(st.state, JobState::Scheduled);
        assert_eq!(st.last, Some(record));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_cycle_is_recorded_and_job_stays_scheduled() {
        let sender = ScriptedSender::failing(3);
        let s = scheduler_with(sender.clone());
        s.enqueue(every_15m(), ExistingJobPolicy::Keep).await.unwrap();

        let DueOutcome::Ran(record) = s.on_due(JOB).await else {
            panic!("cycle did not run");
        };
        assert!(matches!(record.outcome, CycleOutcome::Failed { .. }));
        assert_eq!(sender.calls(), 3);
        assert_eq!(s.query(JOB).await.state, JobState::Scheduled);

        // the next cycle proceeds normally
        let DueOutcome::Ran(next) = s.on_due(JOB).await else {
            panic!("second cycle did not run");
        };
        assert_eq!(next.outcome, CycleOutcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_ends_in_terminal_state() {
        let s = scheduler_with(ScriptedSender::failing(3));
        s.enqueue(JobSpec::one_shot("ping_now"), ExistingJobPolicy::Replace).await.unwrap();
        s.on_due("ping_now").await;
        assert_eq!(s.query("ping_now").await.state, JobState::Failed);
        assert_eq!(
            s.on_due("ping_now").await,
            DueOutcome::Skipped(SkipReason::Inactive(JobState::Failed))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_due_while_running_is_ignored() {
        let sender = Arc::new(GatedSender { entered: Notify::new(), release: Notify::new() });
        let s = scheduler_with(sender.clone());
        s.enqueue(every_15m(), ExistingJobPolicy::Keep).await.unwrap();

        let first = tokio::spawn({
            let s = s.clone();
            async move { s.on_due(JOB).await }
        });
        sender.entered.notified().await;

        assert_eq!(s.query(JOB).await.state, JobState::Running);
        assert_eq!(s.on_due(JOB).await, DueOutcome::Skipped(SkipReason::CycleInFlight));

        sender.release.notify_one();
        assert!(matches!(first.await.unwrap(), DueOutcome::Ran(_)));
        assert_eq!(s.query(JOB).await.state, JobState::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn replace_while_running_does_not_overlap_cycles() {
        let sender = Arc::new(GatedSender { entered: Notify::new(), release: Notify::new() });
        let s = scheduler_with(sender.clone());
        s.enqueue(every_15m(), ExistingJobPolicy::Keep).await.unwrap();

        let first = tokio::spawn({
            let s = s.clone();
            async move { s.on_due(JOB).await }
        });
        sender.entered.notified().await;

        let r = s.enqueue(every_15m(), ExistingJobPolicy::Replace).await;
        assert_eq!(r, Ok(Enqueued::Replaced));
        assert_eq!(s.on_due(JOB).await, DueOutcome::Skipped(SkipReason::CycleInFlight));

        sender.release.notify_one();
        first.await.unwrap();
        let st = s.query(JOB).await;
        assert_eq!(st.state, JobState::Scheduled);
        assert!(st.last.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_prevents_next_attempt() {
        let sender = ScriptedSender::failing(3);
        let s = scheduler_with(sender.clone());
        s.enqueue(every_15m(), ExistingJobPolicy::Keep).await.unwrap();

        let cycle = tokio::spawn({
            let s = s.clone();
            async move { s.on_due(JOB).await }
        });
        while sender.calls() < 1 {
            tokio::task::yield_now().await;
        }
        s.cancel(JOB).await;

        let DueOutcome::Ran(record) = cycle.await.unwrap() else {
            panic!("cycle did not run");
        };
        assert_eq!(record.outcome, CycleOutcome::Cancelled);
        assert_eq!(sender.calls(), 1);

        let st = s.query(JOB).await;
        assert_eq!(st.state, JobState::Cancelled);
        assert_eq!(st.last.map(|l| l.outcome), Some(CycleOutcome::Cancelled));
    }

    #[tokio::test]
    async fn unmet_constraint_defers_and_keeps_scheduled() {
        let sender = ScriptedSender::new(vec![Err(SendError::Recoverable("never".into()))]);
        let s = scheduler_with(sender.clone());
        let net = Arc::new(Toggle(AtomicBool::new(false)));
        s.enqueue(every_15m().with_constraint(net.clone()), ExistingJobPolicy::Keep)
            .await
            .unwrap();

        assert_eq!(s.on_due(JOB).await, DueOutcome::Deferred { constraint: "network".into() });
        assert_eq!(s.query(JOB).await.state, JobState::Scheduled);
        assert_eq!(sender.calls(), 0);
    }
}
