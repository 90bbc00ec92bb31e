use serde::{Deserialize, Serialize};

/// Lifecycle state of a named job.
///
/// A recurring job goes `Scheduled -> Running -> Scheduled` once per cycle;
/// the cycle's own result is kept in [`JobStatus::last`]. A one-shot job
/// stops at `Succeeded` or `Failed`. `Cancelled` is terminal until the job
/// is enqueued again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Never enqueued under this name.
    NotScheduled,
    /// Waiting for its next due time (or for its constraints).
    Scheduled,
    /// A cycle is in progress.
    Running,
    /// The final cycle of a one-shot job delivered its ping.
    Succeeded,
    /// The final cycle of a one-shot job exhausted its attempts.
    Failed,
    /// Stopped explicitly.
    Cancelled,
}

impl JobState {
    /// Scheduled or Running: enqueue with `Keep` leaves such a job alone.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Scheduled | JobState::Running)
    }
}

/// What `enqueue` does when a job with the same name already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingJobPolicy {
    /// Leave an active job untouched.
    Keep,
    /// Cancel the existing job and install the new one.
    Replace,
}

/// Terminal result of one delivery cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// One attempt was accepted by the server.
    Succeeded,
    /// Every attempt failed; carries the last failure reason.
    Failed {
        /// Reason reported by the last attempt.
        reason: String,
    },
    /// The job was cancelled before the cycle could finish.
    Cancelled,
}

impl CycleOutcome {
    /// Short label for logs and status views.
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Succeeded => "succeeded",
            CycleOutcome::Failed { .. } => "failed",
            CycleOutcome::Cancelled => "cancelled",
        }
    }
}

/// Record of the most recently completed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    /// How the cycle ended.
    pub outcome: CycleOutcome,
    /// Send calls made during the cycle.
    pub attempts: u32,
    /// Completion time (ms since epoch).
    pub finished_at_ms: u64,
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Job name.
    pub name: String,
    /// Current state.
    pub state: JobState,
    /// Interval between cycle starts (ms), absent for one-shot or unknown jobs.
    pub interval_ms: Option<u64>,
    /// Most recently completed cycle, if any.
    pub last: Option<CycleRecord>,
}

impl JobStatus {
    /// Status of a name the scheduler has never seen.
    pub fn not_scheduled(name: &str) -> Self {
        Self { name: name.to_string(), state: JobState::NotScheduled, interval_ms: None, last: None }
    }
}
