use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::SendError;
use crate::job::CycleOutcome;
use crate::ping::{DeviceIdProvider, PingMessage, Sender};

/// Attempt bound and backoff base for one cycle.
///
/// The wait after failed attempt `i` (0-based) is `base_delay * 2^i`,
/// computed in whole milliseconds. There is no jitter and no cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Send calls per cycle; values below 1 behave as 1.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_millis(1000) }
    }
}

impl RetryPolicy {
    /// Wait inserted after failed attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// What a cycle did, for the scheduler and for logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Terminal outcome.
    pub outcome: CycleOutcome,
    /// Send calls made.
    pub attempts: u32,
    /// Backoff waits that ran to completion, in order.
    pub waits: Vec<Duration>,
}

/// Runs one cycle's attempts against a [`Sender`].
#[derive(Clone)]
pub struct DeliveryUnit {
    sender: Arc<dyn Sender>,
    policy: RetryPolicy,
}

impl DeliveryUnit {
    /// Build a unit around a sender and a policy.
    pub fn new(sender: Arc<dyn Sender>, policy: RetryPolicy) -> Self {
        Self { sender, policy }
    }

    /// Policy in use.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Deliver a ping for `device_id`, retrying until success or exhaustion.
    ///
    /// Once `cancel` reads `true` no further attempt starts; a backoff wait
    /// in progress ends early. A send already in flight is awaited.
    pub async fn run(&self, device_id: &str, mut cancel: watch::Receiver<bool>) -> CycleReport {
        let message = PingMessage::new(device_id);
        let max = self.policy.attempts();
        let mut waits = Vec::new();
        let mut last: Option<SendError> = None;

        for attempt in 0..max {
            if *cancel.borrow() {
                debug!(attempt, "cycle cancelled before attempt");
                return CycleReport { outcome: CycleOutcome::Cancelled, attempts: attempt, waits };
            }

            match self.sender.send(&message).await {
                Ok(()) => {
                    debug!(device_id = %message.device_id, "ping delivered on attempt {}", attempt + 1);
                    return CycleReport {
                        outcome: CycleOutcome::Succeeded,
                        attempts: attempt + 1,
                        waits,
                    };
                }
                Err(e) => {
                    match &e {
                        SendError::Recoverable(r) => warn!("ping failed on attempt {}: {r}", attempt + 1),
                        SendError::Unexpected(r) => error!("unexpected error on attempt {}: {r}", attempt + 1),
                    }
                    last = Some(e);
                }
            }

            if attempt + 1 < max {
                let wait = self.policy.backoff(attempt);
                debug!("retrying in {}ms", wait.as_millis());
                tokio::select! {
                    _ = sleep(wait) => waits.push(wait),
                    _ = cancelled(&mut cancel) => {
                        info!(attempt, "cycle cancelled during backoff");
                        return CycleReport {
                            outcome: CycleOutcome::Cancelled,
                            attempts: attempt + 1,
                            waits,
                        };
                    }
                }
            }
        }

        let reason = last
            .map(|e| e.to_string())
            .unwrap_or_else(|| "all attempts failed".to_string());
        CycleReport { outcome: CycleOutcome::Failed { reason }, attempts: max, waits }
    }
}

/// Resolves once `rx` reads `true`. A dropped sender never cancels.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// A receiver that never reports cancellation.
pub fn never_cancelled() -> watch::Receiver<bool> {
    watch::channel(false).1
}

/// Work executed by the scheduler each time a job is due.
#[async_trait]
pub trait CycleWork: Send + Sync {
    /// Run one cycle, honouring `cancel` between attempts.
    async fn run_cycle(&self, cancel: watch::Receiver<bool>) -> CycleReport;
}

/// The ping cycle: resolve the device id, then run the delivery unit.
pub struct PingCycle {
    device: Arc<dyn DeviceIdProvider>,
    unit: DeliveryUnit,
}

impl PingCycle {
    /// Combine a device id source with a delivery unit.
    pub fn new(device: Arc<dyn DeviceIdProvider>, unit: DeliveryUnit) -> Self {
        Self { device, unit }
    }
}

#[async_trait]
impl CycleWork for PingCycle {
    async fn run_cycle(&self, cancel: watch::Receiver<bool>) -> CycleReport {
        let device_id = self.device.device_id();
        let report = self.unit.run(&device_id, cancel).await;
        info!(
            device_id = %device_id,
            attempts = report.attempts,
            "ping cycle {}",
            report.outcome.label()
        );
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    use crate::ping::SendResult;

    /// Sender replaying a script; returns success once the script runs out.
    pub(crate) struct ScriptedSender {
        script: Mutex<VecDeque<Result<(), SendError>>>,
        seen: Mutex<Vec<PingMessage>>,
    }

    impl ScriptedSender {
        pub(crate) fn new(script: Vec<Result<(), SendError>>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()), seen: Mutex::new(Vec::new()) })
        }

        pub(crate) fn failing(n: usize) -> Arc<Self> {
            Self::new((0..n).map(|i| Err(SendError::Recoverable(format!("timeout #{i}")))).collect())
        }

        pub(crate) fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Sender for ScriptedSender {
        async fn send(&self, message: &PingMessage) -> SendResult {
            self.seen.lock().unwrap().push(message.clone());
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn unit(sender: Arc<ScriptedSender>) -> DeliveryUnit {
        DeliveryUnit::new(sender, RetryPolicy::default())
    }

    #[test]
    fn backoff_doubles_from_base() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(0), Duration::from_millis(1000));
        assert_eq!(p.backoff(1), Duration::from_millis(2000));
        assert_eq!(p.backoff(2), Duration::from_millis(4000));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let p = RetryPolicy { max_attempts: 100, base_delay: Duration::from_millis(1000) };
        assert_eq!(p.backoff(70), Duration::from_millis(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_needs_no_wait() {
        let sender = ScriptedSender::new(vec![]);
        let report = unit(sender.clone()).run("dev-1", never_cancelled()).await;

        assert_eq!(report.outcome, CycleOutcome::Succeeded);
        assert_eq!(report.attempts, 1);
        assert!(report.waits.is_empty());
        assert_eq!(sender.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn third_attempt_succeeds_after_two_waits() {
        let sender = ScriptedSender::failing(2);
        let started = Instant::now();
        let report = unit(sender.clone()).run("dev-1", never_cancelled()).await;

        assert_eq!(report.outcome, CycleOutcome::Succeeded);
        assert_eq!(report.attempts, 3);
        assert_eq!(sender.calls(), 3);
        assert_eq!(report.waits, vec![Duration::from_millis(1000), Duration::from_millis(2000)]);
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_last_reason() {
        let sender = ScriptedSender::new(vec![
            Err(SendError::Recoverable("HTTP 500: db down".into())),
            Err(SendError::Unexpected("bad body".into())),
            Err(SendError::Recoverable("connection refused".into())),
            Ok(()),
        ]);
        let report = unit(sender.clone()).run("dev-1", never_cancelled()).await;

        assert_eq!(
            report.outcome,
            CycleOutcome::Failed { reason: "recoverable: connection refused".into() }
        );
        assert_eq!(report.attempts, 3);
        assert_eq!(sender.calls(), 3);
        // no wait after the final attempt
        assert_eq!(report.waits.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_failures_are_retried_too() {
        let sender = ScriptedSender::new(vec![Err(SendError::Unexpected("boom".into()))]);
        let report = unit(sender.clone()).run("dev-1", never_cancelled()).await;
        assert_eq!(report.outcome, CycleOutcome::Succeeded);
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_max_attempts_still_sends_once() {
        let sender = ScriptedSender::failing(5);
        let u = DeliveryUnit::new(
            sender.clone(),
            RetryPolicy { max_attempts: 0, base_delay: Duration::from_millis(10) },
        );
        let report = u.run("dev-1", never_cancelled()).await;
        assert_eq!(report.attempts, 1);
        assert!(matches!(report.outcome, CycleOutcome::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_next_attempt() {
        let sender = ScriptedSender::failing(3);
        let (tx, rx) = watch::channel(false);
        let u = unit(sender.clone());
        let handle = tokio::spawn(async move { u.run("dev-1", rx).await });

        while sender.calls() < 1 {
            tokio::task::yield_now().await;
        }
        tx.send(true).unwrap();
        let report = handle.await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Cancelled);
        assert_eq!(report.attempts, 1);
        assert!(report.waits.is_empty());
        assert_eq!(sender.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_sends_nothing() {
        let sender = ScriptedSender::new(vec![]);
        let (_tx, rx) = watch::channel(true);
        let report = unit(sender.clone()).run("dev-1", rx).await;
        assert_eq!(report.outcome, CycleOutcome::Cancelled);
        assert_eq!(report.attempts, 0);
        assert_eq!(sender.calls(), 0);
    }
}
