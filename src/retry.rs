use crate::delivery::{DeliveryError, DeliveryResult};
use crate::pacing::RulePacer;
use crate::types::ChatIdentity;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub wait_on_throttle: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            wait_on_throttle: true,
        }
    }
}

impl RetryPolicy {
    pub fn best_effort() -> Self {
        Self {
            max_attempts: 1,
            wait_on_throttle: false,
            ..Self::default()
        }
    }

    pub fn backoff(&self, retry_count: u32) -> Duration {
        compute_backoff(self.base_backoff, self.max_backoff, retry_count)
    }
}

/// `base * 2^(retry_count - 1)`, capped at `max`. Retry counts below one are
/// treated as the first retry.
pub fn compute_backoff(base: Duration, max: Duration, retry_count: u32) -> Duration {
    let exponent = retry_count.max(1).saturating_sub(1).min(16);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(max)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub rule: String,
    pub target: ChatIdentity,
    pub message_ids: Vec<i64>,
    pub dispatches: u32,
    pub throttled: u32,
    pub next_eligible: Instant,
}

impl DeliveryAttempt {
    pub fn new(rule: &str, target: ChatIdentity, message_ids: Vec<i64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule: rule.to_string(),
            target,
            message_ids,
            dispatches: 0,
            throttled: 0,
            next_eligible: Instant::now(),
        }
    }

    pub fn budget_used(&self) -> u32 {
        self.dispatches - self.throttled
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Delivered,
    Failed(FailureReason),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    Exhausted(String),
    Permanent(String),
    Throttled(Duration),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Exhausted(last) => write!(f, "retries exhausted: {}", last),
            FailureReason::Permanent(reason) => write!(f, "permanent: {}", reason),
            FailureReason::Throttled(wait) => write!(f, "throttled for {:?} during flush", wait),
        }
    }
}

pub struct Pacing<'a> {
    pub pacer: &'a RulePacer,
    pub delay: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub async fn drive<F, Fut>(
        &self,
        attempt: &mut DeliveryAttempt,
        pacing: Option<Pacing<'_>>,
        cancel: &CancellationToken,
        mut op: F,
    ) -> AttemptOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DeliveryResult<()>>,
    {
        loop {
            if attempt.next_eligible > Instant::now() {
                tokio::select! {
                    _ = sleep_until(attempt.next_eligible) => {}
                    _ = cancel.cancelled() => return AttemptOutcome::Cancelled,
                }
            }
            if let Some(pacing) = pacing.as_ref() {
                if pacing.pacer.acquire(pacing.delay, cancel).await.is_none() {
                    return AttemptOutcome::Cancelled;
                }
            }

            attempt.dispatches += 1;
            let result = op().await;
            let now = Instant::now();
            match result {
                Ok(()) => return AttemptOutcome::Delivered,
                Err(DeliveryError::Throttled(wait)) => {
                    attempt.throttled += 1;
                    if !self.policy.wait_on_throttle {
                        return AttemptOutcome::Failed(FailureReason::Throttled(wait));
                    }
                    warn!(
                        rule = %attempt.rule,
                        target = %attempt.target,
                        wait_ms = wait.as_millis() as u64,
                        "throttled by platform, suspending delivery"
                    );
                    attempt.next_eligible = now + wait;
                }
                Err(DeliveryError::Transient(err)) => {
                    let used = attempt.budget_used();
                    if used >= self.policy.max_attempts {
                        return AttemptOutcome::Failed(FailureReason::Exhausted(err));
                    }
                    let delay = self.policy.backoff(used);
                    debug!(
                        rule = %attempt.rule,
                        target = %attempt.target,
                        attempt = used,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    attempt.next_eligible = now + delay;
                }
                Err(DeliveryError::Permanent(reason))
                | Err(DeliveryError::ForwardRestricted(reason)) => {
                    return AttemptOutcome::Failed(FailureReason::Permanent(reason));
                }
            }
        }
    }
}
