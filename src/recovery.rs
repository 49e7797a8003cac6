//! Bounded exponential backoff shared by the watch loops and the log tailer.

// System
use std::time::Duration;

// Third Party
use rand::Rng;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_FAILURES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failure; doubles with every consecutive failure.
    pub base: Duration,
    pub cap: Duration,
    /// Consecutive failures after which the loop gives up.
    pub max_failures: u32,
    /// Upper bound of the random delay added to each sleep.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
            max_failures: DEFAULT_MAX_FAILURES,
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay after `failures` consecutive failures: `min(cap, base * 2^(failures - 1))`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.checked_pow(failures - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    fn jitter(&self) -> Duration {
        let max = self.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max))
    }
}

/// Consecutive-failure counter for one loop.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_failures(&self) -> u32 {
        self.policy.max_failures
    }

    /// Call after a fully successful iteration.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Records a failure and returns how long to wait, or `None` once the ceiling is reached.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_failures {
            None
        } else {
            Some(self.policy.delay_for(self.failures))
        }
    }

    /// `delay` plus jitter, never longer than the policy cap.
    pub fn jittered(&self, delay: Duration) -> Duration {
        (delay + self.policy.jitter()).min(self.policy.cap)
    }

    /// Sleep for the jittered `delay`. Returns false if cancelled first.
    pub async fn wait(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        sleep_or_cancel(self.jittered(delay), cancel).await
    }
}

/// Returns false if the token fired before the sleep finished.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
