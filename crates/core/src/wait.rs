//! Inter-iteration delay and per-flow retry delay.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Computes how long the scheduler loop sleeps between idle ticks.
pub trait WaitStrategy: Send + Sync {
    /// Delay before the next tick.
    fn wait_for(&self) -> Duration;

    /// A tick completed without errors.
    fn success(&self);

    /// A tick failed (e.g. the store was unreachable).
    fn failure(&self);
}

/// Waits `base` after a clean tick and backs off exponentially, up to
/// `max`, while ticks keep failing.
#[derive(Debug)]
pub struct ExponentialWaitStrategy {
    base: Duration,
    max: Duration,
    failures: AtomicU32,
}

impl ExponentialWaitStrategy {
    pub fn new(base: Duration, max: Duration) -> Self {
        ExponentialWaitStrategy {
            base,
            max: max.max(base),
            failures: AtomicU32::new(0),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

impl WaitStrategy for ExponentialWaitStrategy {
    fn wait_for(&self) -> Duration {
        exponential(self.base, self.max, self.consecutive_failures())
    }

    fn success(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    fn failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// Retry delay for flows: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        RetryBackoff { base, max }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential(self.base, self.max, attempt)
    }

    /// Whether a flow that failed `attempt` times, last at `last_attempt_ms`,
    /// must still wait at `now_ms`.
    pub fn should_delay(&self, attempt: u32, last_attempt_ms: i64, now_ms: i64) -> bool {
        if attempt == 0 {
            return false;
        }
        let delay = self.delay_for(attempt).as_millis() as i64;
        now_ms < last_attempt_ms.saturating_add(delay)
    }
}

fn exponential(base: Duration, max: Duration, exponent: u32) -> Duration {
    let factor = 1u32.checked_shl(exponent.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}
