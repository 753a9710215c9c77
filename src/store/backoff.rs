//! Retry policies for lock contention and transient I/O failures.

use std::{fmt::Debug, thread, time::Duration};

use rand::RngCore;
use tracing::debug;

use super::StoreError;

/// Decides how long to wait before the next attempt of a store operation.
///
/// `attempt` is the number of attempts already made (1 after the first failure). Returning `None`
/// gives up and surfaces the last error.
pub trait BackoffPolicy: Send + Sync + Debug + 'static {
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Constant delay between a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    max_attempts: u32,
    delay: Duration,
}

impl FixedBackoff {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(100);

    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS, Self::DEFAULT_DELAY)
    }
}

impl BackoffPolicy for FixedBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then_some(self.delay)
    }
}

/// Doubling delay capped at `cap`, with up to `base_delay / jitter_max_divisor` of random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    max_attempts: u32,
    base: Duration,
    cap: Duration,
    jitter_max_divisor: u32,
}

impl ExponentialBackoff {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            cap,
            jitter_max_divisor: 0,
        }
    }

    pub fn with_jitter(mut self, jitter_max_divisor: u32) -> Self {
        self.jitter_max_divisor = jitter_max_divisor;
        self
    }

    fn delay_with_rng(&self, attempt: u32, rng: &mut impl RngCore) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let base = base_delay_for_attempt(self.base, self.cap, attempt.saturating_sub(1));

        let base_ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
        let jitter_max_ms = if self.jitter_max_divisor == 0 {
            0
        } else {
            base_ms / u64::from(self.jitter_max_divisor)
        };
        let jitter_ms = if jitter_max_ms == 0 {
            0
        } else {
            rng.next_u64() % (jitter_max_ms + 1)
        };

        let total_ms = base_ms.saturating_add(jitter_ms);
        Some(std::cmp::min(self.cap, Duration::from_millis(total_ms)))
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }
}

fn base_delay_for_attempt(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let mut delay = base;
    for _ in 0..attempt {
        delay = match delay.checked_mul(2) {
            Some(v) => v,
            None => return cap,
        };
        if delay >= cap {
            return cap;
        }
    }
    std::cmp::min(delay, cap)
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or `policy` gives up.
///
/// `op` receives the 1-based attempt number. The calling thread sleeps between attempts.
pub(crate) fn retry<T>(
    policy: &dyn BackoffPolicy,
    mut op: impl FnMut(u32) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        let err = match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };
        let Some(delay) = policy.next_delay(attempt) else {
            return Err(err);
        };
        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying store operation");
        thread::sleep(delay);
    }
}
