use std::time::Duration;

/// Bounded exponential backoff for part attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempt ceiling per part, first try included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt `attempt` (1-based): the
    /// exponential base, capped at `max_delay`, spread by ±25% so parts
    /// failing together do not retry together.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        if base <= 0.0 {
            return Duration::ZERO;
        }
        let spread = 1.0 + 0.25 * jitter_unit();
        Duration::from_secs_f64((base * spread).max(0.0))
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(63) as i32;
        let grown = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(doublings);
        Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()).max(0.0))
    }

    /// Returns `true` if another attempt is allowed after `attempt` tries.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Pseudo-random value in `[-1.0, 1.0)` taken from the clock.
fn jitter_unit() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos) / 500_000_000.0 - 1.0
}
