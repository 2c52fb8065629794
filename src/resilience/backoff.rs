//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

use crate::config::HandshakeConfig;

/// Calculate exponential backoff delay with jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Paces a loop that keeps hitting failures.
///
/// The first `threshold` consecutive failures are free; every failure after
/// that yields an exponentially growing delay. Build a fresh one for every
/// streak; the count only ever grows.
#[derive(Debug, Clone)]
pub struct FailureBackoff {
    threshold: u32,
    base_ms: u64,
    max_ms: u64,
    consecutive: u32,
}

impl FailureBackoff {
    pub fn new(threshold: u32, base_ms: u64, max_ms: u64) -> Self {
        Self {
            threshold,
            base_ms,
            max_ms,
            consecutive: 0,
        }
    }

    pub fn from_config(config: &HandshakeConfig) -> Self {
        Self::new(
            config.failures_before_backoff,
            config.backoff_base_ms,
            config.backoff_max_ms,
        )
    }

    /// Record a failure. Returns the delay to wait before trying again, if any.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.consecutive = self.consecutive.saturating_add(1);
        let over = self.consecutive.checked_sub(self.threshold)?;
        if over == 0 {
            return None;
        }
        Some(calculate_backoff(over, self.base_ms, self.max_ms))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let b1 = calculate_backoff(1, 100, 2000);
        assert!(b1.as_millis() >= 100);

        let b2 = calculate_backoff(2, 100, 2000);
        assert!(b2.as_millis() >= 200);

        let max = calculate_backoff(10, 100, 1000);
        assert!(max.as_millis() >= 1000);
        assert!(max.as_millis() < 1100);
    }

    #[test]
    fn failures_below_threshold_are_free() {
        let mut backoff = FailureBackoff::new(2, 10, 100);
        assert_eq!(backoff.record_failure(), None);
        assert_eq!(backoff.record_failure(), None);

        let delay = backoff.record_failure().expect("third failure backs off");
        assert!(delay >= Duration::from_millis(10));

        let longer = backoff.record_failure().unwrap();
        assert!(longer >= Duration::from_millis(20));
    }

    #[test]
    fn counts_every_failure() {
        let mut backoff = FailureBackoff::new(0, 10, 100);
        assert!(backoff.record_failure().is_some());
        assert!(backoff.record_failure().is_some());
        assert_eq!(backoff.consecutive_failures(), 2);
    }
}
