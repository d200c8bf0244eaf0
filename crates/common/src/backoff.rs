//! Capped exponential backoff with full jitter.

use rand::Rng;
use std::time::Duration;

/// Reconnect/retry pacing: each failure doubles the ceiling up to `cap`,
/// the actual delay is drawn uniformly from `0..=ceiling` (full jitter).
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Defaults from the ingestion contract: base 1 s, cap 30 s.
    pub fn standard() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Delay for the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self
            .base
            .saturating_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let millis = ceiling.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }

    /// Reset after a healthy period.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_growth_and_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        // Drive well past the cap; every draw stays within it.
        for _ in 0..12 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(30));
        }
        assert_eq!(backoff.attempt(), 12);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::standard();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }
}
