//! Reconnect delays: exponential with full jitter, bounded by a retry ceiling.

use std::time::Duration;

use rand::Rng;

use crate::config::SessionConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    ceiling: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, ceiling: u32) -> Self {
        Self {
            base,
            max,
            ceiling,
            attempt: 0,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
            config.reconnect_retry_ceiling,
        )
    }

    /// Upper bound of the delay before attempt `attempt` (1-based).
    pub fn cap(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before the next attempt, or `None` once the ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.ceiling {
            return None;
        }
        self.attempt += 1;
        let cap = self.cap(self.attempt).as_millis() as u64;
        Some(Duration::from_millis(rand::thread_rng().gen_range(0..=cap)))
    }

    /// Attempts handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_grow_until_max() {
        let backoff = Backoff::new(Duration::from_millis(1000), Duration::from_millis(30_000), 10);
        assert_eq!(backoff.cap(1), Duration::from_millis(1000));
        assert_eq!(backoff.cap(2), Duration::from_millis(2000));
        assert_eq!(backoff.cap(5), Duration::from_millis(16_000));
        assert_eq!(backoff.cap(6), Duration::from_millis(30_000));
        assert_eq!(backoff.cap(40), Duration::from_millis(30_000));
    }

    #[test]
    fn test_ceiling_and_jitter_bounds() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400), 4);
        for attempt in 1..=4 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay <= backoff.cap(attempt));
            assert_eq!(backoff.attempt(), attempt);
        }
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempt(), 4);
    }
}
