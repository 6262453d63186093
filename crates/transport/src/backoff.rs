//! Exponential backoff
//!
//! `trigger` hands out the current wait and doubles the stored value for
//! next time, capped at `max`. A zero floor means the first retry is
//! immediate; the following one waits at least a second.

use std::time::Duration;

/// Smallest wait once the backoff has been triggered at least once
const MIN_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a backoff starting at `floor` and never exceeding `max`
    pub fn new(floor: Duration, max: Duration) -> Self {
        let floor = floor.min(max);
        Self {
            floor,
            max,
            current: floor,
        }
    }

    /// Return the wait to apply now and grow the next one
    pub fn trigger(&mut self) -> Duration {
        let wait = self.current;
        self.current = (self.current.saturating_mul(2)).max(MIN_STEP).min(self.max);
        wait
    }

    /// Return to the floor after a success
    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    /// Wait the next `trigger` would return
    #[inline]
    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_floor_retries_immediately_then_grows() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::from_secs(300));
        assert_eq!(backoff.trigger(), Duration::ZERO);
        assert_eq!(backoff.trigger(), Duration::from_secs(1));
        assert_eq!(backoff.trigger(), Duration::from_secs(2));
        assert_eq!(backoff.trigger(), Duration::from_secs(4));
    }

    #[test]
    fn test_monotonic_and_capped() {
        let max = Duration::from_secs(30);
        let mut backoff = Backoff::new(Duration::from_secs(5), max);
        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let wait = backoff.trigger();
            assert!(wait >= previous);
            assert!(wait <= max);
            previous = wait;
        }
        assert_eq!(previous, max);
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(300));
        backoff.trigger();
        backoff.trigger();
        assert_eq!(backoff.current(), Duration::from_secs(20));
        backoff.reset();
        assert_eq!(backoff.trigger(), Duration::from_secs(5));
    }

    #[test]
    fn test_floor_above_max_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(10));
        assert_eq!(backoff.trigger(), Duration::from_secs(10));
        assert_eq!(backoff.trigger(), Duration::from_secs(10));
    }
}
