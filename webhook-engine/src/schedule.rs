//! Fixed backoff ladder
//!
//! Shared by webhook deliveries and document dispatch retries.

use chrono::Duration;

/// 1 min, 5 min, 30 min, 2 h, 24 h
pub const DEFAULT_LADDER_SECS: [i64; 5] = [60, 5 * 60, 30 * 60, 2 * 60 * 60, 24 * 60 * 60];

/// Retry schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    steps: Vec<Duration>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::from_secs(&DEFAULT_LADDER_SECS)
    }
}

impl RetrySchedule {
    /// Build from step lengths in seconds
    pub fn from_secs(steps: &[i64]) -> Self {
        Self {
            steps: steps.iter().map(|s| Duration::seconds(*s)).collect(),
        }
    }

    /// Number of automatic retries
    pub fn max_retries(&self) -> u32 {
        self.steps.len() as u32
    }

    /// Delay before the next attempt after `attempts` failed attempts, or
    /// `None` once the ladder is exhausted
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        let index = attempts.checked_sub(1)? as usize;
        self.steps.get(index).copied()
    }

    /// Like `next_delay` but holds the last step when callers run a longer
    /// retry budget than the ladder
    pub fn backoff(&self, attempts: u32) -> Duration {
        let index = (attempts.max(1) as usize - 1).min(self.steps.len().saturating_sub(1));
        self.steps.get(index).copied().unwrap_or_else(Duration::zero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ladder() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.max_retries(), 5);
        assert_eq!(schedule.next_delay(0), None);
        assert_eq!(schedule.next_delay(1), Some(Duration::minutes(1)));
        assert_eq!(schedule.next_delay(2), Some(Duration::minutes(5)));
        assert_eq!(schedule.next_delay(3), Some(Duration::minutes(30)));
        assert_eq!(schedule.next_delay(4), Some(Duration::hours(2)));
        assert_eq!(schedule.next_delay(5), Some(Duration::hours(24)));
        assert_eq!(schedule.next_delay(6), None);
    }

    #[test]
    fn test_backoff_clamps() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.backoff(0), Duration::minutes(1));
        assert_eq!(schedule.backoff(9), Duration::hours(24));
        assert_eq!(RetrySchedule::from_secs(&[]).backoff(3), Duration::zero());
    }

    proptest::proptest! {
        #[test]
        fn prop_backoff_is_monotonic(a in 0u32..64, b in 0u32..64) {
            let schedule = RetrySchedule::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            proptest::prop_assert!(schedule.backoff(lo) <= schedule.backoff(hi));
        }

        #[test]
        fn prop_next_delay_agrees_with_backoff(attempts in 1u32..=5) {
            let schedule = RetrySchedule::default();
            proptest::prop_assert_eq!(schedule.next_delay(attempts), Some(schedule.backoff(attempts)));
        }
    }
}
