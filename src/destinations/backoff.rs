use std::time::Duration;

use rand::{thread_rng, Rng as _};

/// An exponential backoff strategy.
///
/// Produces durations that grow geometrically with the error count, bounded
/// between a minimum and maximum. With jitter enabled, any given duration is
/// drawn uniformly between the minimum and the calculated value so
/// concurrent retriers don't synchronize.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    min_backoff: Duration,
    max_backoff: Duration,
    factor: f64,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` without jitter.
    pub fn new(min_backoff: Duration, max_backoff: Duration, factor: f64) -> Self {
        Self {
            min_backoff,
            max_backoff,
            factor: factor.max(1.0),
            jitter: false,
        }
    }

    /// Creates a new `ExponentialBackoff` with jitter.
    pub fn with_jitter(min_backoff: Duration, max_backoff: Duration, factor: f64) -> Self {
        Self {
            jitter: true,
            ..Self::new(min_backoff, max_backoff, factor)
        }
    }

    /// Calculates the backoff duration for the given number of consecutive
    /// errors. An error count of zero yields the minimum backoff.
    pub fn get_backoff_duration(&self, error_count: u32) -> Duration {
        let min = self.min_backoff.as_secs_f64();
        let max = self.max_backoff.as_secs_f64();

        let mut backoff = (min * self.factor.powi(error_count as i32)).min(max);
        if self.jitter && backoff > min {
            backoff = thread_rng().gen_range(min..=backoff);
        }

        Duration::from_secs_f64(backoff.clamp(min, max))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn grows_by_the_factor_without_jitter() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(30), 1.5);

        assert_eq!(backoff.get_backoff_duration(0), Duration::from_millis(100));
        assert_eq!(backoff.get_backoff_duration(1), Duration::from_millis(150));
        assert_eq!(backoff.get_backoff_duration(2), Duration::from_millis(225));
    }

    #[test]
    fn saturates_at_the_maximum() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(30), 1.5);
        assert_eq!(backoff.get_backoff_duration(100), Duration::from_secs(30));
    }

    proptest! {
        #[test]
        fn property_test_backoff_is_monotonic_and_bounded(
            error_count in 0..64u32,
            error_count_increase in 1..5u32,
        ) {
            let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(30), 1.5);

            let first = backoff.get_backoff_duration(error_count);
            let second = backoff.get_backoff_duration(error_count.saturating_add(error_count_increase));

            prop_assert!(first <= second);
            prop_assert!(first >= Duration::from_millis(100));
            prop_assert!(second <= Duration::from_secs(30));
        }

        #[test]
        fn property_test_jittered_backoff_stays_bounded(error_count in 0..64u32) {
            let backoff = ExponentialBackoff::with_jitter(Duration::from_millis(100), Duration::from_secs(30), 1.5);

            let duration = backoff.get_backoff_duration(error_count);
            prop_assert!(duration >= Duration::from_millis(100));
            prop_assert!(duration <= Duration::from_secs(30));
        }
    }
}
