//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

/// Retry policy for failed tasks.
///
/// `delay = min(base_delay * multiplier^(attempt - 1) + jitter, max_delay)`
/// with `jitter ~ U[0, base_delay / 3)`.
///
/// The jitter is always smaller than the gap between two consecutive
/// exponential steps, so delays are non-decreasing in `attempt` whatever
/// the random draws are.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound on any computed delay (jitter included).
    pub max_delay: Duration,

    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier: 2.0,
            max_delay: max_delay.max(base_delay),
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    ///
    /// Example with base_delay=5s, multiplier=2.0, no jitter:
    /// - attempt 1: 5s
    /// - attempt 2: 10s
    /// - attempt 3: 20s
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn next_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let jitter = if self.jitter {
            let span = self.base_delay.as_secs_f64() / 3.0;
            if span > 0.0 { rng.gen_range(0.0..span) } else { 0.0 }
        } else {
            0.0
        };

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent) + jitter;
        // powi overflows to inf long before the cap matters
        Duration::try_from_secs_f64(secs)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::rstest;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(300))
    }

    #[rstest]
    #[case(0, 5)]
    #[case(1, 5)]
    #[case(2, 10)]
    #[case(3, 20)]
    #[case(6, 160)]
    #[case(7, 300)]
    #[case(u32::MAX, 300)]
    fn exponential_backoff_is_capped(#[case] attempt: u32, #[case] expected_secs: u64) {
        let policy = policy().without_jitter();
        assert_eq!(policy.next_delay(attempt), Duration::from_secs(expected_secs));
    }

    #[test]
    fn jitter_stays_below_a_third_of_base() {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let delay = policy.next_delay_with(2, &mut rng);
            assert!(delay >= Duration::from_secs(10));
            assert!(delay < Duration::from_secs(10) + Duration::from_secs(5) / 3 + Duration::from_millis(1));
        }
    }

    #[rstest]
    #[case(1)]
    #[case(42)]
    #[case(1234)]
    fn delays_are_monotonic_and_bounded(#[case] seed: u64) {
        let policy = policy();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = policy.next_delay_with(attempt, &mut rng);
            assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
    }

    #[test]
    fn zero_base_delay_means_immediate_retry() {
        let policy = RetryPolicy::new(Duration::ZERO, Duration::from_secs(60));
        assert_eq!(policy.next_delay(3), Duration::ZERO);
    }
}
