//! Backoff schedule for managed transactions.
//!
//! Exponential growth with uniform jitter: attempt `i` sleeps
//! `initial · multiplier^i` scaled by a factor drawn from
//! `[1 - jitter, 1 + jitter]`. The session owns the loop; this type owns
//! the arithmetic.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub max_retry_time: Duration,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retry_time: Duration::from_secs(30),
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub(crate) fn with_max_retry_time(max_retry_time: Duration) -> Self {
        RetryPolicy {
            max_retry_time,
            ..RetryPolicy::default()
        }
    }

    pub(crate) fn jittered(&self, delay: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retry_time, Duration::from_secs(30));
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.jitter, 0.2);
    }

    #[test]
    fn jittered_delays_stay_inside_the_envelope_at_every_attempt() {
        let policy = RetryPolicy::default();
        let mut delay = policy.initial_delay;
        for attempt in 0..4 {
            let base = policy.initial_delay.as_secs_f64() * policy.multiplier.powi(attempt);
            for _ in 0..200 {
                let sampled = policy.jittered(delay).as_secs_f64();
                assert!(
                    sampled >= base * (1.0 - policy.jitter) - 1e-9
                        && sampled <= base * (1.0 + policy.jitter) + 1e-9,
                    "attempt {attempt}: {sampled} outside envelope around {base}"
                );
            }
            delay = delay.mul_f64(policy.multiplier);
        }
    }
}
