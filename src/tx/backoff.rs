//! Capped exponential backoff with jitter

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            attempt: 0,
        }
    }

    /// Next delay: a random point between `min` and `min * 2^attempt`, capped at `max`
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.attempt = self.attempt.saturating_add(1);

        let ceiling = self.min.saturating_mul(factor).min(self.max);
        if ceiling <= self.min {
            return self.min;
        }
        let jittered = rand::thread_rng().gen_range(self.min.as_millis()..=ceiling.as_millis());
        Duration::from_millis(jittered as u64)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_stay_within_bounds() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_secs(5));
        }
        assert_eq!(backoff.attempt(), 21);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
