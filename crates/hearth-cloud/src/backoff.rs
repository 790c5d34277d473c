use rand::Rng;
use std::time::{Duration, Instant};

/// Exponential backoff parameters. The cloud and OAuth request paths share
/// one policy but keep independent entries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiply_factor: f64,
    pub jitter_factor: f64,
    pub maximum_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial_delay: Duration::from_secs(1),
            multiply_factor: 2.0,
            jitter_factor: 0.1,
            maximum_delay: Duration::from_secs(30),
        }
    }
}

/// Tracks consecutive failures and computes when the next request may go
/// out.
#[derive(Debug)]
pub struct BackoffEntry {
    policy: BackoffPolicy,
    failure_count: u32,
    release_at: Option<Instant>,
}

impl BackoffEntry {
    pub fn new(policy: BackoffPolicy) -> Self {
        BackoffEntry {
            policy,
            failure_count: 0,
            release_at: None,
        }
    }

    pub fn inform_of_request(&mut self, succeeded: bool) {
        if succeeded {
            self.failure_count = 0;
            self.release_at = None;
            return;
        }
        self.failure_count += 1;
        let exponent = self.failure_count.saturating_sub(1).min(30);
        let base = self.policy.initial_delay.as_secs_f64()
            * self.policy.multiply_factor.powi(exponent as i32);
        let jitter = 1.0 + self.policy.jitter_factor * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
        let delay = Duration::from_secs_f64(
            (base * jitter).min(self.policy.maximum_delay.as_secs_f64()),
        );
        self.release_at = Some(Instant::now() + delay);
    }

    pub fn should_reject_request(&self) -> bool {
        self.release_at.is_some_and(|at| at > Instant::now())
    }

    pub fn time_until_release(&self) -> Duration {
        self.release_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_clears_the_backoff() {
        let mut entry = BackoffEntry::new(BackoffPolicy::default());
        assert!(!entry.should_reject_request());

        entry.inform_of_request(false);
        assert!(entry.should_reject_request());

        entry.inform_of_request(true);
        assert!(!entry.should_reject_request());
        assert_eq!(entry.time_until_release(), Duration::ZERO);
    }

    #[test]
    fn delay_grows_and_stays_under_the_cap() {
        let mut entry = BackoffEntry::new(BackoffPolicy::default());
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            entry.inform_of_request(false);
            let delay = entry.time_until_release();
            assert!(delay <= Duration::from_secs(30) + Duration::from_secs(3));
            if last < Duration::from_secs(20) {
                assert!(delay >= last.mul_f64(0.7), "{delay:?} vs {last:?}");
            }
            last = delay;
        }
    }

    #[test]
    fn first_failure_is_near_the_initial_delay() {
        let mut entry = BackoffEntry::new(BackoffPolicy::default());
        entry.inform_of_request(false);
        let delay = entry.time_until_release();
        assert!(delay >= Duration::from_millis(850), "{delay:?}");
        assert!(delay <= Duration::from_millis(1150), "{delay:?}");
    }
}
