//! Reconnect policies.

use std::time::{Duration, Instant};

use crate::error::HubError;

/// The inputs a policy sees before each reconnect attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Failed attempts so far, not counting the one being considered.
    pub failed_attempts_count: u32,
    /// When the current reconnect episode began. Captured when the count
    /// first moves off zero and retained for the rest of the episode.
    pub reconnect_start_time: Instant,
    /// The error that ended the previous attempt.
    pub error: HubError,
}

/// Decides whether and when to retry after a failed attempt.
pub trait ReconnectPolicy: Send + Sync + 'static {
    /// Delay before the next attempt, or `None` to give up.
    fn next_attempt_interval(&self, context: &RetryContext) -> Option<Duration>;
}

/// Retries at 0s, 2s, 10s and 30s, then gives up.
pub struct DefaultReconnectPolicy {
    intervals: Vec<Duration>,
}

impl DefaultReconnectPolicy {
    /// A policy with a custom delay ladder; one attempt per entry.
    pub fn with_intervals(intervals: Vec<Duration>) -> Self {
        Self { intervals }
    }
}

impl Default for DefaultReconnectPolicy {
    fn default() -> Self {
        Self::with_intervals(vec![
            Duration::ZERO,
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ])
    }
}

impl ReconnectPolicy for DefaultReconnectPolicy {
    fn next_attempt_interval(&self, context: &RetryContext) -> Option<Duration> {
        self.intervals
            .get(context.failed_attempts_count as usize)
            .copied()
    }
}

/// Exponential backoff with a delay cap and an attempt limit.
pub struct ExponentialBackoffPolicy {
    base: Duration,
    max_delay: Duration,
    factor: f64,
    max_attempts: u32,
}

impl ExponentialBackoffPolicy {
    pub fn new(base: Duration, max_delay: Duration, factor: f64, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            factor,
            max_attempts,
        }
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0, 5)
    }
}

impl ReconnectPolicy for ExponentialBackoffPolicy {
    fn next_attempt_interval(&self, context: &RetryContext) -> Option<Duration> {
        if context.failed_attempts_count >= self.max_attempts {
            return None;
        }
        let delay = self
            .base
            .mul_f64(self.factor.powi(context.failed_attempts_count as i32));
        Some(delay.min(self.max_delay))
    }
}

/// Never retries; the connection closes on the first failure.
pub struct NoReconnectPolicy;

impl ReconnectPolicy for NoReconnectPolicy {
    fn next_attempt_interval(&self, _context: &RetryContext) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(failed_attempts_count: u32) -> RetryContext {
        RetryContext {
            failed_attempts_count,
            reconnect_start_time: Instant::now(),
            error: HubError::InvalidState,
        }
    }

    #[test]
    fn default_policy_walks_its_ladder_then_gives_up() {
        let policy = DefaultReconnectPolicy::default();
        assert_eq!(
            policy.next_attempt_interval(&context(0)),
            Some(Duration::ZERO)
        );
        assert_eq!(
            policy.next_attempt_interval(&context(1)),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            policy.next_attempt_interval(&context(2)),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            policy.next_attempt_interval(&context(3)),
            Some(Duration::from_secs(30))
        );
        assert_eq!(policy.next_attempt_interval(&context(4)), None);
    }

    #[test]
    fn exponential_policy_doubles_and_caps() {
        let policy = ExponentialBackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(500),
            2.0,
            10,
        );
        assert_eq!(
            policy.next_attempt_interval(&context(0)),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            policy.next_attempt_interval(&context(2)),
            Some(Duration::from_millis(400))
        );
        assert_eq!(
            policy.next_attempt_interval(&context(5)),
            Some(Duration::from_millis(500))
        );
        assert_eq!(policy.next_attempt_interval(&context(10)), None);
    }

    #[test]
    fn no_reconnect_gives_up_immediately() {
        assert_eq!(NoReconnectPolicy.next_attempt_interval(&context(0)), None);
    }
}
