//! Reconnect retry policy.
//!
//! A pure decision function: `(attempt, kind) -> Option<delay>`. The
//! supervisor evaluates it; it never sleeps or mutates anything itself.
//! Connect and auth failures share one schedule — credentials can be fixed
//! operationally, so an auth failure is not terminal, just loud.

use std::time::Duration;

use rand::Rng;

use courier_common::config::AppConfig;
use courier_transport::ErrorKind;

/// Backoff schedule for the supervisor's reconnect loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First-failure delay; doubles each attempt.
    pub base: Duration,
    /// Ceiling for the fast-phase delay.
    pub cap: Duration,
    /// Failures tolerated before switching to the degraded interval.
    pub max_fast_attempts: u32,
    /// Fixed retry interval once degraded.
    pub degraded_interval: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base: Duration::from_millis(config.retry_base_ms),
            cap: Duration::from_millis(config.retry_cap_ms),
            max_fast_attempts: config.max_fast_attempts,
            degraded_interval: Duration::from_secs(config.degraded_retry_secs),
        }
    }

    /// Delay before retry number `attempt` (1-based count of failures so
    /// far), or `None` when the failure kind is not retried by reconnecting.
    ///
    /// Fast phase: exponential `base * 2^(attempt-1)` capped at `cap`, with
    /// equal jitter (uniform over the upper half of the raw delay). Past
    /// `max_fast_attempts`: the fixed degraded interval.
    pub fn delay_for(&self, attempt: u32, kind: ErrorKind) -> Option<Duration> {
        match kind {
            ErrorKind::Connect | ErrorKind::Auth | ErrorKind::ChannelClosed => {}
            _ => return None,
        }

        if attempt > self.max_fast_attempts {
            return Some(self.degraded_interval);
        }

        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.cap);

        let half = raw / 2;
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=half);
        Some(half + jitter)
    }

    /// Whether this many failures puts the connection in degraded mode.
    pub fn is_degraded(&self, attempt: u32) -> bool {
        attempt > self.max_fast_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_fast_attempts: 6,
            degraded_interval: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_fast_delays_double_within_jitter_bounds() {
        let policy = policy();
        for attempt in 1..=6 {
            let raw = Duration::from_secs(1 << (attempt - 1)).min(policy.cap);
            let delay = policy
                .delay_for(attempt as u32, ErrorKind::Connect)
                .unwrap();
            assert!(delay >= raw / 2, "attempt {attempt}: {delay:?} below half");
            assert!(delay <= raw, "attempt {attempt}: {delay:?} above raw");
        }
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy {
            max_fast_attempts: 100,
            ..policy()
        };
        let delay = policy.delay_for(50, ErrorKind::Connect).unwrap();
        assert!(delay <= Duration::from_secs(60));
    }

    #[test]
    fn test_degraded_after_max_fast_attempts() {
        let policy = policy();
        assert!(!policy.is_degraded(6));
        assert!(policy.is_degraded(7));
        assert_eq!(
            policy.delay_for(7, ErrorKind::Connect),
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            policy.delay_for(100, ErrorKind::Connect),
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_auth_failures_use_same_schedule() {
        let policy = policy();
        let connect = policy.delay_for(7, ErrorKind::Connect);
        let auth = policy.delay_for(7, ErrorKind::Auth);
        assert_eq!(connect, auth);
        assert!(policy.delay_for(1, ErrorKind::Auth).is_some());
    }

    #[test]
    fn test_non_connection_kinds_not_retried() {
        let policy = policy();
        assert_eq!(policy.delay_for(1, ErrorKind::Consume), None);
        assert_eq!(policy.delay_for(1, ErrorKind::Publish), None);
        assert_eq!(policy.delay_for(1, ErrorKind::Ack), None);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy {
            max_fast_attempts: u32::MAX,
            ..policy()
        };
        let delay = policy.delay_for(u32::MAX, ErrorKind::Connect).unwrap();
        assert!(delay <= Duration::from_secs(60));
    }
}
