//! Reconnection pacing for client links.

use std::time::Duration;

/// Default stability threshold: a link that survived this long is
/// considered healthy and resets the backoff schedule.
pub const STABILITY_THRESHOLD: Duration = Duration::from_secs(20 * 60);

/// Sleep schedule for the client dial loop.
///
/// Failed dials sleep 1 s, 2 s, 4 s, ... A link that drops before the
/// stability threshold counts as a failure and keeps ramping; one that
/// stayed up past it resets the schedule, so a healthy link that takes a
/// transient hit reconnects promptly.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial: Duration,
    stability_threshold: Duration,
    delay: Duration,
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::with_initial(Duration::from_secs(1), STABILITY_THRESHOLD)
    }

    pub fn with_initial(initial: Duration, stability_threshold: Duration) -> Self {
        Self {
            initial,
            stability_threshold,
            delay: initial,
        }
    }

    /// Delay before the next dial attempt; doubles for the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = self.delay.saturating_mul(2);
        delay
    }

    /// Feed back how long the last link survived. A stable session resets
    /// the schedule and reconnects immediately (`None`); a short-lived one
    /// sleeps like a failed dial.
    pub fn after_session(&mut self, lived: Duration) -> Option<Duration> {
        if lived >= self.stability_threshold {
            self.delay = self.initial;
            None
        } else {
            Some(self.next_delay())
        }
    }

    /// The delay the next failure would sleep.
    pub fn current_delay(&self) -> Duration {
        self.delay
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_double() {
        let mut policy =
            ReconnectPolicy::with_initial(Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(policy.next_delay(), Duration::from_secs(1));
        assert_eq!(policy.next_delay(), Duration::from_secs(2));
        assert_eq!(policy.next_delay(), Duration::from_secs(4));
        assert_eq!(policy.next_delay(), Duration::from_secs(8));
    }

    #[test]
    fn test_stable_session_resets() {
        let mut policy =
            ReconnectPolicy::with_initial(Duration::from_secs(1), Duration::from_secs(60));

        policy.next_delay();
        policy.next_delay();
        assert_eq!(policy.current_delay(), Duration::from_secs(4));

        // Ran past the threshold: reconnect immediately, schedule reset.
        assert_eq!(policy.after_session(Duration::from_secs(61)), None);
        assert_eq!(policy.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_short_session_keeps_ramping() {
        let mut policy =
            ReconnectPolicy::with_initial(Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(
            policy.after_session(Duration::from_secs(3)),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            policy.after_session(Duration::from_secs(3)),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            policy.after_session(Duration::from_secs(3)),
            Some(Duration::from_secs(4))
        );
    }

    #[test]
    fn test_delay_saturates() {
        let mut policy =
            ReconnectPolicy::with_initial(Duration::from_secs(u64::MAX / 2), Duration::MAX);
        policy.next_delay();
        // No overflow on the doubled value.
        assert!(policy.current_delay() >= Duration::from_secs(u64::MAX / 2));
    }
}
