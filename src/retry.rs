use std::time::Duration;

/// Bounded exponential-backoff schedule shared by the poller, the price
/// streamer, and the settlement consumer. Attempt 0 maps to the base delay;
/// growth is capped at `max_delay` and the exponent is clamped so the shift
/// cannot overflow.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { base_delay, max_delay }
    }

    /// Delay for the given consecutive-failure count, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let millis = (self.base_delay.as_millis() as u64)
            .saturating_mul(1u64 << exponent);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Delay with 0-1000ms of jitter added, for reconnect loops where
    /// thundering-herd reconnects against the same endpoint matter.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        self.delay_for(attempt) + Duration::from_millis(jitter_millis())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60))
    }
}

/// Pseudo-random jitter (0-1000ms) from the subsecond clock.
fn jitter_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_from_base() {
        let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = RetryPolicy::default();
        let plain = policy.delay_for(3);
        let jittered = policy.jittered_delay_for(3);
        assert!(jittered >= plain);
        assert!(jittered <= plain + Duration::from_millis(1000));
    }
}
