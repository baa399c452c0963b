use std::time::Duration;

const RESYNC_RETRY_BASE_MS: u64 = 500;
const RESYNC_RETRY_MAX_MS: u64 = 10_000;

/// Delay before the next reconnect attempt after `consecutive_failures` failures.
pub fn resync_backoff(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(6);
    let factor = 1u64 << exponent;
    Duration::from_millis((RESYNC_RETRY_BASE_MS * factor).min(RESYNC_RETRY_MAX_MS))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResyncRetryState {
    consecutive_failures: u32,
}

impl ResyncRetryState {
    pub const fn new() -> Self {
        Self {
            consecutive_failures: 0,
        }
    }

    pub fn mark_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        resync_backoff(self.consecutive_failures)
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ResyncRetryState, resync_backoff};

    #[test]
    fn backoff_doubles_from_half_a_second_and_caps_at_ten() {
        let delays: Vec<u64> = (1..=8).map(|n| resync_backoff(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 8_000, 10_000, 10_000, 10_000]);
    }

    #[test]
    fn success_resets_the_streak() {
        let mut retry = ResyncRetryState::new();
        retry.mark_failure();
        assert_eq!(retry.mark_failure(), Duration::from_millis(1_000));
        retry.reset();
        assert_eq!(retry.consecutive_failures(), 0);
        assert_eq!(retry.mark_failure(), Duration::from_millis(500));
    }
}
