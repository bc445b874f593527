//! Exponential backoff schedule for gateway reconnection.

use std::time::Duration;

use crate::config::Config;

/// Reconnect delay schedule: starts at the initial delay and multiplies
/// after every failed attempt, capped at the maximum.
///
/// A successful handshake resets the schedule, so a connection that drops
/// after being healthy retries quickly again.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial_ms: u64,
    max_ms: u64,
    multiplier: u64,
    current_ms: u64,
}

impl ReconnectBackoff {
    /// Create a schedule. A multiplier below 2 still grows the delay to
    /// avoid a zero-interval reconnect storm; a cap below the initial
    /// delay is raised to it. Both adjustments are logged.
    pub fn new(initial_ms: u64, max_ms: u64, multiplier: u64) -> Self {
        if multiplier < 2 {
            log::warn!(
                "[Gateway] Reconnect multiplier {} is below 2, using 2",
                multiplier
            );
        }
        if max_ms < initial_ms {
            log::warn!(
                "[Gateway] Reconnect delay cap {}ms is below the initial delay, using {}ms",
                max_ms,
                initial_ms
            );
        }
        Self {
            initial_ms,
            max_ms: max_ms.max(initial_ms),
            multiplier: multiplier.max(2),
            current_ms: initial_ms,
        }
    }

    /// Build the schedule from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.reconnect_initial_delay_ms,
            config.reconnect_max_delay_ms,
            config.reconnect_multiplier,
        )
    }

    /// The delay to sleep before the next attempt. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        self.current_ms = self
            .current_ms
            .saturating_mul(self.multiplier)
            .min(self.max_ms);
        Duration::from_millis(delay)
    }

    /// Reset to the initial delay after a successful handshake.
    pub fn reset(&mut self) {
        self.current_ms = self.initial_ms;
    }

    /// The delay the next call to [`next_delay`](Self::next_delay) returns.
    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_up_to_cap() {
        let mut backoff = ReconnectBackoff::new(1000, 30_000, 2);
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(4000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(8000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(16_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(30_000));
        // Stays at the cap
        assert_eq!(backoff.next_delay(), Duration::from_millis(30_000));
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff = ReconnectBackoff::new(1000, 30_000, 2);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_millis(4000));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_degenerate_multiplier_still_grows() {
        let mut backoff = ReconnectBackoff::new(100, 400, 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_cap_below_initial_is_lifted() {
        let mut backoff = ReconnectBackoff::new(5000, 1000, 2);
        assert_eq!(backoff.next_delay(), Duration::from_millis(5000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(5000));
    }
}
