//! Application-wide constants for the gateway client.
//!
//! This module centralizes magic numbers so timing behavior is
//! discoverable in one place. Values that callers may need to vary
//! per deployment live in [`crate::config::Config`] instead; the
//! constants here are their defaults plus fixed internals.

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Bound on a single WebSocket dial attempt.
///
/// Keeps the session loop responsive while a connect attempt is in
/// flight: commands submitted during the dial are rejected promptly
/// once the loop resumes instead of waiting out a hung TCP handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-request deadline in milliseconds.
///
/// Bounds memory growth from abandoned runs: nothing else reclaims a
/// pending request whose run the gateway never terminates. Five minutes
/// accommodates long agent runs while still reclaiming leaked entries.
/// A configured value of 0 disables the deadline entirely.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 300_000;

// ============================================================================
// Intervals
// ============================================================================

/// Default WebSocket keepalive ping interval in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;

/// How often the session loop sweeps pending requests for expired
/// deadlines. Also serves as the shutdown-flag poll interval, so
/// `disconnect()` takes effect within about a second.
pub const REQUEST_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Reconnection
// ============================================================================

/// Default first reconnect delay in milliseconds.
pub const DEFAULT_RECONNECT_INITIAL_DELAY_MS: u64 = 1_000;

/// Default reconnect delay cap in milliseconds.
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Default multiplier applied to the reconnect delay after each failure.
pub const DEFAULT_RECONNECT_MULTIPLIER: u64 = 2;

// ============================================================================
// Channels
// ============================================================================

/// Broadcast buffer for client events.
///
/// Slow subscribers that fall more than this many events behind start
/// missing events (deltas are at-most-once, never retried).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_defaults_are_ordered() {
        // Initial delay must start below the cap for backoff to make sense
        assert!(DEFAULT_RECONNECT_INITIAL_DELAY_MS < DEFAULT_RECONNECT_MAX_DELAY_MS);
        assert!(DEFAULT_RECONNECT_MULTIPLIER > 1);
    }

    #[test]
    fn test_sweep_is_finer_than_heartbeat() {
        assert!(REQUEST_SWEEP_INTERVAL < Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS));
    }

    #[test]
    fn test_timeout_values_are_reasonable() {
        // Dial timeout should be between 5-60 seconds
        assert!(CONNECT_TIMEOUT >= Duration::from_secs(5));
        assert!(CONNECT_TIMEOUT <= Duration::from_secs(60));

        // Request deadline should exceed the heartbeat interval
        assert!(DEFAULT_REQUEST_TIMEOUT_MS > DEFAULT_HEARTBEAT_INTERVAL_MS);
    }
}
