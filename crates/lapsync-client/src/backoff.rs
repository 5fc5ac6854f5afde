//! Reconnect delay schedule: 500ms -> 1000ms -> 2000ms -> 4000ms -> 5000ms (capped)

use std::time::Duration;

pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

pub const MAX_BACKOFF: Duration = Duration::from_millis(5000);

/// Delay before reconnect attempt `attempt` (1-based), doubling from `initial`
pub fn delay_for_attempt(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    initial.saturating_mul(1u32 << exponent).min(max)
}
