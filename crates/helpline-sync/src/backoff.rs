//! Retry backoff for the offline queue.

use std::time::Duration;

/// Base delay applied after the first failure.
const BASE_DELAY_MS: u64 = 1_000;
/// Ceiling for the exponential schedule.
const MAX_DELAY_MS: u64 = 60_000;

/// Delay before the next attempt after `retry_count` failures:
/// `min(2^retry_count * 1s, 60s)`.
pub fn retry_delay(retry_count: u32) -> Duration {
    let shift = retry_count.min(20);
    let multiplier = 1_u64 << shift;
    Duration::from_millis(BASE_DELAY_MS.saturating_mul(multiplier).min(MAX_DELAY_MS))
}
