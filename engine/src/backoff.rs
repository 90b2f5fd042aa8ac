//! Retry delay policy.

use crate::Timestamp;

/// Exponential backoff capped at `max_delay_ms`.
///
/// The delay for the `n`th retry is `min(max_delay, base * 2^n)`. Items that
/// opted out of backoff always wait `base_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_ms,
            max_delay_ms,
        }
    }

    /// Short delays for tests and interactive tooling.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            base_ms: 10,
            max_delay_ms: 200,
        }
    }

    /// Delay in milliseconds before retry number `retry_count`.
    pub fn delay_for(&self, retry_count: u32) -> u64 {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.max_delay_ms)
    }

    /// Delay for an item, honoring its backoff flag.
    pub fn delay(&self, retry_count: u32, use_backoff: bool) -> u64 {
        if use_backoff {
            self.delay_for(retry_count)
        } else {
            self.base_ms.min(self.max_delay_ms)
        }
    }

    /// Absolute time of the next attempt.
    pub fn next_attempt_at(
        &self,
        now: Timestamp,
        retry_count: u32,
        use_backoff: bool,
    ) -> Timestamp {
        now.saturating_add(self.delay(retry_count, use_backoff))
    }
}
