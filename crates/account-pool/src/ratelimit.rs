//! Per-`(accountIndex, quotaKey)` consecutive-429 bookkeeping.
//!
//! A concurrent map keyed by `(account index, quota key)`: each entry counts
//! consecutive rate-limit hits, deduping a 429 storm that lands within
//! `DEDUP_WINDOW` of the previous hit so concurrent selectors retrying the
//! same account don't each bump the backoff.
//!
//! This table never gates anything itself — `AccountManager` is the only
//! place `rateLimitResetTimes` is consulted for selection.

use std::time::Duration;

use account_auth::QuotaKey;
use dashmap::DashMap;

pub const DEDUP_WINDOW: Duration = Duration::from_secs(2);
pub const STATE_RESET_TTL: Duration = Duration::from_secs(120);
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy)]
struct RateLimitState {
    consecutive_429: u32,
    last_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordResult {
    pub attempt: u32,
    pub delay_ms: u64,
    pub is_duplicate: bool,
}

pub struct RateLimitStateTable {
    states: DashMap<(usize, QuotaKey), RateLimitState>,
    max_backoff_ms: u64,
}

impl RateLimitStateTable {
    pub fn new(max_backoff_ms: u64) -> Self {
        Self {
            states: DashMap::new(),
            max_backoff_ms,
        }
    }

    /// Record a 429 against `(account_index, quota_key)` at `now_ms`,
    /// optionally carrying the server's own `Retry-After`-derived delay.
    /// Returns the resulting attempt count, computed delay, and whether
    /// this call was deduped against a very recent prior hit.
    pub fn record(
        &self,
        account_index: usize,
        quota_key: QuotaKey,
        server_retry_after_ms: Option<u64>,
        now_ms: u64,
    ) -> RecordResult {
        let key = (account_index, quota_key);
        let dedup_window_ms = DEDUP_WINDOW.as_millis() as u64;
        let reset_ttl_ms = STATE_RESET_TTL.as_millis() as u64;

        let mut is_duplicate = false;
        let attempt = {
            let mut entry = self.states.entry(key).or_insert(RateLimitState {
                consecutive_429: 0,
                last_at_ms: 0,
            });

            let elapsed = now_ms.saturating_sub(entry.last_at_ms);
            if entry.consecutive_429 > 0 && elapsed < dedup_window_ms {
                is_duplicate = true;
            } else if entry.consecutive_429 > 0 && elapsed < reset_ttl_ms {
                entry.consecutive_429 += 1;
            } else {
                entry.consecutive_429 = 1;
            }
            entry.last_at_ms = now_ms;
            entry.consecutive_429
        };

        let delay_ms = self.compute_delay(attempt, server_retry_after_ms);

        RecordResult {
            attempt,
            delay_ms,
            is_duplicate,
        }
    }

    fn compute_delay(&self, attempt: u32, server_retry_after_ms: Option<u64>) -> u64 {
        let exponential = DEFAULT_BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.saturating_sub(1).min(31));
        let candidate = server_retry_after_ms.unwrap_or(1_000).max(exponential);
        candidate.clamp(DEFAULT_BACKOFF_BASE_MS, self.max_backoff_ms)
    }

    /// Drop the entry for `(account_index, quota_key)`, e.g. on a success.
    pub fn reset(&self, account_index: usize, quota_key: QuotaKey) {
        self.states.remove(&(account_index, quota_key));
    }

    /// Drop every entry for `account_index` regardless of quota key, e.g.
    /// when the account is removed from the pool.
    pub fn reset_all(&self, account_index: usize) {
        self.states.retain(|(idx, _), _| *idx != account_index);
    }
}
