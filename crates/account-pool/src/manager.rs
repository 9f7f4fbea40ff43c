//! `AccountManager`: the authoritative in-memory pool,
//! selection policies, rate-limit/cooldown bookkeeping, and soft-quota
//! gating.
//!
//! Modeled on a `Pool` type with round-robin select,
//! `AccountStatus` transitions, and a `health()` json dump, generalized from
//! round-robin-only to four selection policies. Round-robin
//! becomes the `balance` policy's core loop; the other three are new.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use account_auth::{Account, CachedQuota, CredentialStore, Family, HeaderStyle, QuotaKey};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::quota::RateLimitReason;
use crate::ratelimit::RateLimitStateTable;

/// The four account-selection policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Prefer the account most recently used for this (family, model).
    CacheFirst,
    /// Round-robin, preferring accounts with lowest recent activity.
    Balance,
    /// Prefer the account with the fastest observed recent latency.
    PerformanceFirst,
    /// Per-account token bucket; ties broken by health score.
    Hybrid,
}

/// A point-in-time latency observation for one account, supplied by an
/// external collaborator. The manager only consumes a score vector — it
/// does not measure latency itself.
#[derive(Debug, Clone, Copy)]
pub struct HealthSample {
    pub latency_ms: f64,
    pub sampled_at_ms: u64,
}

/// External collaborator the `performance_first` and `hybrid` policies
/// consult for a latency score. No default implementation is wired in —
/// the binary supplies one (or none, in which case those policies fall
/// back to `balance` ordering).
pub trait HealthTracker: Send + Sync {
    fn sample(&self, account_index: usize) -> Option<HealthSample>;
}

/// A `performance_first` sample older than this is treated as stale and
/// ignored (Open Question #3 in DESIGN.md — no config key names this).
const PERFORMANCE_STALENESS_MS: u64 = 30_000;

/// Why an account was sidelined for reasons other than quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownCause {
    InvalidGrant,
    ProjectDiscoveryFailure,
    NetworkFailure,
    Other,
}

impl CooldownCause {
    fn label(&self) -> &'static str {
        match self {
            CooldownCause::InvalidGrant => "invalid_grant",
            CooldownCause::ProjectDiscoveryFailure => "project_discovery_failure",
            CooldownCause::NetworkFailure => "network_failure",
            CooldownCause::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill_ms: u64,
}

/// Per-account token-bucket configuration for the `hybrid` policy.
#[derive(Debug, Clone, Copy)]
pub struct HybridBucketConfig {
    pub max_tokens: f64,
    pub regen_per_minute: f64,
}

impl Default for HybridBucketConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10.0,
            regen_per_minute: 10.0,
        }
    }
}

/// The authoritative in-memory pool + selection surface. Wraps a
/// [`CredentialStore`] (the persisted source of truth) with the ephemeral
/// bookkeeping selection policies need: cache-first pins, hybrid token
/// buckets, and a round-robin cursor. None of this ephemeral state is
/// persisted — on restart, `cache_first` simply re-learns its pin from the
/// first request, and `hybrid` buckets start full.
pub struct AccountManager {
    store: Arc<CredentialStore>,
    rate_limits: RateLimitStateTable,
    cache_first_pins: DashMap<(Family, String), usize>,
    hybrid_buckets: DashMap<usize, TokenBucket>,
    hybrid_config: HybridBucketConfig,
    round_robin_counter: AtomicUsize,
    health: Option<Arc<dyn HealthTracker>>,
}

impl AccountManager {
    pub fn new(store: Arc<CredentialStore>, max_backoff_ms: u64) -> Self {
        Self {
            store,
            rate_limits: RateLimitStateTable::new(max_backoff_ms),
            cache_first_pins: DashMap::new(),
            hybrid_buckets: DashMap::new(),
            hybrid_config: HybridBucketConfig::default(),
            round_robin_counter: AtomicUsize::new(0),
            health: None,
        }
    }

    pub fn with_health_tracker(mut self, tracker: Arc<dyn HealthTracker>) -> Self {
        self.health = Some(tracker);
        self
    }

    pub fn with_hybrid_config(mut self, config: HybridBucketConfig) -> Self {
        self.hybrid_config = config;
        self
    }

    pub fn rate_limits(&self) -> &RateLimitStateTable {
        &self.rate_limits
    }

    pub fn credential_store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Select the next available account. Returns `None` when no account is
    /// available for `(family, model, headerStyle)` right now — the caller
    /// (`RequestRouter`) decides whether to wait or fail based on
    /// `get_min_wait_time_for_family`.
    pub async fn get_current_or_next(
        &self,
        family: Family,
        model: &str,
        policy: SelectionPolicy,
        header_style: HeaderStyle,
        soft_quota_threshold_pct: f64,
        soft_quota_cache_ttl_ms: u64,
        now_ms: u64,
    ) -> Option<Account> {
        let quota_key = QuotaKey::for_family(family, header_style);
        let snapshot = self.store.with_state(|s| s.accounts.clone()).await;

        let candidates: Vec<Account> = snapshot
            .into_iter()
            .filter(|a| a.is_available(now_ms, quota_key))
            .filter(|a| {
                !Self::soft_quota_blocked(a, model, soft_quota_threshold_pct, soft_quota_cache_ttl_ms, now_ms)
            })
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let selected = match policy {
            SelectionPolicy::CacheFirst => self.select_cache_first(family, model, candidates),
            SelectionPolicy::Balance => self.select_balance(candidates),
            SelectionPolicy::PerformanceFirst => self.select_performance_first(candidates, now_ms),
            SelectionPolicy::Hybrid => self.select_hybrid(candidates, now_ms),
        };

        if let Some(account) = &selected {
            self.store
                .with_state_mut(|s| {
                    if let Some(a) = s.accounts.get_mut(account.index) {
                        a.last_used = now_ms;
                    }
                })
                .await;
        }

        selected
    }

    fn select_cache_first(&self, family: Family, model: &str, candidates: Vec<Account>) -> Option<Account> {
        let key = (family, model.to_string());
        if let Some(pinned) = self.cache_first_pins.get(&key) {
            if let Some(account) = candidates.iter().find(|a| a.index == *pinned) {
                return Some(account.clone());
            }
        }
        // No pin, or the pinned account is no longer available: pick the
        // most-recently-used available account and pin it.
        let chosen = candidates
            .into_iter()
            .max_by_key(|a| (a.last_used, std::cmp::Reverse(a.index)))?;
        self.cache_first_pins.insert(key, chosen.index);
        Some(chosen)
    }

    fn select_balance(&self, mut candidates: Vec<Account>) -> Option<Account> {
        candidates.sort_by_key(|a| (a.last_used, a.index));
        let offset = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.into_iter().nth(offset)
    }

    fn select_performance_first(&self, candidates: Vec<Account>, now_ms: u64) -> Option<Account> {
        let Some(tracker) = &self.health else {
            return self.select_balance(candidates);
        };
        let mut scored: Vec<(Account, Option<HealthSample>)> = candidates
            .into_iter()
            .map(|a| {
                let sample = tracker.sample(a.index).filter(|s| {
                    now_ms.saturating_sub(s.sampled_at_ms) <= PERFORMANCE_STALENESS_MS
                });
                (a, sample)
            })
            .collect();

        if scored.iter().all(|(_, s)| s.is_none()) {
            // No fresh sample for anyone: fall back to balance ordering.
            return self.select_balance(scored.into_iter().map(|(a, _)| a).collect());
        }

        scored.sort_by(|(a1, s1), (a2, s2)| {
            match (s1, s2) {
                (Some(x), Some(y)) => x
                    .latency_ms
                    .partial_cmp(&y.latency_ms)
                    .unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a1.index.cmp(&a2.index),
            }
        });
        scored.into_iter().next().map(|(a, _)| a)
    }

    fn select_hybrid(&self, candidates: Vec<Account>, now_ms: u64) -> Option<Account> {
        let mut with_tokens: Vec<(Account, f64)> = candidates
            .into_iter()
            .map(|a| {
                let tokens = self.refill_and_peek(a.index, now_ms);
                (a, tokens)
            })
            .filter(|(_, tokens)| *tokens >= 1.0)
            .collect();

        if with_tokens.is_empty() {
            return None;
        }

        with_tokens.sort_by(|(a1, t1), (a2, t2)| {
            let score1 = self.health.as_ref().and_then(|h| h.sample(a1.index)).map(|s| s.latency_ms);
            let score2 = self.health.as_ref().and_then(|h| h.sample(a2.index)).map(|s| s.latency_ms);
            match (score1, score2) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                _ => t2.partial_cmp(t1).unwrap_or(std::cmp::Ordering::Equal),
            }
        });

        let (chosen, _) = with_tokens.into_iter().next()?;
        self.consume_hybrid_token(chosen.index, now_ms);
        Some(chosen)
    }

    fn refill_and_peek(&self, account_index: usize, now_ms: u64) -> f64 {
        let mut bucket = self.hybrid_buckets.entry(account_index).or_insert(TokenBucket {
            tokens: self.hybrid_config.max_tokens,
            last_refill_ms: now_ms,
        });
        let elapsed_ms = now_ms.saturating_sub(bucket.last_refill_ms) as f64;
        let regen = elapsed_ms / 60_000.0 * self.hybrid_config.regen_per_minute;
        bucket.tokens = (bucket.tokens + regen).min(self.hybrid_config.max_tokens);
        bucket.last_refill_ms = now_ms;
        bucket.tokens
    }

    fn consume_hybrid_token(&self, account_index: usize, now_ms: u64) {
        self.refill_and_peek(account_index, now_ms);
        if let Some(mut bucket) = self.hybrid_buckets.get_mut(&account_index) {
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
        }
    }

    /// Refund a consumed hybrid token, e.g. on a cancelled request or a
    /// network/429 failure. A no-op for accounts not
    /// using the hybrid policy (the bucket simply accumulates unused).
    pub fn refund_hybrid_token(&self, account_index: usize) {
        if let Some(mut bucket) = self.hybrid_buckets.get_mut(&account_index) {
            bucket.tokens = (bucket.tokens + 1.0).min(self.hybrid_config.max_tokens);
        }
    }

    fn soft_quota_blocked(
        account: &Account,
        model: &str,
        threshold_pct: f64,
        cache_ttl_ms: u64,
        now_ms: u64,
    ) -> bool {
        if threshold_pct >= 100.0 {
            return false;
        }
        let Some(cq) = &account.cached_quota else {
            return false;
        };
        // Open Question #2 (DESIGN.md): a cache entry older than the TTL is
        // treated as stale/unknown, not blocking — never trust arbitrarily
        // old usage numbers to gate every account forever.
        if now_ms.saturating_sub(cq.updated_at) > cache_ttl_ms {
            return false;
        }
        match cq.usage_by_model.get(model) {
            Some(&pct) => pct >= threshold_pct,
            None => false,
        }
    }

    /// Mark `account_index` rate-limited on the quota key
    /// derived from `(family, header_style)` until `reset_at_ms`, bounded by
    /// a `failure_ttl_ms` ceiling from now. Entries only grow forward
    /// (never shrink an existing gate).
    pub async fn mark_rate_limited(
        &self,
        account_index: usize,
        family: Family,
        header_style: HeaderStyle,
        reason: RateLimitReason,
        reset_at_ms: u64,
        failure_ttl_ms: u64,
        now_ms: u64,
    ) {
        let quota_key = QuotaKey::for_family(family, header_style);
        let ceiling = now_ms.saturating_add(failure_ttl_ms);
        let capped = reset_at_ms.min(ceiling);

        self.store
            .with_state_mut(|s| {
                if let Some(a) = s.accounts.get_mut(account_index) {
                    let existing = a.rate_limit_reset_times.get(&quota_key).copied().unwrap_or(0);
                    a.rate_limit_reset_times.insert(quota_key, capped.max(existing));
                }
            })
            .await;

        metrics::counter!(
            "account_rate_limit_events_total",
            "quota_key" => quota_key.as_str(),
            "reason" => format!("{reason:?}"),
        )
        .increment(1);

        warn!(
            account_index,
            quota_key = %quota_key,
            reason = ?reason,
            reset_at_ms = capped,
            "account rate limited"
        );
    }

    /// Sideline an account for a non-quota
    /// reason (auth/project/network failure).
    pub async fn mark_cooling_down(
        &self,
        account_index: usize,
        duration_ms: u64,
        cause: CooldownCause,
        now_ms: u64,
    ) {
        let until = now_ms.saturating_add(duration_ms);
        self.store
            .with_state_mut(|s| {
                if let Some(a) = s.accounts.get_mut(account_index) {
                    a.cooling_down_until = until.max(a.cooling_down_until);
                    a.consecutive_failures += 1;
                }
            })
            .await;
        warn!(account_index, cause = cause.label(), until, "account cooling down");
    }

    /// Success path: clear rate-limit/cooldown state for
    /// `account_index` on `quota_key` and drop its rate-limit dedup entry.
    pub async fn record_success(&self, account_index: usize, quota_key: QuotaKey, now_ms: u64) {
        self.rate_limits.reset(account_index, quota_key);
        self.store
            .with_state_mut(|s| {
                if let Some(a) = s.accounts.get_mut(account_index) {
                    a.record_success(quota_key);
                    a.last_used = now_ms;
                }
            })
            .await;
    }

    /// Mint a fresh device identity after repeated
    /// capacity-looking failures on the current one.
    pub async fn regenerate_fingerprint(&self, account_index: usize) {
        self.store
            .with_state_mut(|s| {
                if let Some(a) = s.accounts.get_mut(account_index) {
                    a.fingerprint = Some(account_auth::fingerprint::regenerate(account_index));
                }
            })
            .await;
        debug!(account_index, "fingerprint regenerated");
    }

    /// Remove an account from the pool — O(n), rebuilds indices. Idempotent
    /// for an already-removed index.
    pub async fn remove_account(&self, account_index: usize) -> bool {
        let removed = self
            .store
            .remove_account(account_index)
            .await
            .unwrap_or_else(|e| {
                warn!(account_index, error = %e, "failed to persist account removal");
                false
            });
        if removed {
            self.rate_limits.reset_all(account_index);
            self.hybrid_buckets.remove(&account_index);
            self.cache_first_pins.retain(|_, v| *v != account_index);
            info!(account_index, "account removed from pool");
        }
        removed
    }

    pub async fn update_quota_cache(&self, account_index: usize, usage_by_model: HashMap<String, f64>, now_ms: u64) {
        self.store
            .with_state_mut(|s| {
                if let Some(a) = s.accounts.get_mut(account_index) {
                    a.cached_quota = Some(CachedQuota {
                        usage_by_model,
                        updated_at: now_ms,
                    });
                }
            })
            .await;
    }

    /// Whether another account currently has Antigravity quota available; only
    /// meaningful for the Gemini family; always `false` for Claude.
    pub async fn has_other_account_with_antigravity_available(
        &self,
        current_index: usize,
        family: Family,
        now_ms: u64,
    ) -> bool {
        if family != Family::Gemini {
            return false;
        }
        self.store
            .with_state(|s| {
                s.accounts
                    .iter()
                    .any(|a| a.index != current_index && a.is_available(now_ms, QuotaKey::GeminiAntigravity))
            })
            .await
    }

    /// The pool-wide minimum time
    /// until any account becomes available for `(family, headerStyle)`.
    /// `floor_ms` is returned when no account carries any gating state at
    /// all (an unusual case — normally the caller only calls this after
    /// `get_current_or_next` returned `None`).
    pub async fn get_min_wait_time_for_family(
        &self,
        family: Family,
        header_style: HeaderStyle,
        floor_ms: Option<u64>,
        now_ms: u64,
    ) -> u64 {
        let quota_key = QuotaKey::for_family(family, header_style);
        let min_wait = self
            .store
            .with_state(|s| {
                s.accounts
                    .iter()
                    .filter(|a| a.enabled)
                    .map(|a| {
                        let reset = a.rate_limit_reset_times.get(&quota_key).copied().unwrap_or(0);
                        let gate = reset.max(a.cooling_down_until);
                        gate.saturating_sub(now_ms)
                    })
                    .min()
            })
            .await;
        min_wait.unwrap_or_else(|| floor_ms.unwrap_or(0))
    }

    /// Whether every enabled account is over its soft-quota threshold.
    pub async fn are_all_over_soft_quota(&self, threshold_pct: f64, cache_ttl_ms: u64, model: &str, now_ms: u64) -> bool {
        if threshold_pct >= 100.0 {
            return false;
        }
        self.store
            .with_state(|s| {
                let enabled: Vec<&Account> = s.accounts.iter().filter(|a| a.enabled).collect();
                if enabled.is_empty() {
                    return false;
                }
                enabled
                    .iter()
                    .all(|a| Self::soft_quota_blocked(a, model, threshold_pct, cache_ttl_ms, now_ms))
            })
            .await
    }

    /// The pool-wide minimum time until a soft-quota cache entry goes stale. Resolves the same ambiguity
    /// as Open Question #2: the wait is "until the cached entry goes
    /// stale", since staleness is what lifts the soft-quota gate.
    pub async fn get_min_wait_time_for_soft_quota(&self, cache_ttl_ms: u64, model: &str, now_ms: u64) -> Option<u64> {
        self.store
            .with_state(|s| {
                s.accounts
                    .iter()
                    .filter(|a| a.enabled)
                    .filter_map(|a| a.cached_quota.as_ref())
                    .filter(|cq| cq.usage_by_model.contains_key(model))
                    .map(|cq| cache_ttl_ms.saturating_sub(now_ms.saturating_sub(cq.updated_at)))
                    .min()
            })
            .await
    }

    /// Pool health summary for the gateway's `/health` endpoint.
    pub async fn health(&self, now_ms: u64) -> serde_json::Value {
        self.store
            .with_state(|s| {
                let mut accounts = Vec::with_capacity(s.accounts.len());
                let mut available = 0usize;
                let mut cooling = 0usize;
                let mut disabled = 0usize;

                for a in &s.accounts {
                    if !a.enabled {
                        disabled += 1;
                        accounts.push(serde_json::json!({ "index": a.index, "status": "disabled" }));
                        continue;
                    }
                    if now_ms < a.cooling_down_until {
                        cooling += 1;
                        accounts.push(serde_json::json!({
                            "index": a.index,
                            "status": "cooling_down",
                            "cooldown_remaining_ms": a.cooling_down_until - now_ms
                        }));
                        continue;
                    }
                    available += 1;
                    accounts.push(serde_json::json!({ "index": a.index, "status": "available" }));
                }

                let total = s.accounts.len();
                let status = if total == 0 {
                    "unhealthy"
                } else if available == total {
                    "healthy"
                } else if available > 0 {
                    "degraded"
                } else {
                    "unhealthy"
                };

                serde_json::json!({
                    "status": status,
                    "accounts_total": total,
                    "accounts_available": available,
                    "accounts_cooling_down": cooling,
                    "accounts_disabled": disabled,
                    "accounts": accounts,
                })
            })
            .await
    }
}
