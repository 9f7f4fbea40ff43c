//! The persisted pool data model.
//!
//! `Account` carries both credential fields (refreshed in place by
//! [`crate::token`]) and the runtime bookkeeping fields that the account
//! manager mutates (cooldowns, failure counters, rate-limit reset times,
//! cached quota, fingerprint). Unlike a design that keeps runtime state in a
//! separate ephemeral map, every field here is part of `PoolState` and is
//! persisted — so a restart doesn't lose an account's cooldown or rate-limit
//! history. The two token fields are wrapped in `common::Secret` so a stray
//! `{:?}` on an `Account` (log lines, panic messages) can't leak a live
//! credential; the JSON on disk is unaffected since `Secret` serializes as
//! its bare inner value.

use std::collections::HashMap;

use common::Secret;
use serde::{Deserialize, Serialize};

/// Current schema version of the persisted pool file.
pub const POOL_STATE_VERSION: u32 = 3;

/// One of the two upstream client identities, mapping onto different
/// backend quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeaderStyle {
    Antigravity,
    Cli,
}

/// The model family a request targets. Scopes `activeIndexByFamily` and
/// the Gemini-only quota-fallback rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Claude,
    Gemini,
}

/// A compound identifier `(family, headerStyle)` scoping rate-limit state
/// independently per "lane". Three concrete lanes exist today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuotaKey {
    GeminiAntigravity,
    GeminiCli,
    Claude,
}

impl QuotaKey {
    /// Derive the quota key for a (family, headerStyle) pair.
    pub fn for_family(family: Family, style: HeaderStyle) -> Self {
        match (family, style) {
            (Family::Claude, _) => QuotaKey::Claude,
            (Family::Gemini, HeaderStyle::Antigravity) => QuotaKey::GeminiAntigravity,
            (Family::Gemini, HeaderStyle::Cli) => QuotaKey::GeminiCli,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKey::GeminiAntigravity => "gemini-antigravity",
            QuotaKey::GeminiCli => "gemini-cli",
            QuotaKey::Claude => "claude",
        }
    }
}

impl std::fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-account stable device identity, minted once and stable for the
/// account's lifetime unless explicitly regenerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub quota_user: String,
    pub device_id: String,
}

/// Last observed per-model quota snapshot for soft-quota gating.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachedQuota {
    /// model name -> percent of quota consumed (0-100)
    #[serde(default)]
    pub usage_by_model: HashMap<String, f64>,
    #[serde(default)]
    pub updated_at: u64,
}

/// One account's credential + runtime record in the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Stable ordinal within the pool. Rebuilt on removal.
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub refresh_token: Secret<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<Secret<String>>,
    /// Absolute epoch ms. Zero means "never refreshed".
    #[serde(default)]
    pub expires_at: u64,
    pub added_at: u64,
    pub last_used: u64,
    pub enabled: bool,
    /// Epoch ms while sidelined for non-quota reasons (auth/project/network).
    #[serde(default)]
    pub cooling_down_until: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// quotaKey -> earliest retry epoch ms. Entries only grow forward in
    /// time; cleared by a success on that quota-key.
    #[serde(default)]
    pub rate_limit_reset_times: HashMap<QuotaKey, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_quota: Option<CachedQuota>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

impl Account {
    /// Whether this account is available for `quota_key` right now,
    /// ignoring soft-quota gating (callers layer that on separately since it
    /// needs a threshold/TTL the account itself doesn't carry).
    pub fn is_available(&self, now_ms: u64, quota_key: QuotaKey) -> bool {
        if !self.enabled {
            return false;
        }
        if now_ms < self.cooling_down_until {
            return false;
        }
        match self.rate_limit_reset_times.get(&quota_key) {
            Some(&reset_at) => now_ms >= reset_at,
            None => true,
        }
    }

    /// Clear rate-limit and cooldown state for a successful request. Only
    /// the quota-key actually used is cleared from `rate_limit_reset_times`;
    /// cooldown is unconditionally cleared since a success means the account
    /// is healthy again.
    pub fn record_success(&mut self, quota_key: QuotaKey) {
        self.rate_limit_reset_times.remove(&quota_key);
        self.cooling_down_until = 0;
        self.consecutive_failures = 0;
    }
}

/// `{claude, gemini}` advisory pointers into the pool, used as a tie-break
/// hint by selection policies. Never authoritative for gating.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveIndexByFamily {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gemini: Option<usize>,
}

/// The persisted pool file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolState {
    pub version: u32,
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub active_index: i64,
    #[serde(default)]
    pub active_index_by_family: ActiveIndexByFamily,
}

impl Default for PoolState {
    fn default() -> Self {
        Self {
            version: POOL_STATE_VERSION,
            accounts: Vec::new(),
            active_index: -1,
            active_index_by_family: ActiveIndexByFamily::default(),
        }
    }
}

/// An already-minted OAuth credential produced by the external browser-flow
/// collaborator. `CredentialStore::merge` folds a batch of these into the
/// pool, deduping by email then by refresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCredential {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub refresh_token: String,
    pub access_token: String,
    /// Absolute epoch ms.
    pub expires_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_project_id: Option<String>,
}
