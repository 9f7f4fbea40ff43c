//! Proactive background token refresh.
//!
//! A single periodic task checks every enabled account and refreshes any
//! token whose expiry is within `buffer_ms`, so the request path almost
//! never pays refresh latency inline. Goes through the same `AccountManager`
//! removal path a request-time `invalid_grant` failure would use, rather
//! than mutating the credential store directly.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tracing::{debug, info, warn};

use crate::manager::AccountManager;

/// A background queue that proactively refreshes expiring tokens. At most
/// one refresh is ever in flight per account — a slow upstream call on one
/// account never blocks the cycle from checking the others, but it also
/// never starts a second concurrent refresh for that same account.
pub struct ProactiveRefreshQueue {
    manager: Arc<AccountManager>,
    client: reqwest::Client,
    buffer_ms: u64,
    in_flight: DashSet<usize>,
    refresh_endpoint: Option<String>,
}

impl ProactiveRefreshQueue {
    pub fn new(manager: Arc<AccountManager>, client: reqwest::Client, buffer_ms: u64) -> Self {
        Self {
            manager,
            client,
            buffer_ms,
            in_flight: DashSet::new(),
            refresh_endpoint: None,
        }
    }

    /// Point refreshes at an arbitrary endpoint instead of the identity
    /// provider's real token endpoint. Used by tests to target a mock
    /// server so `refresh_one`'s success/`invalid_grant` branches can be
    /// driven end to end without a live network call.
    pub fn with_refresh_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.refresh_endpoint = Some(endpoint.into());
        self
    }

    /// Spawn the periodic task. Idempotent to call once; the returned
    /// handle should be left running or aborted by the caller on shutdown.
    pub fn spawn(self: Arc<Self>, check_interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            // Skip the immediate first tick — tokens were just loaded from disk.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_cycle().await;
            }
        })
    }

    /// Run one refresh cycle. Exposed directly for tests that don't want to
    /// wait on a real ticker.
    pub async fn run_cycle(&self) {
        let now_ms = now_millis();
        let store = self.manager.credential_store();

        let candidates = store
            .with_state(|s| {
                s.accounts
                    .iter()
                    .filter(|a| a.enabled)
                    .filter(|a| a.expires_at.saturating_sub(now_ms) <= self.buffer_ms)
                    .map(|a| (a.index, a.refresh_token.expose().clone()))
                    .collect::<Vec<_>>()
            })
            .await;

        for (index, refresh_token) in candidates {
            if !self.in_flight.insert(index) {
                // Already being refreshed by a prior cycle that hasn't returned.
                continue;
            }
            self.refresh_one(index, &refresh_token, now_ms).await;
            self.in_flight.remove(&index);
        }
    }

    async fn refresh_one(&self, index: usize, refresh_token: &str, now_ms: u64) {
        debug!(account_index = index, "token expiring within buffer, refreshing proactively");

        let result = match &self.refresh_endpoint {
            Some(endpoint) => account_auth::refresh_token_at(&self.client, endpoint, refresh_token, now_ms).await,
            None => account_auth::refresh_token(&self.client, refresh_token, now_ms).await,
        };
        match result {
            Ok(refreshed) => {
                self.manager
                    .credential_store()
                    .with_state_mut(|s| {
                        if let Some(a) = s.accounts.get_mut(index) {
                            a.access_token = Some(common::Secret::new(refreshed.access_token));
                            a.expires_at = refreshed.expires_at;
                        }
                    })
                    .await;
                if let Err(e) = self.manager.credential_store().flush().await {
                    warn!(account_index = index, error = %e, "failed to persist refreshed token");
                }
                info!(account_index = index, "proactive token refresh succeeded");
            }
            Err(account_auth::Error::InvalidGrant(msg)) => {
                warn!(account_index = index, error = %msg, "refresh token rejected, removing account");
                self.manager.remove_account(index).await;
            }
            Err(e) => {
                warn!(account_index = index, error = %e, "proactive refresh failed (transient), will retry next cycle");
            }
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
