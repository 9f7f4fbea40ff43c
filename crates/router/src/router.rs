//! `RequestRouter`: the per-request driver.
//!
//! One call to [`RequestRouter::handle`] owns a request end to end: pick an
//! account, make sure its token is usable, walk the endpoint-fallback chain
//! for that account (the `Attempt` state machine drives this part), and on
//! a rate limit decide whether to wait, rotate accounts, or fall back to
//! the other Gemini header style. Everything here is
//! orchestration — the actual policy decisions live in `AccountManager`,
//! `RateLimitStateTable`, and `handle_decision`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use account_auth::{Account, Family, HeaderStyle, QuotaKey};
use account_pool::{AccountManager, CooldownCause, RateLimitReason, SelectionPolicy};
use dashmap::DashMap;
use rand::Rng;
use reqwest::header::HeaderMap;
use request_transform::{RequestTransformer, TransformContext};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::attempt::{handle_decision, AttemptAction, AttemptConfig, AttemptOutcome, AttemptState, CAPACITY_BASE_DELAY_MS};
use crate::classifier::{extract_retry_info, Decision, ResponseClassifier};
use crate::endpoints::EndpointFallbackLoop;
use crate::error::{Result, RouterError};

/// How a duplicate/concurrent 429 on the same (account, quota key) pair is
/// folded back into a short, bounded wait rather than the full backoff.
const DEDUP_RETRY_CAP_MS: u64 = 2_000;

/// Pause before rotating off an account on its first 429, mirroring a human
/// pausing to let a transient limit clear.
const FIRST_RATE_LIMIT_PAUSE_MS: u64 = 1_000;

/// Pause before rotating to a different account on a repeat 429
/// step 7, "SWITCH_ACCOUNT_DELAY").
const SWITCH_ACCOUNT_DELAY_MS: u64 = 5_000;

/// Which wait-vs-rotate branch governs the *first* 429 a cache-pinned
/// session sees (`scheduling_mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingMode {
    /// Prefer waiting out a short rate limit on the pinned account over
    /// rotating, up to `max_cache_first_wait_ms`.
    CacheFirst,
    /// Always prefer rotating to another account when one is free.
    RoundRobin,
}

/// Everything `RequestRouter` needs that isn't baked into the account pool
/// or endpoint list themselves — the configuration surface.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub scheduling_mode: SchedulingMode,
    pub selection_policy: SelectionPolicy,
    pub switch_on_first_rate_limit: bool,
    pub max_cache_first_wait_ms: u64,
    /// `0` means "no cap" (wait indefinitely rather than give up).
    pub max_rate_limit_wait_ms: u64,
    pub failure_ttl_ms: u64,
    pub request_jitter_max_ms: u64,
    pub soft_quota_threshold_pct: f64,
    pub soft_quota_cache_ttl_ms: u64,
    pub empty_response_max_attempts: u32,
    pub empty_response_retry_delay_ms: u64,
    pub default_retry_after_ms: u64,
    pub max_backoff_ms: u64,
    /// Gemini-only: fall back to the other header style on the same
    /// account before rotating, when no sibling account carries Antigravity
    /// quota.
    pub quota_fallback: bool,
    /// Gemini-only: prefer `gemini-cli` as the initial header style instead
    /// of `gemini-antigravity`.
    pub cli_first: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            scheduling_mode: SchedulingMode::CacheFirst,
            selection_policy: SelectionPolicy::CacheFirst,
            switch_on_first_rate_limit: false,
            max_cache_first_wait_ms: 30_000,
            max_rate_limit_wait_ms: 0,
            failure_ttl_ms: 10 * 60_000,
            request_jitter_max_ms: 0,
            soft_quota_threshold_pct: 100.0,
            soft_quota_cache_ttl_ms: 15 * 60_000,
            empty_response_max_attempts: 4,
            empty_response_retry_delay_ms: 2_000,
            default_retry_after_ms: 1_000,
            max_backoff_ms: 60_000,
            quota_fallback: true,
            cli_first: false,
        }
    }
}

/// One request to route, already parsed out of the incoming proxy call.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub family: Family,
    pub model: String,
    pub body: Value,
    pub session_id: Option<String>,
    pub streaming: bool,
}

#[derive(Debug, Clone)]
pub enum ResponseBody {
    Json(Value),
    /// A synthetic server-sent-events body (used for `Recoverable400`).
    Sse(String),
}

#[derive(Debug, Clone)]
pub struct RouterResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl RouterResponse {
    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: ResponseBody::Json(body),
        }
    }

    fn sse(body: String) -> Self {
        Self {
            status: 200,
            body: ResponseBody::Sse(body),
        }
    }
}

/// Outcome of driving one account through its endpoint-fallback chain.
enum AccountOutcome {
    Response(RouterResponse),
    RotateAccount,
    SwitchStyle(HeaderStyle),
    Fail(RouterError),
}

/// Outcome of handling one `RATE_LIMIT` decision.
enum RateLimitAction {
    RetrySameEndpoint,
    RotateAccount,
    SwitchStyle(HeaderStyle),
}

pub struct RequestRouter {
    accounts: Arc<AccountManager>,
    endpoints: Arc<EndpointFallbackLoop>,
    transformer: Arc<dyn RequestTransformer>,
    http: reqwest::Client,
    config: RouterConfig,
    token_locks: DashMap<usize, Arc<AsyncMutex<()>>>,
    notified_rate_limited: AtomicBool,
}

impl RequestRouter {
    pub fn new(
        accounts: Arc<AccountManager>,
        endpoints: Arc<EndpointFallbackLoop>,
        transformer: Arc<dyn RequestTransformer>,
        http: reqwest::Client,
        config: RouterConfig,
    ) -> Self {
        Self {
            accounts,
            endpoints,
            transformer,
            http,
            config,
            token_locks: DashMap::new(),
            notified_rate_limited: AtomicBool::new(false),
        }
    }

    /// Route one request to completion. Loops across accounts; a single
    /// account's endpoint-fallback pass is handled by `run_account`.
    pub async fn handle(&self, req: IncomingRequest) -> Result<RouterResponse> {
        let started = std::time::Instant::now();
        let result = self.handle_inner(req).await;
        metrics::histogram!("router_request_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    async fn handle_inner(&self, req: IncomingRequest) -> Result<RouterResponse> {
        let mut header_style = self.initial_style(req.family);
        let initial_pool_size = self.accounts.credential_store().len().await;

        loop {
            let now = now_ms();

            if self.accounts.credential_store().is_empty().await {
                return Err(if initial_pool_size > 0 {
                    RouterError::AllRevoked
                } else {
                    RouterError::NoAccounts
                });
            }

            if self.config.soft_quota_threshold_pct < 100.0
                && self
                    .accounts
                    .are_all_over_soft_quota(self.config.soft_quota_threshold_pct, self.config.soft_quota_cache_ttl_ms, &req.model, now)
                    .await
            {
                let wait = self
                    .accounts
                    .get_min_wait_time_for_soft_quota(self.config.soft_quota_cache_ttl_ms, &req.model, now)
                    .await
                    .unwrap_or(0);
                if self.config.max_rate_limit_wait_ms != 0 && wait > self.config.max_rate_limit_wait_ms {
                    return Err(RouterError::SoftQuotaBlocked { reset_in_ms: wait });
                }
                tokio::time::sleep(Duration::from_millis(wait.max(1))).await;
                continue;
            }

            let pool_size = self.accounts.credential_store().len().await;

            let selected = self
                .select_with_style_fallback(req.family, &req.model, header_style, now)
                .await;

            let (account, style) = match selected {
                Some(pair) => pair,
                None => {
                    let wait = self
                        .accounts
                        .get_min_wait_time_for_family(req.family, header_style, None, now)
                        .await;
                    if self.config.max_rate_limit_wait_ms != 0 && wait > self.config.max_rate_limit_wait_ms {
                        if !self.notified_rate_limited.swap(true, Ordering::Relaxed) {
                            warn!(family = ?req.family, wait_ms = wait, "every account rate limited beyond the configured wait cap");
                        }
                        return Err(RouterError::RateLimitedBeyondCap);
                    }
                    tokio::time::sleep(Duration::from_millis(wait.max(1))).await;
                    continue;
                }
            };
            header_style = style;

            let account = match self.ensure_token(account, now).await {
                TokenReadiness::Ready(a) => a,
                TokenReadiness::Removed | TokenReadiness::CooldownApplied => continue,
            };

            match self.run_account(&req, account, header_style, pool_size).await {
                AccountOutcome::Response(resp) => return Ok(resp),
                AccountOutcome::RotateAccount => continue,
                AccountOutcome::SwitchStyle(new_style) => {
                    header_style = new_style;
                    continue;
                }
                AccountOutcome::Fail(e) => return Err(e),
            }
        }
    }

    fn initial_style(&self, family: Family) -> HeaderStyle {
        match family {
            Family::Claude => HeaderStyle::Cli,
            Family::Gemini => {
                if self.config.cli_first {
                    HeaderStyle::Cli
                } else {
                    HeaderStyle::Antigravity
                }
            }
        }
    }

    /// Selection-time quota fallback: try the preferred style
    /// first; for Gemini, if nothing is available, try the other style
    /// before reporting total unavailability.
    async fn select_with_style_fallback(
        &self,
        family: Family,
        model: &str,
        header_style: HeaderStyle,
        now_ms: u64,
    ) -> Option<(Account, HeaderStyle)> {
        if let Some(a) = self
            .accounts
            .get_current_or_next(
                family,
                model,
                self.config.selection_policy,
                header_style,
                self.config.soft_quota_threshold_pct,
                self.config.soft_quota_cache_ttl_ms,
                now_ms,
            )
            .await
        {
            return Some((a, header_style));
        }

        if family == Family::Gemini && self.config.quota_fallback {
            let alt = other_style(header_style);
            if let Some(a) = self
                .accounts
                .get_current_or_next(
                    family,
                    model,
                    self.config.selection_policy,
                    alt,
                    self.config.soft_quota_threshold_pct,
                    self.config.soft_quota_cache_ttl_ms,
                    now_ms,
                )
                .await
            {
                return Some((a, alt));
            }
        }

        None
    }

    /// Ensure `account`'s access token is usable right now, refreshing it
    /// inline if not. Per-account locked so concurrent requests for the
    /// same account never race two refreshes.
    async fn ensure_token(&self, account: Account, now_ms: u64) -> TokenReadiness {
        if account.access_token.is_some() && account.expires_at > now_ms {
            return TokenReadiness::Ready(account);
        }

        let lock = self
            .token_locks
            .entry(account.index)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let fresh = self
            .accounts
            .credential_store()
            .with_state(|s| s.accounts.get(account.index).cloned())
            .await;
        let Some(fresh) = fresh else {
            return TokenReadiness::Removed;
        };
        if fresh.access_token.is_some() && fresh.expires_at > now_ms {
            return TokenReadiness::Ready(fresh);
        }

        match account_auth::refresh_token(&self.http, fresh.refresh_token.expose(), now_ms).await {
            Ok(refreshed) => {
                self.accounts
                    .credential_store()
                    .with_state_mut(|s| {
                        if let Some(a) = s.accounts.get_mut(fresh.index) {
                            a.access_token = Some(account_auth::Secret::new(refreshed.access_token.clone()));
                            a.expires_at = refreshed.expires_at;
                        }
                    })
                    .await;
                if let Err(e) = self.accounts.credential_store().flush().await {
                    warn!(account_index = fresh.index, error = %e, "failed to persist refreshed token");
                }
                let mut updated = fresh;
                updated.access_token = Some(account_auth::Secret::new(refreshed.access_token));
                updated.expires_at = refreshed.expires_at;
                TokenReadiness::Ready(updated)
            }
            Err(account_auth::Error::InvalidGrant(msg)) => {
                warn!(account_index = fresh.index, error = %msg, "refresh token rejected at dispatch time, removing account");
                self.accounts.remove_account(fresh.index).await;
                TokenReadiness::Removed
            }
            Err(e) => {
                warn!(account_index = fresh.index, error = %e, "token refresh failed at dispatch time, cooling down");
                self.accounts
                    .mark_cooling_down(fresh.index, self.config.failure_ttl_ms, CooldownCause::NetworkFailure, now_ms)
                    .await;
                TokenReadiness::CooldownApplied
            }
        }
    }

    /// Drive one account through its endpoint-fallback chain for `style`,
    /// handling capacity retries, empty-response retries, preview-404
    /// rewriting, and — on an actual rate limit — the §4.8 decision tree.
    async fn run_account(&self, req: &IncomingRequest, account: Account, style: HeaderStyle, pool_size: usize) -> AccountOutcome {
        let quota_key = QuotaKey::for_family(req.family, style);
        let endpoints = self.endpoints.endpoints_for(style);
        let endpoint_count = endpoints.len();
        if endpoint_count == 0 {
            return AccountOutcome::Fail(RouterError::NoAccounts);
        }

        let attempt_config = AttemptConfig {
            empty_response_max_attempts: self.config.empty_response_max_attempts,
            empty_response_retry_delay_ms: self.config.empty_response_retry_delay_ms,
        };

        let mut state = AttemptState::start();

        loop {
            let endpoint = endpoints[state.endpoint_index];
            let ctx = TransformContext {
                model: req.model.clone(),
                header_style: style,
                endpoint: endpoint.base_url.clone(),
                session_id: req.session_id.clone(),
            };

            self.maybe_warmup(&account, &ctx, req.session_id.as_deref()).await;

            let prepared = match self.transformer.prepare(&req.body, &account, &ctx).await {
                Ok(p) => p,
                Err(e) => return AccountOutcome::Fail(RouterError::Transform(e)),
            };

            if self.config.request_jitter_max_ms > 0 {
                let jitter = rand::rng().random_range(0..=self.config.request_jitter_max_ms);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }

            let (status, headers, mut json_body) = match self.dispatch(&endpoint.base_url, prepared, req.streaming).await {
                Ok(r) => r,
                Err(_) => (0u16, HeaderMap::new(), Value::Null),
            };

            let decision = if status == 0 {
                Decision::Server5xx
            } else {
                ResponseClassifier::classify(status, &json_body)
            };

            match decision {
                Decision::Success => {
                    self.accounts.record_success(account.index, quota_key, now_ms()).await;
                    metrics::counter!("router_requests_total", "outcome" => "success").increment(1);
                    let transformed = match self.transformer.transform_response(json_body, &ctx).await {
                        Ok(b) => b,
                        Err(e) => return AccountOutcome::Fail(RouterError::Transform(e)),
                    };
                    return AccountOutcome::Response(RouterResponse::json(status, transformed));
                }
                Decision::RateLimit => {
                    metrics::counter!("router_rate_limit_hits_total").increment(1);
                    return self
                        .handle_rate_limit(&account, req.family, style, &headers, &json_body, pool_size)
                        .await;
                }
                _ => {
                    let (next_state, action) = handle_decision(
                        state,
                        endpoint_count,
                        decision,
                        &attempt_config,
                        capacity_jitter_ms(state.capacity_retries),
                    );
                    state = next_state;
                    match action {
                        AttemptAction::RetrySameEndpoint { delay_ms } => {
                            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                            continue;
                        }
                        AttemptAction::AdvanceEndpoint => continue,
                        AttemptAction::RegenerateFingerprintAndAdvanceEndpoint => {
                            self.accounts.regenerate_fingerprint(account.index).await;
                            continue;
                        }
                        AttemptAction::ExitToRateLimitHandling => unreachable!("RateLimit handled above"),
                        AttemptAction::EscalateToAccountRotation => {
                            metrics::counter!("router_account_rotations_total", "cause" => "server_error").increment(1);
                            return AccountOutcome::RotateAccount;
                        }
                        AttemptAction::Return(AttemptOutcome::Recoverable400) => {
                            let explanation =
                                "Context is too long for this request. Please start a new conversation or shorten your message.";
                            return AccountOutcome::Response(RouterResponse::sse(crate::classifier::synthesize_recoverable_400_sse(
                                explanation,
                            )));
                        }
                        AttemptAction::Return(AttemptOutcome::HardError) => {
                            if decision == Decision::Preview403404 {
                                crate::classifier::rewrite_preview_404(&req.model, &mut json_body);
                            }
                            return AccountOutcome::Response(RouterResponse::json(status, json_body));
                        }
                        AttemptAction::Return(AttemptOutcome::Success) => unreachable!("Success handled above"),
                        AttemptAction::Fail(crate::attempt::FailReason::EmptyResponseAfterRetry) => {
                            return AccountOutcome::Fail(RouterError::EmptyResponseAfterRetry {
                                attempts: self.config.empty_response_max_attempts,
                            });
                        }
                        AttemptAction::Fail(crate::attempt::FailReason::EndpointsExhausted) => {
                            if decision == Decision::Preview403404 {
                                crate::classifier::rewrite_preview_404(&req.model, &mut json_body);
                            }
                            metrics::counter!("router_account_rotations_total", "cause" => "endpoints_exhausted").increment(1);
                            return AccountOutcome::RotateAccount;
                        }
                    }
                }
            }
        }
    }

    /// Handle one `RATE_LIMIT` decision for `account`.
    async fn handle_rate_limit(
        &self,
        account: &Account,
        family: Family,
        style: HeaderStyle,
        headers: &HeaderMap,
        body: &Value,
        pool_size: usize,
    ) -> AccountOutcome {
        // step 1: refund the hybrid-policy token this attempt consumed.
        self.accounts.refund_hybrid_token(account.index);

        // step 2/3: pull retry hints and classify the reason.
        let info = extract_retry_info(headers, body);
        let reason = account_pool::parse_rate_limit_reason(info.reason.as_deref(), info.message.as_deref().unwrap_or(""), 429);
        let quota_key = QuotaKey::for_family(family, style);
        let now = now_ms();

        let record = self.accounts.rate_limits().record(account.index, quota_key, info.retry_delay_ms, now);

        // step 4/5: mark the account gated until the larger of the server
        // hint and a reason-aware floor (quota exhaustion is treated as at
        // least a full minute; everything else trusts the computed delay).
        let floor_ms = smart_backoff_floor(reason, self.config.default_retry_after_ms);
        let reset_in_ms = info.retry_delay_ms.unwrap_or(record.delay_ms).max(floor_ms);
        self.accounts
            .mark_rate_limited(account.index, family, style, reason, now.saturating_add(reset_in_ms), self.config.failure_ttl_ms, now)
            .await;

        if record.is_duplicate {
            tokio::time::sleep(Duration::from_millis(record.delay_ms.min(DEDUP_RETRY_CAP_MS))).await;
            return AccountOutcome::RotateAccount;
        }

        // A lone account has nothing to rotate to regardless of how many
        // 429s it's seen — back off exponentially and retry the same
        // endpoint, honoring the configured wait cap so this can't spin
        // forever.
        let action = if pool_size <= 1 {
            let wait = reset_in_ms.min(self.config.max_backoff_ms);
            if self.config.max_rate_limit_wait_ms != 0 && wait > self.config.max_rate_limit_wait_ms {
                return AccountOutcome::Fail(RouterError::RateLimitedBeyondCap);
            }
            tokio::time::sleep(Duration::from_millis(wait)).await;
            RateLimitAction::RetrySameEndpoint
        } else if record.attempt == 1 && reason != RateLimitReason::QuotaExhausted {
            tokio::time::sleep(Duration::from_millis(FIRST_RATE_LIMIT_PAUSE_MS)).await;
            if matches!(self.config.scheduling_mode, SchedulingMode::CacheFirst) && reset_in_ms <= self.config.max_cache_first_wait_ms {
                let remainder = reset_in_ms.saturating_sub(FIRST_RATE_LIMIT_PAUSE_MS);
                tokio::time::sleep(Duration::from_millis(remainder)).await;
                RateLimitAction::RetrySameEndpoint
            } else if self.config.switch_on_first_rate_limit {
                self.gemini_quota_fallback_or_rotate(account.index, family, style, now).await
            } else {
                RateLimitAction::RetrySameEndpoint
            }
        } else {
            tokio::time::sleep(Duration::from_millis(SWITCH_ACCOUNT_DELAY_MS)).await;
            self.gemini_quota_fallback_or_rotate(account.index, family, style, now).await
        };

        match action {
            // Re-selecting naturally re-pins `cache_first` to the same
            // account when it's the only one free, so "retry same
            // endpoint" and "rotate" both just mean "go pick again".
            RateLimitAction::RetrySameEndpoint => AccountOutcome::RotateAccount,
            RateLimitAction::RotateAccount => AccountOutcome::RotateAccount,
            RateLimitAction::SwitchStyle(new_style) => AccountOutcome::SwitchStyle(new_style),
        }
    }

    /// Before rotating off a Gemini account on repeat rate limits,
    /// prefer switching this account to the other header style when no
    /// sibling account currently has Antigravity quota available.
    async fn gemini_quota_fallback_or_rotate(&self, account_index: usize, family: Family, style: HeaderStyle, now_ms: u64) -> RateLimitAction {
        if family == Family::Gemini && self.config.quota_fallback && style == HeaderStyle::Antigravity {
            let sibling_available = self.accounts.has_other_account_with_antigravity_available(account_index, family, now_ms).await;
            if !sibling_available {
                return RateLimitAction::SwitchStyle(HeaderStyle::Cli);
            }
        }
        RateLimitAction::RotateAccount
    }

    async fn maybe_warmup(&self, account: &Account, ctx: &TransformContext, session_id: Option<&str>) {
        if !self.transformer.needs_signed_thinking_warmup(ctx) {
            return;
        }
        if !self.endpoints.needs_warmup(session_id) {
            return;
        }
        let warmup_body = serde_json::json!({ "warmup": true });
        if let Ok(prepared) = self.transformer.prepare(&warmup_body, account, ctx).await {
            let _ = self.dispatch(&ctx.endpoint, prepared, false).await;
        }
        if let Some(sid) = session_id {
            self.endpoints.record_warmup_attempt(sid);
        }
    }

    async fn dispatch(
        &self,
        endpoint_base_url: &str,
        prepared: request_transform::PreparedRequest,
        streaming: bool,
    ) -> std::result::Result<(u16, HeaderMap, Value), reqwest::Error> {
        let suffix = if streaming { "streamGenerateContent" } else { "generateContent" };
        let url = format!("{endpoint_base_url}/v1internal:{suffix}");
        let response = self.http.post(url).headers(prepared.headers).json(&prepared.body).send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, headers, body))
    }
}

enum TokenReadiness {
    Ready(Account),
    Removed,
    CooldownApplied,
}

fn other_style(style: HeaderStyle) -> HeaderStyle {
    match style {
        HeaderStyle::Antigravity => HeaderStyle::Cli,
        HeaderStyle::Cli => HeaderStyle::Antigravity,
    }
}

/// A reason-aware floor under the server-supplied retry delay: quota
/// exhaustion (the 5-hour/rolling-window style limit) rarely clears in
/// under a minute, so don't let a missing/short server hint cause an
/// immediate retry storm.
fn smart_backoff_floor(reason: RateLimitReason, default_retry_after_ms: u64) -> u64 {
    match reason {
        RateLimitReason::QuotaExhausted => default_retry_after_ms.max(60_000),
        _ => default_retry_after_ms,
    }
}

/// ±10% jitter around the capacity-retry base delay.
fn capacity_jitter_ms(capacity_retries: u32) -> i64 {
    let base = CAPACITY_BASE_DELAY_MS.saturating_mul(1u64 << capacity_retries) as f64;
    let pct = rand::rng().random_range(-0.1..=0.1);
    (base * pct).round() as i64
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_auth::{AccountCredential, CredentialStore};
    use request_transform::PassthroughTransformer;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn router_with_account(server: &MockServer) -> (tempfile::TempDir, RequestRouter) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("accounts.json")).await.unwrap();
        store
            .merge(vec![AccountCredential {
                email: Some("a@example.com".into()),
                refresh_token: "rt-1".into(),
                access_token: "at-1".into(),
                expires_at: 9_999_999_999_999,
                project_id: None,
                managed_project_id: None,
            }])
            .await
            .unwrap();
        let manager = Arc::new(AccountManager::new(Arc::new(store), 60_000));
        let endpoints = Arc::new(EndpointFallbackLoop::new(vec![crate::endpoints::Endpoint {
            tier: crate::endpoints::EndpointTier::Production,
            base_url: server.uri(),
        }]));
        let router = RequestRouter::new(
            manager,
            endpoints,
            Arc::new(PassthroughTransformer::new()),
            reqwest::Client::new(),
            RouterConfig::default(),
        );
        (dir, router)
    }

    fn claude_request() -> IncomingRequest {
        IncomingRequest {
            family: Family::Claude,
            model: "claude-sonnet-4".into(),
            body: serde_json::json!({"messages": []}),
            session_id: None,
            streaming: false,
        }
    }

    #[tokio::test]
    async fn successful_dispatch_returns_the_transformed_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(".*generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": "hi"}]}}]
            })))
            .mount(&server)
            .await;

        let (_dir, router) = router_with_account(&server).await;
        let resp = router.handle(claude_request()).await.unwrap();
        assert_eq!(resp.status, 200);
        assert!(matches!(resp.body, ResponseBody::Json(_)));
    }

    #[tokio::test]
    async fn empty_pool_is_a_terminal_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("accounts.json")).await.unwrap();
        let manager = Arc::new(AccountManager::new(Arc::new(store), 60_000));
        let endpoints = Arc::new(EndpointFallbackLoop::new(vec![]));
        let router = RequestRouter::new(
            manager,
            endpoints,
            Arc::new(PassthroughTransformer::new()),
            reqwest::Client::new(),
            RouterConfig::default(),
        );
        let err = router.handle(claude_request()).await.unwrap_err();
        assert!(matches!(err, RouterError::NoAccounts));
    }

    #[tokio::test]
    async fn recoverable_400_is_synthesized_as_sse() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(".*generateContent"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "Prompt is too long for this model"}
            })))
            .mount(&server)
            .await;

        let (_dir, router) = router_with_account(&server).await;
        let resp = router.handle(claude_request()).await.unwrap();
        match resp.body {
            ResponseBody::Sse(text) => assert!(text.contains("data:")),
            other => panic!("expected sse body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hard_error_passes_through_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(".*generateContent"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "invalid argument"}
            })))
            .mount(&server)
            .await;

        let (_dir, router) = router_with_account(&server).await;
        let resp = router.handle(claude_request()).await.unwrap();
        assert_eq!(resp.status, 400);
    }

    #[tokio::test]
    async fn single_account_rate_limited_eventually_returns_the_cap_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(".*generateContent"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"details": [{"reason": "RATE_LIMIT_EXCEEDED"}]}
            })))
            .mount(&server)
            .await;

        let (_dir, mut router) = router_with_account(&server).await;
        router.config.max_rate_limit_wait_ms = 1;
        router.config.scheduling_mode = SchedulingMode::RoundRobin;
        router.config.switch_on_first_rate_limit = true;

        let err = router.handle(claude_request()).await.unwrap_err();
        assert!(matches!(err, RouterError::RateLimitedBeyondCap));
    }
}
