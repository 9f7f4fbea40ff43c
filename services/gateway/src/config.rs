//! Configuration types and loading.
//!
//! TOML on disk, resolved from an XDG-style default path with an optional
//! `--config` CLI override, following the same `resolve_path`/`load`
//! pattern this service has always used. Every field mirrors one of the
//! configuration keys named in the specification, with defaults matching
//! the documented ones.

use std::path::PathBuf;

use serde::Deserialize;

/// Root configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub scheduling: SchedulingConfig,
    pub refresh: RefreshConfig,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            pool: PoolConfig::default(),
            scheduling: SchedulingConfig::default(),
            refresh: RefreshConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// HTTP listener settings. The proxy and admin APIs bind separate ports,
/// matching the original separation ("admin is not exposed alongside the
/// proxy surface").
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: std::net::SocketAddr,
    pub admin_listen_addr: std::net::SocketAddr,
    pub quiet_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".parse().expect("valid default addr"),
            admin_listen_addr: "127.0.0.1:9090".parse().expect("valid default addr"),
            quiet_mode: false,
        }
    }
}

/// Where the persisted account pool lives, and which upstream endpoints
/// the router's `EndpointFallbackLoop` walks.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// `None` resolves to `CredentialStore::default_path()` at startup.
    pub path: Option<PathBuf>,
    pub sandbox_endpoint: Option<String>,
    pub autopush_endpoint: Option<String>,
    pub production_endpoint: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            path: None,
            sandbox_endpoint: None,
            autopush_endpoint: None,
            production_endpoint: "https://codeassist.googleapis.com".to_string(),
        }
    }
}

/// Account-selection and rate-limit-wait behavior.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub session_recovery: bool,
    pub auto_resume: bool,
    pub resume_text: String,
    pub scheduling_mode: String,
    pub account_selection_strategy: String,
    pub switch_on_first_rate_limit: bool,
    pub max_cache_first_wait_seconds: u64,
    /// `0` disables the cap.
    pub max_rate_limit_wait_seconds: u64,
    pub failure_ttl_seconds: u64,
    pub request_jitter_max_ms: u64,
    pub soft_quota_threshold_percent: f64,
    pub quota_refresh_interval_minutes: u64,
    pub soft_quota_cache_ttl_minutes: u64,
    pub quota_fallback: bool,
    pub cli_first: bool,
    pub pid_offset_enabled: bool,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            session_recovery: true,
            auto_resume: true,
            resume_text: "continue".to_string(),
            scheduling_mode: "cache_first".to_string(),
            account_selection_strategy: "cache_first".to_string(),
            switch_on_first_rate_limit: false,
            max_cache_first_wait_seconds: 60,
            max_rate_limit_wait_seconds: 300,
            failure_ttl_seconds: 300,
            request_jitter_max_ms: 0,
            soft_quota_threshold_percent: 100.0,
            quota_refresh_interval_minutes: 30,
            soft_quota_cache_ttl_minutes: 15,
            quota_fallback: true,
            cli_first: false,
            pid_offset_enabled: false,
        }
    }
}

/// Background proactive token refresh.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub proactive_token_refresh: bool,
    pub proactive_refresh_buffer_seconds: u64,
    pub proactive_refresh_check_interval_seconds: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            proactive_token_refresh: false,
            proactive_refresh_buffer_seconds: 300,
            proactive_refresh_check_interval_seconds: 60,
        }
    }
}

/// Empty-response and backoff tuning.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub empty_response_max_attempts: u32,
    pub empty_response_retry_delay_ms: u64,
    pub default_retry_after_seconds: u64,
    pub max_backoff_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            empty_response_max_attempts: 4,
            empty_response_retry_delay_ms: 2_000,
            default_retry_after_seconds: 60,
            max_backoff_seconds: 60,
        }
    }
}

impl Config {
    /// Resolve the config path to load: the CLI `--config` value if given,
    /// else an XDG-style default beside the account pool file.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("antigravity")
            .join("gateway.toml")
    }

    /// Load configuration from `path`. A missing file is not an error —
    /// the service runs on defaults, same as a first-run `CredentialStore`.
    pub fn load(path: &PathBuf) -> common::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(common::Error::Io)?;
        toml::from_str(&contents).map_err(|e| common::Error::Config(e.to_string()))
    }

    pub fn scheduling_mode(&self) -> router::SchedulingMode {
        match self.scheduling.scheduling_mode.as_str() {
            "round_robin" | "balance" => router::SchedulingMode::RoundRobin,
            _ => router::SchedulingMode::CacheFirst,
        }
    }

    pub fn selection_policy(&self) -> account_pool::SelectionPolicy {
        match self.scheduling.account_selection_strategy.as_str() {
            "balance" => account_pool::SelectionPolicy::Balance,
            "performance_first" => account_pool::SelectionPolicy::PerformanceFirst,
            "hybrid" => account_pool::SelectionPolicy::Hybrid,
            _ => account_pool::SelectionPolicy::CacheFirst,
        }
    }

    /// Build the router's runtime config, converting
    /// every `_seconds`/`_minutes` unit into the milliseconds the router
    /// crate works in.
    pub fn router_config(&self) -> router::RouterConfig {
        router::RouterConfig {
            scheduling_mode: self.scheduling_mode(),
            selection_policy: self.selection_policy(),
            switch_on_first_rate_limit: self.scheduling.switch_on_first_rate_limit,
            max_cache_first_wait_ms: self.scheduling.max_cache_first_wait_seconds * 1_000,
            max_rate_limit_wait_ms: self.scheduling.max_rate_limit_wait_seconds * 1_000,
            failure_ttl_ms: self.scheduling.failure_ttl_seconds * 1_000,
            request_jitter_max_ms: self.scheduling.request_jitter_max_ms,
            soft_quota_threshold_pct: self.scheduling.soft_quota_threshold_percent,
            soft_quota_cache_ttl_ms: self.scheduling.soft_quota_cache_ttl_minutes * 60_000,
            empty_response_max_attempts: self.retry.empty_response_max_attempts,
            empty_response_retry_delay_ms: self.retry.empty_response_retry_delay_ms,
            default_retry_after_ms: self.retry.default_retry_after_seconds * 1_000,
            max_backoff_ms: self.retry.max_backoff_seconds * 1_000,
            quota_fallback: self.scheduling.quota_fallback,
            cli_first: self.scheduling.cli_first,
        }
    }
}
