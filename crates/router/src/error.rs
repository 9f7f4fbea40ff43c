//! Error taxonomy surfaced by the router.

/// Terminal-for-the-request error categories. Everything else (transient
/// network errors, 5xx, recoverable auth failures) is absorbed internally
/// by the endpoint-fallback and account-rotation layers.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("account pool is empty")]
    NoAccounts,

    #[error("every account failed with invalid_grant; re-authentication required")]
    AllRevoked,

    #[error("all accounts rate limited beyond the configured wait cap")]
    RateLimitedBeyondCap,

    #[error("all accounts over the configured soft-quota threshold, earliest reset in {reset_in_ms}ms")]
    SoftQuotaBlocked { reset_in_ms: u64 },

    #[error("empty response from upstream after {attempts} attempts")]
    EmptyResponseAfterRetry { attempts: u32 },

    #[error("request transform failed: {0}")]
    Transform(#[from] request_transform::TransformError),

    #[error("account-pool error: {0}")]
    Pool(#[from] account_pool::Error),

    #[error("upstream request failed: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, RouterError>;
