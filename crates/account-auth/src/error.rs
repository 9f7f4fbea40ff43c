//! Error types for account authentication operations

/// Errors from account authentication operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Refresh failed for a reason that may clear up on its own (network
    /// blip, 5xx, timeout). Caller should increment the failure counter and
    /// retry later rather than drop the account.
    #[error("token refresh failed transiently: {0}")]
    Transient(String),

    /// The identity provider rejected the refresh token itself
    /// (`invalid_grant`). The account's refresh token is dead; the caller
    /// must disable the account rather than retry.
    #[error("refresh token invalid: {0}")]
    InvalidGrant(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Result alias for account-auth operations.
pub type Result<T> = std::result::Result<T, Error>;
