//! Service-specific error types.

use thiserror::Error;

/// Gateway errors: everything the router's own terminal taxonomy
/// doesn't already cover — configuration and listener-level failures.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind listener: {0}")]
    ListenerBind(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Router(#[from] router::RouterError),
}

/// Result alias.
pub type Result<T> = std::result::Result<T, Error>;
