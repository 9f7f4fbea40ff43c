//! Identity-provider constants
//!
//! Public OAuth client configuration for the upstream Code Assist identity
//! provider. These values are not secrets — they identify the public client
//! application. The actual secrets (access/refresh tokens) are managed by
//! the credential store.
//!
//! Authorization-URL construction and the one-shot code exchange are an
//! external collaborator's responsibility (the browser OAuth flow); only the
//! token-refresh endpoint is consumed by this crate.

/// Public OAuth client ID used when refreshing tokens.
pub const CLIENT_ID: &str = "681255809395-oo8ft2oprdrnp9e3aqf6avd8ed81faid.apps.googleusercontent.com";

/// Token endpoint for refresh-token exchange.
pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Safety margin subtracted from the provider's `expires_in` before treating
/// a token as expired. Keeps the account from being selected with a token
/// that will expire mid-flight.
pub const EXPIRY_SAFETY_MARGIN_SECS: u64 = 30;

/// Per-call timeout for token-refresh HTTP requests.
pub const TOKEN_REFRESH_TIMEOUT_SECS: u64 = 10;
