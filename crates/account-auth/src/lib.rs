//! Account credential storage and identity-provider token refresh.
//!
//! Provides the persisted account/pool data model, atomic coalesced-write
//! credential storage, token refresh against the upstream identity
//! provider, and per-account device fingerprint minting. This crate is a
//! standalone library with no dependency on any binary — it can be tested
//! and used independently.
//!
//! Credential flow:
//! 1. An external collaborator completes the browser OAuth flow and
//!    produces an [`account::AccountCredential`].
//! 2. [`store::CredentialStore::merge`] folds it into the persisted pool,
//!    deduping by email then by refresh token.
//! 3. [`token::refresh_token`] is called proactively (background ticker)
//!    and reactively (request time, when near expiry).
//! 4. [`fingerprint::mint`] assigns each account a stable device identity
//!    on first use; [`fingerprint::regenerate`] replaces it after repeated
//!    capacity-looking failures.

pub mod account;
pub mod constants;
pub mod error;
pub mod fingerprint;
pub mod store;
pub mod token;

pub use account::{
    Account, AccountCredential, ActiveIndexByFamily, CachedQuota, Family, Fingerprint,
    HeaderStyle, PoolState, QuotaKey, POOL_STATE_VERSION,
};
pub use common::Secret;
pub use error::{Error, Result};
pub use store::{CredentialStore, DEFAULT_FLUSH_INTERVAL};
pub use token::{refresh_token, refresh_token_at, RefreshedToken, TokenResponse};
