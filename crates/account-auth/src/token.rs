//! Token refresh against the upstream identity provider.
//!
//! Only the refresh-token grant is implemented here — the authorization-code
//! exchange that completes the initial browser OAuth flow belongs to an
//! external collaborator and is out of scope for this crate.

use serde::Deserialize;

use crate::constants::{CLIENT_ID, TOKEN_ENDPOINT, TOKEN_REFRESH_TIMEOUT_SECS};
use crate::error::{Error, Result};

/// Response from the token endpoint's refresh grant.
///
/// `expires_in` is a delta in seconds from the response time; callers
/// convert it to an absolute epoch-ms timestamp when storing.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64,
}

/// Error body shape returned by OAuth2 token endpoints on failure.
#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
}

/// A freshly refreshed access token plus its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Absolute epoch ms, already reduced by `EXPIRY_SAFETY_MARGIN_SECS`.
    pub expires_at: u64,
}

/// Refresh an access token using a refresh token.
///
/// Classifies the failure mode so the caller can decide what to do:
/// - `Error::InvalidGrant` — the refresh token itself was rejected
///   (`invalid_grant`); the account must be disabled, retrying won't help.
/// - `Error::Transient` — anything else (network error, 5xx, unexpected
///   body); the caller should bump a failure counter and try again later
///   rather than give up on the account.
pub async fn refresh_token(
    client: &reqwest::Client,
    refresh_token: &str,
    now_ms: u64,
) -> Result<RefreshedToken> {
    refresh_token_at(client, TOKEN_ENDPOINT, refresh_token, now_ms).await
}

/// Same as [`refresh_token`] but against an arbitrary endpoint URL. Split
/// out so tests (in this crate and callers such as `account-pool`'s
/// `ProactiveRefreshQueue`) can point it at a mock server instead of the
/// real identity provider.
pub async fn refresh_token_at(
    client: &reqwest::Client,
    endpoint: &str,
    refresh_token: &str,
    now_ms: u64,
) -> Result<RefreshedToken> {
    let response = client
        .post(endpoint)
        .timeout(std::time::Duration::from_secs(TOKEN_REFRESH_TIMEOUT_SECS))
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", CLIENT_ID),
        ])
        .send()
        .await
        .map_err(|e| {
            metrics::counter!("token_refresh_total", "outcome" => "transient").increment(1);
            Error::Transient(format!("token refresh request failed: {e}"))
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if let Ok(parsed) = serde_json::from_str::<TokenErrorBody>(&body) {
            if parsed.error == "invalid_grant" {
                metrics::counter!("token_refresh_total", "outcome" => "invalid_grant").increment(1);
                return Err(Error::InvalidGrant(format!(
                    "refresh token rejected ({status}): {body}"
                )));
            }
        }

        metrics::counter!("token_refresh_total", "outcome" => "transient").increment(1);
        return Err(Error::Transient(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    let parsed: TokenResponse = response.json().await.map_err(|e| {
        metrics::counter!("token_refresh_total", "outcome" => "transient").increment(1);
        Error::Transient(format!("invalid refresh response: {e}"))
    })?;

    let expires_at = now_ms
        .saturating_add(parsed.expires_in.saturating_mul(1000))
        .saturating_sub(crate::constants::EXPIRY_SAFETY_MARGIN_SECS.saturating_mul(1000));

    metrics::counter!("token_refresh_total", "outcome" => "success").increment(1);
    Ok(RefreshedToken {
        access_token: parsed.access_token,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn successful_refresh_computes_expiry_minus_safety_margin() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at_new",
                "expires_in": 3600,
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let now_ms = 1_000_000_000_000u64;
        let refreshed = refresh_token_at(&client, &server.uri(), "rt_old", now_ms)
            .await
            .unwrap();

        assert_eq!(refreshed.access_token, "at_new");
        assert_eq!(refreshed.expires_at, now_ms + 3_600_000 - 30_000);
    }

    #[tokio::test]
    async fn invalid_grant_is_classified_distinctly_from_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = refresh_token_at(&client, &server.uri(), "rt_revoked", 0).await;

        assert!(matches!(result, Err(Error::InvalidGrant(_))));
    }

    #[tokio::test]
    async fn server_error_is_classified_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = refresh_token_at(&client, &server.uri(), "rt_ok", 0).await;

        assert!(matches!(result, Err(Error::Transient(_))));
    }

    #[tokio::test]
    async fn non_invalid_grant_400_is_still_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_request",
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = refresh_token_at(&client, &server.uri(), "rt_ok", 0).await;

        assert!(matches!(result, Err(Error::Transient(_))));
    }
}
