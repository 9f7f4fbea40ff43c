//! The crate's one concrete default transformer: no model-family rewriting,
//! just the auth header + envelope-body shape every dispatch needs.
//!
//! Protects `Authorization` from being overwritten by any caller-supplied
//! header.

use std::future::Future;
use std::pin::Pin;

use account_auth::{Account, HeaderStyle};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tracing::warn;

use crate::{PreparedRequest, RequestTransformer, Result, TransformContext};

/// One "style set" of client-identity headers. Antigravity and CLI present
/// different values for the same three headers.
struct ClientIdentityHeaders {
    user_agent: &'static str,
    api_client: &'static str,
    client_metadata: &'static str,
}

fn identity_headers(style: HeaderStyle) -> ClientIdentityHeaders {
    match style {
        HeaderStyle::Antigravity => ClientIdentityHeaders {
            user_agent: "antigravity/1.0",
            api_client: "gl-node/antigravity",
            client_metadata: "ideType=antigravity",
        },
        HeaderStyle::Cli => ClientIdentityHeaders {
            user_agent: "gemini-cli/1.0",
            api_client: "gl-node/gemini-cli",
            client_metadata: "ideType=cli",
        },
    }
}

/// Passthrough request transformer — no body rewriting, just the bearer
/// token, style-dependent identity headers, and the `{project, model,
/// request, sessionId?}` envelope every dispatch needs.
pub struct PassthroughTransformer;

impl PassthroughTransformer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PassthroughTransformer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTransformer for PassthroughTransformer {
    fn id(&self) -> &str {
        "passthrough"
    }

    fn needs_signed_thinking_warmup(&self, _ctx: &TransformContext) -> bool {
        false
    }

    fn prepare<'a>(
        &'a self,
        body: &'a serde_json::Value,
        account: &'a Account,
        ctx: &'a TransformContext,
    ) -> Pin<Box<dyn Future<Output = Result<PreparedRequest>> + Send + 'a>> {
        Box::pin(async move {
            let mut headers = HeaderMap::new();
            if let Some(access_token) = &account.access_token {
                match HeaderValue::from_str(&format!("Bearer {}", access_token.expose())) {
                    Ok(value) => {
                        headers.insert(AUTHORIZATION, value);
                    }
                    Err(e) => warn!(error = %e, "access token not a valid header value"),
                }
            }
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

            let identity = identity_headers(ctx.header_style);
            headers.insert("user-agent", HeaderValue::from_static(identity.user_agent));
            headers.insert(
                "x-goog-api-client",
                HeaderValue::from_static(identity.api_client),
            );
            headers.insert(
                "client-metadata",
                HeaderValue::from_static(identity.client_metadata),
            );

            let mut envelope = serde_json::json!({
                "project": account.project_id,
                "model": ctx.model,
                "request": body,
            });
            if let Some(session_id) = &ctx.session_id {
                envelope["sessionId"] = serde_json::Value::String(session_id.clone());
            }

            Ok(PreparedRequest {
                body: envelope,
                headers,
            })
        })
    }

    fn transform_response<'a>(
        &'a self,
        body: serde_json::Value,
        _ctx: &'a TransformContext,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'a>> {
        Box::pin(async move { Ok(body) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_account() -> Account {
        Account {
            index: 0,
            email: None,
            refresh_token: account_auth::Secret::new("rt".into()),
            project_id: Some("proj-123".into()),
            managed_project_id: None,
            access_token: Some(account_auth::Secret::new("at_abc".into())),
            expires_at: 9_999_999_999_999,
            added_at: 0,
            last_used: 0,
            enabled: true,
            cooling_down_until: 0,
            consecutive_failures: 0,
            rate_limit_reset_times: HashMap::new(),
            cached_quota: None,
            fingerprint: None,
        }
    }

    fn test_ctx(style: HeaderStyle) -> TransformContext {
        TransformContext {
            model: "gemini-pro".into(),
            header_style: style,
            endpoint: "https://example.test".into(),
            session_id: None,
        }
    }

    #[tokio::test]
    async fn injects_bearer_token_from_account() {
        let transformer = PassthroughTransformer::new();
        let account = test_account();
        let ctx = test_ctx(HeaderStyle::Antigravity);

        let prepared = transformer
            .prepare(&serde_json::json!({"messages": []}), &account, &ctx)
            .await
            .unwrap();

        assert_eq!(
            prepared.headers.get(AUTHORIZATION).unwrap(),
            "Bearer at_abc"
        );
    }

    #[tokio::test]
    async fn antigravity_and_cli_styles_use_distinct_identity_headers() {
        let transformer = PassthroughTransformer::new();
        let account = test_account();

        let antigravity = transformer
            .prepare(
                &serde_json::json!({}),
                &account,
                &test_ctx(HeaderStyle::Antigravity),
            )
            .await
            .unwrap();
        let cli = transformer
            .prepare(&serde_json::json!({}), &account, &test_ctx(HeaderStyle::Cli))
            .await
            .unwrap();

        assert_ne!(
            antigravity.headers.get("user-agent"),
            cli.headers.get("user-agent")
        );
        assert_ne!(
            antigravity.headers.get("client-metadata"),
            cli.headers.get("client-metadata")
        );
    }

    #[tokio::test]
    async fn envelope_carries_project_model_and_request() {
        let transformer = PassthroughTransformer::new();
        let account = test_account();
        let ctx = test_ctx(HeaderStyle::Cli);

        let prepared = transformer
            .prepare(&serde_json::json!({"prompt": "hi"}), &account, &ctx)
            .await
            .unwrap();

        assert_eq!(prepared.body["project"], "proj-123");
        assert_eq!(prepared.body["model"], "gemini-pro");
        assert_eq!(prepared.body["request"]["prompt"], "hi");
        assert!(prepared.body.get("sessionId").is_none());
    }

    #[tokio::test]
    async fn session_id_included_when_present() {
        let transformer = PassthroughTransformer::new();
        let account = test_account();
        let mut ctx = test_ctx(HeaderStyle::Cli);
        ctx.session_id = Some("sess-1".into());

        let prepared = transformer
            .prepare(&serde_json::json!({}), &account, &ctx)
            .await
            .unwrap();

        assert_eq!(prepared.body["sessionId"], "sess-1");
    }

    #[tokio::test]
    async fn transform_response_is_identity() {
        let transformer = PassthroughTransformer::new();
        let ctx = test_ctx(HeaderStyle::Cli);
        let body = serde_json::json!({"candidates": []});

        let transformed = transformer.transform_response(body.clone(), &ctx).await.unwrap();
        assert_eq!(transformed, body);
    }

    #[test]
    fn needs_signed_thinking_warmup_is_false_for_passthrough() {
        let transformer = PassthroughTransformer::new();
        assert!(!transformer.needs_signed_thinking_warmup(&test_ctx(HeaderStyle::Cli)));
    }
}
