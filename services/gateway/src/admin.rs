//! Admin API for account pool management.
//!
//! Runs on a separate listener port (default 9090), not exposed alongside
//! the proxy surface. The OAuth browser flow and code exchange are out of
//! scope for this core — accounts arrive here already minted as
//! `AccountCredential` records and are folded into the pool via `merge`.
//!
//! Endpoints:
//! - GET    /admin/accounts        — list accounts with status (no secrets)
//! - POST   /admin/accounts        — merge externally-minted credentials into the pool
//! - DELETE /admin/accounts/{index} — remove an account from the pool
//! - GET    /admin/pool            — pool status summary

use std::sync::Arc;

use account_auth::AccountCredential;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    accounts: Arc<account_pool::AccountManager>,
}

impl AdminState {
    pub fn new(accounts: Arc<account_pool::AccountManager>) -> Self {
        Self { accounts }
    }
}

/// Build the admin axum router with all account management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts).post(merge_accounts))
        .route("/admin/accounts/{index}", delete(delete_account))
        .route("/admin/pool", get(pool_status))
        .with_state(state)
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// GET /admin/accounts — list all accounts with their pool status. Never
/// exposes tokens: the `health()` summary already redacts them down to
/// index/status.
async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    let health = state.accounts.health(now_ms()).await;
    let accounts = health.get("accounts").cloned().unwrap_or(serde_json::json!([]));

    (
        StatusCode::OK,
        axum::Json(serde_json::json!({ "accounts": accounts })),
    )
}

/// POST /admin/accounts — merge a batch of externally-minted credentials
/// into the pool, deduping by email then refresh token.
async fn merge_accounts(
    State(state): State<AdminState>,
    axum::Json(credentials): axum::Json<Vec<AccountCredential>>,
) -> impl IntoResponse {
    match state.accounts.credential_store().merge(credentials).await {
        Ok(added) => {
            info!(added, "accounts merged into pool");
            (
                StatusCode::OK,
                axum::Json(serde_json::json!({ "added": added })),
            )
        }
        Err(e) => {
            warn!(error = %e, "failed to merge accounts");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({ "error": format!("failed to merge accounts: {e}") })),
            )
        }
    }
}

/// DELETE /admin/accounts/{index} — remove an account from the pool.
/// Idempotent: removing an already-removed index succeeds.
async fn delete_account(State(state): State<AdminState>, Path(index): Path<usize>) -> impl IntoResponse {
    let removed = state.accounts.remove_account(index).await;
    info!(index, removed, "account removal requested");

    (
        StatusCode::OK,
        axum::Json(serde_json::json!({ "index": index, "removed": removed })),
    )
}

/// GET /admin/pool — pool status summary (same shape as the health
/// endpoint's pool object).
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    let health = state.accounts.health(now_ms()).await;
    (StatusCode::OK, axum::Json(health))
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_auth::CredentialStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> (tempfile::TempDir, AdminState) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(dir.path().join("accounts.json")).await.unwrap();
        let manager = Arc::new(account_pool::AccountManager::new(Arc::new(store), 60_000));
        (dir, AdminState::new(manager))
    }

    fn credential(refresh_token: &str) -> AccountCredential {
        AccountCredential {
            email: Some(format!("{refresh_token}@example.com")),
            refresh_token: refresh_token.to_string(),
            access_token: format!("at_{refresh_token}"),
            expires_at: u64::MAX,
            project_id: None,
            managed_project_id: None,
        }
    }

    #[tokio::test]
    async fn list_accounts_empty_pool() {
        let (_dir, state) = test_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(Request::builder().uri("/admin/accounts").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["accounts"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn merge_then_list_reflects_new_account() {
        let (_dir, state) = test_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/accounts")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::json!([credential("rt-1")]).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["added"], 1);
    }

    #[tokio::test]
    async fn delete_account_removes_from_pool() {
        let (_dir, state) = test_state().await;
        state
            .accounts
            .credential_store()
            .merge(vec![credential("rt-1")])
            .await
            .unwrap();
        assert_eq!(state.accounts.credential_store().len().await, 1);

        let app = build_admin_router(state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/admin/accounts/0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.accounts.credential_store().len().await, 0);
    }

    #[tokio::test]
    async fn delete_nonexistent_account_is_idempotent() {
        let (_dir, state) = test_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/admin/accounts/0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["removed"], false);
    }

    #[tokio::test]
    async fn pool_status_reports_unhealthy_when_empty() {
        let (_dir, state) = test_state().await;
        let app = build_admin_router(state);

        let response = app
            .oneshot(Request::builder().uri("/admin/pool").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["accounts_total"], 0);
    }
}
