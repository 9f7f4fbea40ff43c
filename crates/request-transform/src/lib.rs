//! The `RequestTransformer` external interface.
//!
//! Model-family-specific body rewriting (thinking-block handling, tool-schema
//! flattening, SSE transformation) lives outside this crate entirely — it is
//! an external collaborator's responsibility. This crate only defines the
//! seam the router calls through: given a request body, the selected
//! account, and dispatch context, produce headers + a (possibly rewritten)
//! body; given an upstream response body, optionally rewrite it before it
//! reaches the caller.
//!
//! Kept dyn-compatible (`Arc<dyn RequestTransformer>`) via `Pin<Box<dyn
//! Future>>` return types, since async fn in traits isn't dyn-compatible on
//! its own.

pub mod passthrough;

pub use passthrough::PassthroughTransformer;

use std::future::Future;
use std::pin::Pin;

use account_auth::{Account, HeaderStyle};

/// Dispatch-time context the transformer needs but does not own.
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub model: String,
    pub header_style: HeaderStyle,
    pub endpoint: String,
    pub session_id: Option<String>,
}

/// The body + headers to actually send upstream.
#[derive(Debug)]
pub struct PreparedRequest {
    pub body: serde_json::Value,
    pub headers: reqwest::header::HeaderMap,
}

/// Errors from transform operations.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error("invalid response body: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, TransformError>;

/// Prepare body & headers given model + account; transform the response.
///
/// The router calls `needs_signed_thinking_warmup` to decide whether a
/// session needs a warmup precursor request before the first real
/// dispatch to a given endpoint.
pub trait RequestTransformer: Send + Sync {
    fn id(&self) -> &str;

    /// Whether `ctx.model` requires a signed-thinking warmup precursor
    /// request before the first real dispatch in a session.
    fn needs_signed_thinking_warmup(&self, ctx: &TransformContext) -> bool;

    /// Build the outgoing body and headers for one dispatch attempt.
    fn prepare<'a>(
        &'a self,
        body: &'a serde_json::Value,
        account: &'a Account,
        ctx: &'a TransformContext,
    ) -> Pin<Box<dyn Future<Output = Result<PreparedRequest>> + Send + 'a>>;

    /// Rewrite an upstream response body before it reaches the caller.
    /// Most transformers are identity here; family-specific rewriting
    /// (thinking blocks, tool schemas) happens in the external collaborator
    /// this trait is a seam for.
    fn transform_response<'a>(
        &'a self,
        body: serde_json::Value,
        ctx: &'a TransformContext,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + 'a>>;
}
