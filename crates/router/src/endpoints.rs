//! `EndpointFallbackLoop` & warmup.
//!
//! Endpoints are an ordered, frozen list configured at startup (daily
//! sandbox → autopush → production). `gemini-cli` header style only ever
//! tries the production endpoint. Warmup state (which sessions have been
//! warmed up, and how many attempts they've used) is tracked in a bounded
//! LRU so a long-lived process doesn't leak memory over thousands of
//! sessions.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use account_auth::HeaderStyle;
use lru::LruCache;
use serde::{Deserialize, Serialize};

/// Maximum warmup attempts per session before giving up and dispatching
/// the real request unwarmed.
pub const MAX_WARMUP_ATTEMPTS: u32 = 2;

/// Bound on how many distinct session IDs' warmup state is remembered.
pub const WARMUP_CACHE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointTier {
    DailySandbox,
    Autopush,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub tier: EndpointTier,
    pub base_url: String,
}

/// Ordered endpoint list + warmup bookkeeping. One instance per process,
/// shared across all in-flight requests.
pub struct EndpointFallbackLoop {
    endpoints: Vec<Endpoint>,
    warmup_state: Mutex<LruCache<String, u32>>,
}

impl EndpointFallbackLoop {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            warmup_state: Mutex::new(LruCache::new(
                NonZeroUsize::new(WARMUP_CACHE_CAPACITY).expect("capacity is nonzero"),
            )),
        }
    }

    /// The ordered fallback list for this header style. `gemini-cli` only
    /// ever tries production; `antigravity` tries the full sandbox chain.
    pub fn endpoints_for(&self, header_style: HeaderStyle) -> Vec<&Endpoint> {
        match header_style {
            HeaderStyle::Cli => self
                .endpoints
                .iter()
                .filter(|e| e.tier == EndpointTier::Production)
                .collect(),
            HeaderStyle::Antigravity => self.endpoints.iter().collect(),
        }
    }

    /// Whether `session_id` still has a warmup attempt available. `None`
    /// session IDs (stateless/one-shot calls) are always treated as already
    /// warmed up — there's no session to cache a warmup result against.
    pub fn needs_warmup(&self, session_id: Option<&str>) -> bool {
        let Some(id) = session_id else { return false };
        let mut state = self.warmup_state.lock().expect("warmup lock poisoned");
        match state.get(id) {
            Some(&attempts) => attempts < MAX_WARMUP_ATTEMPTS,
            None => true,
        }
    }

    /// Record that a warmup attempt was made (successful or not) for
    /// `session_id`, consuming one of its two allowed attempts.
    pub fn record_warmup_attempt(&self, session_id: &str) {
        let mut state = self.warmup_state.lock().expect("warmup lock poisoned");
        let attempts = state.get(session_id).copied().unwrap_or(0);
        state.put(session_id.to_string(), attempts + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint {
                tier: EndpointTier::DailySandbox,
                base_url: "https://sandbox.example".into(),
            },
            Endpoint {
                tier: EndpointTier::Autopush,
                base_url: "https://autopush.example".into(),
            },
            Endpoint {
                tier: EndpointTier::Production,
                base_url: "https://prod.example".into(),
            },
        ]
    }

    #[test]
    fn cli_style_only_tries_production() {
        let loop_ = EndpointFallbackLoop::new(endpoints());
        let cli = loop_.endpoints_for(HeaderStyle::Cli);
        assert_eq!(cli.len(), 1);
        assert_eq!(cli[0].tier, EndpointTier::Production);
    }

    #[test]
    fn antigravity_style_tries_full_chain() {
        let loop_ = EndpointFallbackLoop::new(endpoints());
        let antigravity = loop_.endpoints_for(HeaderStyle::Antigravity);
        assert_eq!(antigravity.len(), 3);
    }

    #[test]
    fn warmup_allowed_until_two_attempts_used() {
        let loop_ = EndpointFallbackLoop::new(endpoints());
        assert!(loop_.needs_warmup(Some("sess-1")));
        loop_.record_warmup_attempt("sess-1");
        assert!(loop_.needs_warmup(Some("sess-1")));
        loop_.record_warmup_attempt("sess-1");
        assert!(!loop_.needs_warmup(Some("sess-1")));
    }

    #[test]
    fn sessionless_requests_never_need_warmup() {
        let loop_ = EndpointFallbackLoop::new(endpoints());
        assert!(!loop_.needs_warmup(None));
    }
}
