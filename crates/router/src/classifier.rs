//! `ResponseClassifier`: turns a raw upstream response into a
//! routing [`Decision`], plus the extraction helpers the rate-limit
//! algorithm and error surfaces need.

use std::sync::OnceLock;

use account_pool::{parse_rate_limit_reason, RateLimitReason};
use regex::Regex;
use reqwest::header::HeaderMap;
use serde_json::Value;

/// What the router should do next with a dispatched response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Success,
    RateLimit,
    Capacity,
    Recoverable400,
    EmptyOk,
    Preview403404,
    Server5xx,
    HardError,
}

/// Everything `extractRetryInfo` can pull out of a rate-limited response.
#[derive(Debug, Clone, Default)]
pub struct RetryInfo {
    pub retry_delay_ms: Option<u64>,
    pub message: Option<String>,
    pub reason: Option<String>,
}

pub struct ResponseClassifier;

impl ResponseClassifier {
    /// Classify one upstream response. `model` is consulted only for the
    /// preview-404 rewrite hint test; classification itself is status +
    /// body driven.
    pub fn classify(status: u16, body: &Value) -> Decision {
        match status {
            200 => {
                if is_empty_response(body) {
                    Decision::EmptyOk
                } else {
                    Decision::Success
                }
            }
            429 => {
                let info = extract_retry_info(&HeaderMap::new(), body);
                let reason = parse_rate_limit_reason(info.reason.as_deref(), info.message.as_deref().unwrap_or(""), status);
                if reason.is_capacity() {
                    Decision::Capacity
                } else {
                    Decision::RateLimit
                }
            }
            503 | 529 => Decision::Capacity,
            400 => {
                let message = body.pointer("/error/message").and_then(|v| v.as_str()).unwrap_or("");
                if message.contains("Prompt is too long") || message.contains("prompt_too_long") {
                    Decision::Recoverable400
                } else {
                    Decision::HardError
                }
            }
            403 | 404 => Decision::Preview403404,
            s if s >= 500 => Decision::Server5xx,
            _ => Decision::HardError,
        }
    }

    /// Classify a 429's rate-limit reason, consulting headers too (the
    /// status-only [`Self::classify`] can't see `Retry-After-Ms`).
    pub fn rate_limit_reason(headers: &HeaderMap, body: &Value, status: u16) -> RateLimitReason {
        let info = extract_retry_info(headers, body);
        parse_rate_limit_reason(info.reason.as_deref(), info.message.as_deref().unwrap_or(""), status)
    }
}

/// §4.9 `extractRetryInfo`: `Retry-After-Ms` header, then `Retry-After`,
/// then `error.details[].retryDelay` (Go duration), then
/// `metadata.quotaResetDelay`, then a `"reset after <duration>"` message
/// phrase.
pub fn extract_retry_info(headers: &HeaderMap, body: &Value) -> RetryInfo {
    let mut retry_delay_ms = headers
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    if retry_delay_ms.is_none() {
        retry_delay_ms = headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(|secs| secs.saturating_mul(1000));
    }

    let message = body
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let mut reason = None;
    if let Some(details) = body.pointer("/error/details").and_then(|v| v.as_array()) {
        for detail in details {
            if reason.is_none() {
                reason = detail.get("reason").and_then(|v| v.as_str()).map(str::to_string);
            }
            if retry_delay_ms.is_none() {
                let type_field = detail.get("@type").and_then(|v| v.as_str()).unwrap_or("");
                if type_field.contains("RetryInfo") {
                    if let Some(delay) = detail.get("retryDelay").and_then(|v| v.as_str()) {
                        retry_delay_ms = parse_go_duration(delay);
                    }
                }
            }
        }
    }

    if retry_delay_ms.is_none() {
        if let Some(delay) = body.pointer("/metadata/quotaResetDelay").and_then(|v| v.as_str()) {
            retry_delay_ms = parse_go_duration(delay);
        }
    }

    if retry_delay_ms.is_none() {
        if let Some(msg) = &message {
            if let Some(idx) = msg.to_lowercase().find("reset after ") {
                retry_delay_ms = parse_go_duration(&msg[idx + "reset after ".len()..]);
            }
        }
    }

    RetryInfo {
        retry_delay_ms,
        message,
        reason,
    }
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)(ms|h|m|s)").expect("static duration regex is valid"))
}

/// Parse a Go-style duration string ("1h16m0.667s", "200ms") into whole
/// milliseconds. Returns `None` if no recognizable duration token is found.
pub fn parse_go_duration(s: &str) -> Option<u64> {
    let mut total_ms = 0.0f64;
    let mut matched = false;
    for cap in duration_regex().captures_iter(s) {
        matched = true;
        let value: f64 = cap[1].parse().ok()?;
        let unit_ms = match &cap[2] {
            "h" => value * 3_600_000.0,
            "m" => value * 60_000.0,
            "s" => value * 1_000.0,
            "ms" => value,
            _ => return None,
        };
        total_ms += unit_ms;
    }
    matched.then(|| total_ms.round() as u64)
}

/// Format milliseconds back into a Go-style duration string, the inverse of
/// [`parse_go_duration`] for the round-trip law.
pub fn format_go_duration(mut ms: u64) -> String {
    let hours = ms / 3_600_000;
    ms %= 3_600_000;
    let minutes = ms / 60_000;
    ms %= 60_000;
    let seconds = ms / 1_000;
    ms %= 1_000;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if ms > 0 {
        out.push_str(&format!("{}.{:03}s", seconds, ms));
    } else {
        out.push_str(&format!("{seconds}s"));
    }
    out
}

/// §4.9 empty-body detection: a 200 OK with no `candidates[]`, an empty
/// `candidates[0].content.parts[]`, or no text/functionCall in any part.
fn is_empty_response(body: &Value) -> bool {
    let Some(candidates) = body.get("candidates").and_then(|v| v.as_array()) else {
        return true;
    };
    if candidates.is_empty() {
        return true;
    }
    let Some(parts) = candidates[0].pointer("/content/parts").and_then(|v| v.as_array()) else {
        return true;
    };
    if parts.is_empty() {
        return true;
    }
    !parts
        .iter()
        .any(|p| p.get("text").is_some() || p.get("functionCall").is_some())
}

fn model_needs_preview_hint(model: &str) -> bool {
    let lower = model.to_lowercase();
    lower.contains("antigravity") || lower.contains("opus") || lower.contains("claude")
}

/// §4.9: rewrite a preview-access 404 for a gated model name to include a
/// "request preview access" hint, in place.
pub fn rewrite_preview_404(model: &str, body: &mut Value) {
    if !model_needs_preview_hint(model) {
        return;
    }
    if let Some(message) = body.pointer("/error/message").and_then(|v| v.as_str()) {
        let hint = format!("{message} (request preview access at https://developers.google.com/gemini-code-assist/docs/early-access)");
        if let Some(slot) = body.pointer_mut("/error/message") {
            *slot = Value::String(hint);
        }
    }
}

/// §4.9: synthesize the 200 SSE body returned for `RECOVERABLE_400` so the
/// session isn't left locked on a hard 400.
pub fn synthesize_recoverable_400_sse(explanation: &str) -> String {
    let payload = serde_json::json!({
        "type": "message_delta",
        "delta": { "stop_reason": "end_turn" },
        "text": explanation,
    });
    format!("data: {payload}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_go_duration() {
        assert_eq!(parse_go_duration("1h16m0.667s"), Some(3_600_000 + 16 * 60_000 + 667));
    }

    #[test]
    fn parses_milliseconds_only() {
        assert_eq!(parse_go_duration("200ms"), Some(200));
    }

    #[test]
    fn format_and_parse_round_trip() {
        for ms in [0u64, 200, 1_500, 61_000, 3_661_000] {
            let formatted = format_go_duration(ms);
            assert_eq!(parse_go_duration(&formatted), Some(ms), "round-trip failed for {ms}ms -> {formatted}");
        }
    }

    #[test]
    fn classify_200_with_text_is_success() {
        let body = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "hi"}]}}]
        });
        assert_eq!(ResponseClassifier::classify(200, &body), Decision::Success);
    }

    #[test]
    fn classify_200_with_no_candidates_is_empty_ok() {
        let body = serde_json::json!({"candidates": []});
        assert_eq!(ResponseClassifier::classify(200, &body), Decision::EmptyOk);
    }

    #[test]
    fn classify_200_with_empty_parts_is_empty_ok() {
        let body = serde_json::json!({"candidates": [{"content": {"parts": []}}]});
        assert_eq!(ResponseClassifier::classify(200, &body), Decision::EmptyOk);
    }

    #[test]
    fn classify_429_with_rpm_reason_is_rate_limit() {
        let body = serde_json::json!({
            "error": {"details": [{"reason": "RATE_LIMIT_EXCEEDED"}]}
        });
        assert_eq!(ResponseClassifier::classify(429, &body), Decision::RateLimit);
    }

    #[test]
    fn classify_429_with_capacity_reason_is_capacity() {
        let body = serde_json::json!({
            "error": {"details": [{"reason": "MODEL_CAPACITY_EXHAUSTED"}]}
        });
        assert_eq!(ResponseClassifier::classify(429, &body), Decision::Capacity);
    }

    #[test]
    fn classify_503_is_always_capacity() {
        assert_eq!(ResponseClassifier::classify(503, &serde_json::json!({})), Decision::Capacity);
    }

    #[test]
    fn classify_400_prompt_too_long_is_recoverable() {
        let body = serde_json::json!({"error": {"message": "Prompt is too long for the model"}});
        assert_eq!(ResponseClassifier::classify(400, &body), Decision::Recoverable400);
    }

    #[test]
    fn classify_400_other_is_hard_error() {
        let body = serde_json::json!({"error": {"message": "invalid argument"}});
        assert_eq!(ResponseClassifier::classify(400, &body), Decision::HardError);
    }

    #[test]
    fn classify_404_is_preview() {
        assert_eq!(ResponseClassifier::classify(404, &serde_json::json!({})), Decision::Preview403404);
    }

    #[test]
    fn classify_500_is_server_5xx() {
        assert_eq!(ResponseClassifier::classify(500, &serde_json::json!({})), Decision::Server5xx);
    }

    #[test]
    fn extract_retry_info_prefers_retry_after_ms_header() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after-ms", "1500".parse().unwrap());
        let info = extract_retry_info(&headers, &serde_json::json!({}));
        assert_eq!(info.retry_delay_ms, Some(1500));
    }

    #[test]
    fn extract_retry_info_falls_back_to_retry_delay_detail() {
        let body = serde_json::json!({
            "error": {
                "details": [{"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "30s"}]
            }
        });
        let info = extract_retry_info(&HeaderMap::new(), &body);
        assert_eq!(info.retry_delay_ms, Some(30_000));
    }

    #[test]
    fn extract_retry_info_sniffs_reset_after_message() {
        let body = serde_json::json!({"error": {"message": "quota exhausted, reset after 1m30s"}});
        let info = extract_retry_info(&HeaderMap::new(), &body);
        assert_eq!(info.retry_delay_ms, Some(90_000));
    }

    #[test]
    fn rewrite_preview_404_adds_hint_for_gated_models() {
        let mut body = serde_json::json!({"error": {"message": "not found"}});
        rewrite_preview_404("claude-opus-4", &mut body);
        let message = body["error"]["message"].as_str().unwrap();
        assert!(message.contains("preview access"));
    }

    #[test]
    fn rewrite_preview_404_leaves_other_models_untouched() {
        let mut body = serde_json::json!({"error": {"message": "not found"}});
        rewrite_preview_404("gemini-1.5-flash", &mut body);
        assert_eq!(body["error"]["message"], "not found");
    }
}
