//! Rate-limit reason classification.
//!
//! Distinguishes the reasons a 429/5xx can carry so the caller can decide
//! whether to apply the standard rate-limit backoff path or the separate
//! capacity-exhaustion retry-on-same-endpoint path.

/// Quota exhaustion message patterns: 5-hour/rolling-window subscription-limit
/// phrasing, mapped onto the "reason" vocabulary used here.
const QUOTA_EXHAUSTED_PATTERNS: &[&str] = &[
    "5-hour",
    "5 hour",
    "rolling window",
    "usage limit for your plan",
    "subscription usage limit",
];

const RPM_PATTERNS: &[&str] = &["requests per minute", "rpm exceeded", "per-minute"];

/// Why a request was rate-limited or rejected for capacity reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitReason {
    RpmExceeded,
    QuotaExhausted,
    ModelCapacityExhausted,
    ServerError,
    Unknown,
}

impl RateLimitReason {
    /// Whether this reason is handled by the capacity-retry path (§4.7
    /// `CAPACITY`) rather than the rate-limit/cooldown path (§4.8).
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            RateLimitReason::ModelCapacityExhausted | RateLimitReason::ServerError
        )
    }
}

/// Map upstream `error.details[].reason`, message text, and HTTP status to a
/// `RateLimitReason`. Status takes priority for 503/529 (always capacity);
/// otherwise the structured reason code is trusted over message sniffing,
/// and message sniffing is the last resort.
pub fn parse_rate_limit_reason(detail_reason: Option<&str>, message: &str, status: u16) -> RateLimitReason {
    if status == 503 || status == 529 {
        return RateLimitReason::ModelCapacityExhausted;
    }

    if let Some(reason) = detail_reason {
        match reason {
            "RATE_LIMIT_EXCEEDED" | "RPM_EXCEEDED" => return RateLimitReason::RpmExceeded,
            "QUOTA_EXHAUSTED" => return RateLimitReason::QuotaExhausted,
            "MODEL_CAPACITY_EXHAUSTED" => return RateLimitReason::ModelCapacityExhausted,
            "SERVER_ERROR" => return RateLimitReason::ServerError,
            _ => {}
        }
    }

    let lower = message.to_lowercase();
    if QUOTA_EXHAUSTED_PATTERNS.iter().any(|p| lower.contains(p)) {
        return RateLimitReason::QuotaExhausted;
    }
    if RPM_PATTERNS.iter().any(|p| lower.contains(p)) {
        return RateLimitReason::RpmExceeded;
    }
    if status >= 500 {
        return RateLimitReason::ServerError;
    }

    RateLimitReason::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_503_is_always_capacity_exhausted() {
        assert_eq!(
            parse_rate_limit_reason(None, "anything", 503),
            RateLimitReason::ModelCapacityExhausted
        );
    }

    #[test]
    fn status_529_is_always_capacity_exhausted() {
        assert_eq!(
            parse_rate_limit_reason(Some("RATE_LIMIT_EXCEEDED"), "", 529),
            RateLimitReason::ModelCapacityExhausted
        );
    }

    #[test]
    fn detail_reason_rate_limit_exceeded_maps_to_rpm() {
        assert_eq!(
            parse_rate_limit_reason(Some("RATE_LIMIT_EXCEEDED"), "", 429),
            RateLimitReason::RpmExceeded
        );
    }

    #[test]
    fn detail_reason_quota_exhausted_maps_directly() {
        assert_eq!(
            parse_rate_limit_reason(Some("QUOTA_EXHAUSTED"), "", 429),
            RateLimitReason::QuotaExhausted
        );
    }

    #[test]
    fn message_sniffing_five_hour_window() {
        assert_eq!(
            parse_rate_limit_reason(None, "You've exceeded your 5-hour usage limit", 429),
            RateLimitReason::QuotaExhausted
        );
    }

    #[test]
    fn message_sniffing_is_case_insensitive() {
        assert_eq!(
            parse_rate_limit_reason(None, "5-HOUR USAGE LIMIT EXCEEDED", 429),
            RateLimitReason::QuotaExhausted
        );
    }

    #[test]
    fn unrecognized_429_is_unknown() {
        assert_eq!(
            parse_rate_limit_reason(None, "please slow down", 429),
            RateLimitReason::Unknown
        );
    }

    #[test]
    fn unstructured_5xx_without_message_hint_is_server_error() {
        assert_eq!(
            parse_rate_limit_reason(None, "internal error", 500),
            RateLimitReason::ServerError
        );
    }

    #[test]
    fn is_capacity_true_for_capacity_and_server_error() {
        assert!(RateLimitReason::ModelCapacityExhausted.is_capacity());
        assert!(RateLimitReason::ServerError.is_capacity());
        assert!(!RateLimitReason::QuotaExhausted.is_capacity());
        assert!(!RateLimitReason::RpmExceeded.is_capacity());
        assert!(!RateLimitReason::Unknown.is_capacity());
    }
}
