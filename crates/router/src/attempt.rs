//! The per-endpoint `Attempt` state machine (the inner
//! endpoint-fallback loop, re-architected per §9's design note: "model as
//! an explicit `Attempt` state machine with enumerated next-states
//! (`RetrySameEndpoint | NextEndpoint | RotateAccount | Sleep(ms) |
//! Terminal`). Each branch returns the next state; the driver runs in a
//! flat loop."
//!
//! Shaped like a pure `handle_event`: a function from `(state, event)` to
//! `(state, action)`, with all I/O (dispatch, sleep, fingerprint regen)
//! performed by the caller. Jitter is passed in rather than generated here
//! so the function stays deterministic and unit-testable.

use crate::classifier::Decision;

pub const CAPACITY_MAX_ATTEMPTS: u32 = 3;
pub const CAPACITY_BASE_DELAY_MS: u64 = 1_000;

/// Where we are within one account's pass over the endpoint list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptState {
    pub endpoint_index: usize,
    pub capacity_retries: u32,
    pub empty_retries: u32,
}

impl AttemptState {
    pub fn start() -> Self {
        Self {
            endpoint_index: 0,
            capacity_retries: 0,
            empty_retries: 0,
        }
    }

    fn advanced(self) -> Self {
        Self {
            endpoint_index: self.endpoint_index + 1,
            capacity_retries: 0,
            empty_retries: 0,
        }
    }
}

/// The final shape of a classified response that should be returned (or
/// otherwise propagated) to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Recoverable400,
    HardError,
}

/// Why this account's pass over the endpoint list is giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    EmptyResponseAfterRetry,
    EndpointsExhausted,
}

/// What the driver should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptAction {
    RetrySameEndpoint { delay_ms: u64 },
    AdvanceEndpoint,
    RegenerateFingerprintAndAdvanceEndpoint,
    ExitToRateLimitHandling,
    EscalateToAccountRotation,
    Return(AttemptOutcome),
    Fail(FailReason),
}

#[derive(Debug, Clone, Copy)]
pub struct AttemptConfig {
    pub empty_response_max_attempts: u32,
    pub empty_response_retry_delay_ms: u64,
}

/// Pure transition function. `capacity_jitter_ms` is the caller-supplied
/// ±10% jitter for the current capacity-retry delay (
/// "~1s ± 10%, then ~2s, then ~4s").
pub fn handle_decision(
    state: AttemptState,
    endpoint_count: usize,
    decision: Decision,
    config: &AttemptConfig,
    capacity_jitter_ms: i64,
) -> (AttemptState, AttemptAction) {
    match decision {
        Decision::Success => (state, AttemptAction::Return(AttemptOutcome::Success)),

        Decision::RateLimit => (state, AttemptAction::ExitToRateLimitHandling),

        Decision::Capacity => {
            if state.capacity_retries < CAPACITY_MAX_ATTEMPTS {
                let next = AttemptState {
                    capacity_retries: state.capacity_retries + 1,
                    ..state
                };
                let base = CAPACITY_BASE_DELAY_MS.saturating_mul(1u64 << state.capacity_retries);
                let delay_ms = (base as i64 + capacity_jitter_ms).max(0) as u64;
                (next, AttemptAction::RetrySameEndpoint { delay_ms })
            } else if state.endpoint_index + 1 < endpoint_count {
                (state.advanced(), AttemptAction::RegenerateFingerprintAndAdvanceEndpoint)
            } else {
                (state, AttemptAction::Fail(FailReason::EndpointsExhausted))
            }
        }

        Decision::Recoverable400 => (state, AttemptAction::Return(AttemptOutcome::Recoverable400)),

        Decision::EmptyOk => {
            if state.empty_retries + 1 < config.empty_response_max_attempts {
                let next = AttemptState {
                    empty_retries: state.empty_retries + 1,
                    ..state
                };
                (
                    next,
                    AttemptAction::RetrySameEndpoint {
                        delay_ms: config.empty_response_retry_delay_ms,
                    },
                )
            } else {
                (state, AttemptAction::Fail(FailReason::EmptyResponseAfterRetry))
            }
        }

        Decision::Preview403404 => {
            if state.endpoint_index + 1 < endpoint_count {
                (state.advanced(), AttemptAction::AdvanceEndpoint)
            } else {
                (state, AttemptAction::Fail(FailReason::EndpointsExhausted))
            }
        }

        Decision::Server5xx => {
            if state.endpoint_index + 1 < endpoint_count {
                (state.advanced(), AttemptAction::AdvanceEndpoint)
            } else {
                (state, AttemptAction::EscalateToAccountRotation)
            }
        }

        Decision::HardError => (state, AttemptAction::Return(AttemptOutcome::HardError)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AttemptConfig {
        AttemptConfig {
            empty_response_max_attempts: 4,
            empty_response_retry_delay_ms: 2_000,
        }
    }

    #[test]
    fn success_returns_immediately() {
        let (_, action) = handle_decision(AttemptState::start(), 3, Decision::Success, &config(), 0);
        assert_eq!(action, AttemptAction::Return(AttemptOutcome::Success));
    }

    #[test]
    fn capacity_retries_same_endpoint_with_exponential_delay_then_advances() {
        let mut state = AttemptState::start();
        let (next, action) = handle_decision(state, 3, Decision::Capacity, &config(), 0);
        assert_eq!(action, AttemptAction::RetrySameEndpoint { delay_ms: 1_000 });
        state = next;

        let (next, action) = handle_decision(state, 3, Decision::Capacity, &config(), 0);
        assert_eq!(action, AttemptAction::RetrySameEndpoint { delay_ms: 2_000 });
        state = next;

        let (next, action) = handle_decision(state, 3, Decision::Capacity, &config(), 0);
        assert_eq!(action, AttemptAction::RetrySameEndpoint { delay_ms: 4_000 });
        state = next;

        // fourth capacity failure: exhausted same-endpoint retries, regen + advance
        let (next, action) = handle_decision(state, 3, Decision::Capacity, &config(), 0);
        assert_eq!(action, AttemptAction::RegenerateFingerprintAndAdvanceEndpoint);
        assert_eq!(next.endpoint_index, 1);
        assert_eq!(next.capacity_retries, 0);
    }

    #[test]
    fn capacity_jitter_is_applied_to_the_delay() {
        let (_, action) = handle_decision(AttemptState::start(), 3, Decision::Capacity, &config(), 100);
        assert_eq!(action, AttemptAction::RetrySameEndpoint { delay_ms: 1_100 });
    }

    #[test]
    fn capacity_on_last_endpoint_fails_with_endpoints_exhausted() {
        let state = AttemptState {
            endpoint_index: 2,
            capacity_retries: CAPACITY_MAX_ATTEMPTS,
            empty_retries: 0,
        };
        let (_, action) = handle_decision(state, 3, Decision::Capacity, &config(), 0);
        assert_eq!(action, AttemptAction::Fail(FailReason::EndpointsExhausted));
    }

    #[test]
    fn empty_ok_retries_up_to_the_configured_cap() {
        let mut state = AttemptState::start();
        for _ in 0..3 {
            let (next, action) = handle_decision(state, 3, Decision::EmptyOk, &config(), 0);
            assert_eq!(action, AttemptAction::RetrySameEndpoint { delay_ms: 2_000 });
            state = next;
        }
        let (_, action) = handle_decision(state, 3, Decision::EmptyOk, &config(), 0);
        assert_eq!(action, AttemptAction::Fail(FailReason::EmptyResponseAfterRetry));
    }

    #[test]
    fn preview_404_advances_endpoint() {
        let (next, action) = handle_decision(AttemptState::start(), 3, Decision::Preview403404, &config(), 0);
        assert_eq!(action, AttemptAction::AdvanceEndpoint);
        assert_eq!(next.endpoint_index, 1);
    }

    #[test]
    fn server_5xx_escalates_to_rotation_on_last_endpoint() {
        let state = AttemptState {
            endpoint_index: 2,
            capacity_retries: 0,
            empty_retries: 0,
        };
        let (_, action) = handle_decision(state, 3, Decision::Server5xx, &config(), 0);
        assert_eq!(action, AttemptAction::EscalateToAccountRotation);
    }

    #[test]
    fn rate_limit_exits_to_handling_without_consuming_an_endpoint() {
        let (next, action) = handle_decision(AttemptState::start(), 3, Decision::RateLimit, &config(), 0);
        assert_eq!(action, AttemptAction::ExitToRateLimitHandling);
        assert_eq!(next.endpoint_index, 0);
    }

    #[test]
    fn hard_error_returns_as_is() {
        let (_, action) = handle_decision(AttemptState::start(), 3, Decision::HardError, &config(), 0);
        assert_eq!(action, AttemptAction::Return(AttemptOutcome::HardError));
    }
}
