//! The request router: the component sitting between the locally-exposed
//! proxy surface and the upstream Code Assist API.
//!
//! Ties together `account_pool::AccountManager` (which account, which
//! quota lane), `request_transform::RequestTransformer` (what to send),
//! `EndpointFallbackLoop` (where to send it), the `Attempt` state machine
//! (how far to push one account before giving up), and
//! `ResponseClassifier` (what the response means) into the single
//! `RequestRouter::handle` entrypoint the gateway's proxy handler calls.

pub mod attempt;
pub mod classifier;
pub mod endpoints;
pub mod error;
pub mod router;

pub use attempt::{AttemptAction, AttemptConfig, AttemptOutcome, AttemptState, FailReason};
pub use classifier::{extract_retry_info, format_go_duration, parse_go_duration, Decision, ResponseClassifier, RetryInfo};
pub use endpoints::{Endpoint, EndpointFallbackLoop, EndpointTier};
pub use error::{Result, RouterError};
pub use router::{IncomingRequest, RequestRouter, ResponseBody, RouterConfig, RouterResponse, SchedulingMode};
