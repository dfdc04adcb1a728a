//! Per-request admission control.
//!
//! A request passes the list guard, the rate limiter and the bot scorer in
//! that order. Any stage may end it with a deny or a challenge; a request
//! that passes every stage is allowed.

mod decision;
pub mod lists;
mod metrics;
mod pipeline;

pub use decision::{Admission, ChallengeKind, Decision, DenyReason, Stage};
pub use lists::{ListGuard, ListStatus};
pub use metrics::{AdmissionMetrics, MetricsSnapshot};
pub use pipeline::{
    client_ip, request_fingerprint, AdmissionRequest, Pipeline, CONTENTION_RETRY_AFTER, UNKNOWN_IP,
};
