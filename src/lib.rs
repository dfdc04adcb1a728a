//! Gatekeeper - Request Admission Control
//!
//! This crate decides, per inbound request, whether to allow, throttle,
//! challenge or reject it. A whitelist/blacklist check, a multi-algorithm
//! rate limiter (token bucket, sliding window, fixed window) and a
//! behavioral bot scorer run in a fixed order over a shared counter store,
//! which can live in process, in Redis or in SQLite.

pub mod admin;
pub mod admission;
pub mod bot;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
pub mod time;

pub use admin::{Administration, CallerStats};
pub use admission::{Admission, AdmissionRequest, Decision, DenyReason, Pipeline};
pub use config::GatekeeperConfig;
pub use error::{GatekeeperError, Result};
pub use time::Timestamp;
