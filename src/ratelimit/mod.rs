//! Rate limiting: policies, scope keys, algorithms and the limiter.

pub mod algorithm;
mod limiter;
pub mod policy;
pub mod scope;

pub use algorithm::Verdict;
pub use limiter::{RateLimiter, RateOutcome};
pub use policy::{
    Algorithm, EndpointPolicy, Policy, PolicySet, PolicySource, PolicyStore, ResolvedPolicy,
    ScopePolicy,
};
pub use scope::{ScopeKey, ScopeType, ANONYMOUS};
