//! Limiting algorithms as pure state transitions.
//!
//! Each algorithm takes the previous [`CounterState`] (if any), the policy
//! and the request time, and returns the next state plus a [`Verdict`]. The
//! store applies the transition atomically; nothing here touches shared
//! state.

use serde::Serialize;

use crate::store::CounterState;
use crate::time::{ceil_secs, Timestamp};

use super::policy::{Algorithm, Policy};

/// Outcome of one algorithm step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    /// Limit reported to clients
    pub limit: u64,
    /// Requests still available after this one
    pub remaining: u64,
    /// Seconds until the counter is back to full capacity (or the window resets)
    pub reset_after: u64,
    /// Seconds the caller should wait; set only when denied, at least 1
    pub retry_after: Option<u64>,
}

impl Verdict {
    fn allow(limit: u64, remaining: u64, reset_after: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_after,
            retry_after: None,
        }
    }

    fn deny(limit: u64, reset_after: u64, retry_after: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_after,
            retry_after: Some(retry_after.max(1)),
        }
    }
}

/// Apply one request to `state` under `policy`.
///
/// State written by a different algorithm (after a policy change) is
/// treated as absent.
pub fn step(policy: &Policy, state: Option<&CounterState>, now: Timestamp) -> (CounterState, Verdict) {
    match policy.algorithm {
        Algorithm::TokenBucket => token_bucket(policy, state, now),
        Algorithm::SlidingWindow => sliding_window(policy, state, now),
        Algorithm::FixedWindow => fixed_window(policy, state, now),
    }
}

fn token_bucket(policy: &Policy, state: Option<&CounterState>, now: Timestamp) -> (CounterState, Verdict) {
    let max_tokens = policy.max_tokens();
    let rate = policy.refill_rate();
    let limit = policy.limit();

    let (tokens, last_refill) = match state {
        Some(CounterState::TokenBucket { tokens, last_refill }) => (*tokens, *last_refill),
        _ => (max_tokens, now),
    };

    let mut tokens = (tokens + now.secs_since(last_refill) * rate).min(max_tokens);
    let last_refill = if now > last_refill { now } else { last_refill };

    let verdict = if tokens >= 1.0 {
        tokens -= 1.0;
        Verdict::allow(
            limit,
            tokens.floor() as u64,
            ceil_secs((max_tokens - tokens) / rate),
        )
    } else {
        Verdict::deny(
            limit,
            ceil_secs((max_tokens - tokens) / rate),
            ceil_secs((1.0 - tokens) / rate),
        )
    };

    (CounterState::TokenBucket { tokens, last_refill }, verdict)
}

fn sliding_window(policy: &Policy, state: Option<&CounterState>, now: Timestamp) -> (CounterState, Verdict) {
    let window = policy.window();
    let capacity = policy.capacity;
    let current_start = now.window_floor(window);

    let (prev_count, mut curr_count, window_start) = match state {
        Some(CounterState::SlidingWindow {
            prev_count,
            curr_count,
            window_start,
        }) => {
            if *window_start == current_start || *window_start > current_start {
                (*prev_count, *curr_count, *window_start)
            } else if *window_start == current_start - window {
                (*curr_count, 0, current_start)
            } else {
                (0, 0, current_start)
            }
        }
        _ => (0, 0, current_start),
    };

    let elapsed = now.secs_since(window_start).min(window);
    let weighted = curr_count as f64 + prev_count as f64 * (1.0 - elapsed / window);
    let window_end = window_start.as_secs() + window;
    let reset_after = ceil_secs(window_end - now.as_secs());

    let verdict = if weighted < capacity as f64 {
        curr_count += 1;
        let remaining = (capacity as f64 - weighted - 1.0).max(0.0).floor() as u64;
        Verdict::allow(capacity, remaining, reset_after)
    } else {
        let c = capacity as f64;
        let curr = curr_count as f64;
        let prev = prev_count as f64;

        // Earliest moment the weighted count drops below capacity.
        let wait = if curr < c && prev > 0.0 {
            window_start.as_secs() + window * (1.0 - (c - curr) / prev) - now.as_secs()
        } else {
            (window_end - now.as_secs()) + window * (1.0 - c / curr.max(1.0)).max(0.0)
        };
        Verdict::deny(capacity, reset_after, ceil_secs(wait))
    };

    (
        CounterState::SlidingWindow {
            prev_count,
            curr_count,
            window_start,
        },
        verdict,
    )
}

fn fixed_window(policy: &Policy, state: Option<&CounterState>, now: Timestamp) -> (CounterState, Verdict) {
    let window = policy.window();
    let capacity = policy.capacity;
    let current_start = now.window_floor(window);

    let (mut count, window_start) = match state {
        Some(CounterState::FixedWindow { count, window_start }) if *window_start >= current_start => {
            (*count, *window_start)
        }
        _ => (0, current_start),
    };

    let reset_after = ceil_secs(window_start.as_secs() + window - now.as_secs());

    let verdict = if count < capacity {
        count += 1;
        Verdict::allow(capacity, capacity - count, reset_after)
    } else {
        Verdict::deny(capacity, reset_after, reset_after)
    };

    (CounterState::FixedWindow { count, window_start }, verdict)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Aligned to both 10 s and 60 s windows.
    const BASE: f64 = 1_699_999_980.0;

    fn t(offset: f64) -> Timestamp {
        Timestamp::from_secs(BASE + offset)
    }

    /// Run a sequence of requests through one policy, returning the verdicts.
    fn run(policy: &Policy, times: &[f64]) -> Vec<Verdict> {
        let mut state: Option<CounterState> = None;
        times
            .iter()
            .map(|offset| {
                let (next, verdict) = step(policy, state.as_ref(), t(*offset));
                state = Some(next);
                verdict
            })
            .collect()
    }

    #[test]
    fn test_token_bucket_drains_then_denies() {
        let policy = Policy::token_bucket(10, 60);
        let times: Vec<f64> = (0..11).map(|_| 0.0).collect();
        let verdicts = run(&policy, &times);

        for (i, verdict) in verdicts.iter().take(10).enumerate() {
            assert!(verdict.allowed);
            assert_eq!(verdict.remaining, 9 - i as u64);
        }
        let last = verdicts[10];
        assert!(!last.allowed);
        assert_eq!(last.retry_after, Some(6));
        assert_eq!(last.limit, 10);
    }

    #[test]
    fn test_token_bucket_refills_and_caps_at_burst() {
        let policy = Policy::token_bucket(2, 2).with_burst(1);
        // rate = 1 token/s, max 3 tokens
        let verdicts = run(&policy, &[0.0, 0.0, 0.0, 0.0, 100.0, 100.0, 100.0, 100.0]);
        let allowed: Vec<bool> = verdicts.iter().map(|v| v.allowed).collect();
        assert_eq!(allowed, vec![true, true, true, false, true, true, true, false]);
    }

    #[test]
    fn test_token_bucket_fraction_not_rounded_up() {
        let policy = Policy::token_bucket(1, 1).with_refill_rate(0.5);
        let verdicts = run(&policy, &[0.0, 1.0, 2.0]);
        assert!(verdicts[0].allowed);
        // only half a token after one second
        assert!(!verdicts[1].allowed);
        assert_eq!(verdicts[1].retry_after, Some(1));
        assert!(verdicts[2].allowed);
    }

    #[test]
    fn test_fixed_window_boundary() {
        let policy = Policy::fixed_window(10, 60);
        let mut times: Vec<f64> = (0..11).map(|i| 50.0 + i as f64 * 0.5).collect();
        times.extend((0..11).map(|i| 60.0 + i as f64 * 0.5));

        let verdicts = run(&policy, &times);
        let allowed = verdicts.iter().filter(|v| v.allowed).count();
        assert_eq!(allowed, 20);
        assert!(!verdicts[10].allowed);
        assert_eq!(verdicts[10].retry_after, Some(5));
        // exactly on the boundary starts the new window
        assert!(verdicts[11].allowed);
        assert_eq!(verdicts[11].remaining, 9);
        assert_eq!(verdicts[11].reset_after, 60);
    }

    #[test]
    fn test_sliding_window_sustained_rate_never_denied() {
        let policy = Policy::sliding_window(10, 10);
        let times: Vec<f64> = (0..60).map(|i| 0.25 + i as f64).collect();
        let verdicts = run(&policy, &times);
        assert!(verdicts.iter().all(|v| v.allowed));
    }

    #[test]
    fn test_sliding_window_burst_partially_denied() {
        let policy = Policy::sliding_window(10, 10);
        let times: Vec<f64> = (0..20).map(|i| 0.25 + i as f64 * 0.1).collect();
        let verdicts = run(&policy, &times);

        assert_eq!(verdicts.iter().filter(|v| v.allowed).count(), 10);
        assert!(verdicts[..10].iter().all(|v| v.allowed));
        assert!(verdicts[10..].iter().all(|v| !v.allowed));
    }

    #[test]
    fn test_sliding_window_weights_previous_window() {
        let policy = Policy::sliding_window(10, 10);
        let mut times: Vec<f64> = (0..10).map(|i| i as f64 * 0.1).collect();
        // halfway through the next window, prev counts for 5
        times.extend([15.0; 6]);

        let verdicts = run(&policy, &times);
        let next_window = &verdicts[10..];
        assert_eq!(next_window.iter().filter(|v| v.allowed).count(), 5);
        assert!(!next_window[5].allowed);
        assert_eq!(next_window[5].retry_after, Some(1));
    }

    #[test]
    fn test_sliding_window_skipped_window_resets() {
        let policy = Policy::sliding_window(2, 10);
        let verdicts = run(&policy, &[0.0, 0.0, 0.0, 35.0, 35.0]);
        let allowed: Vec<bool> = verdicts.iter().map(|v| v.allowed).collect();
        assert_eq!(allowed, vec![true, true, false, true, true]);
    }

    #[test]
    fn test_state_from_other_algorithm_is_ignored() {
        let policy = Policy::fixed_window(1, 60);
        let foreign = CounterState::TokenBucket {
            tokens: 0.0,
            last_refill: t(0.0),
        };
        let (_, verdict) = step(&policy, Some(&foreign), t(1.0));
        assert!(verdict.allowed);
    }
}
