//! Wall-clock timestamps used by the pipeline and the counter stores.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch, with sub-second precision.
///
/// Every admission decision is evaluated against a single timestamp taken
/// when the request enters the pipeline, so all stages (and store-level
/// expiry checks) agree on what "now" is.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(f64);

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Build a timestamp from fractional epoch seconds.
    pub fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    /// Build a timestamp from a UTC datetime.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_micros() as f64 / 1_000_000.0)
    }

    /// Fractional epoch seconds.
    pub fn as_secs(&self) -> f64 {
        self.0
    }

    /// Seconds elapsed since `earlier`, never negative.
    pub fn secs_since(&self, earlier: Timestamp) -> f64 {
        (self.0 - earlier.0).max(0.0)
    }

    /// Convert to a UTC datetime (for display and administrative listings).
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let micros = (self.0 * 1_000_000.0).round() as i64;
        Utc.timestamp_micros(micros)
            .single()
            .unwrap_or_default()
    }

    /// Start of the fixed window of `window_secs` containing this instant.
    ///
    /// An instant exactly on a boundary belongs to the window it starts.
    pub fn window_floor(&self, window_secs: f64) -> Timestamp {
        Timestamp((self.0 / window_secs).floor() * window_secs)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs.as_secs_f64())
    }
}

impl Add<f64> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: f64) -> Timestamp {
        Timestamp(self.0 + rhs)
    }
}

impl Sub<f64> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: f64) -> Timestamp {
        Timestamp(self.0 - rhs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}

/// Round a wait expressed in seconds up to whole seconds for clients.
///
/// Tiny floating-point overshoot (e.g. `6.000000000000001`) is absorbed so
/// that an exact wait is not reported one second too long.
pub fn ceil_secs(secs: f64) -> u64 {
    if secs <= 0.0 {
        return 0;
    }
    (secs - 1e-9).ceil().max(0.0) as u64
}
