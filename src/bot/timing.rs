//! Inter-arrival timing analysis over a caller's recent requests.

use std::time::Duration;

use crate::config::BotDetectionConfig;
use crate::store::CounterState;
use crate::time::Timestamp;

/// Timing features of one caller's recent traffic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingAnalysis {
    pub score: u32,
    pub requests_last_second: usize,
    pub requests_last_minute: usize,
    /// Intervals shorter than the configured minimum
    pub fast_intervals: u32,
    /// Standard deviation of the intervals, when there are enough of them
    pub interval_stddev_ms: Option<f64>,
    pub regular: bool,
    pub minute_burst: bool,
    pub second_burst: bool,
}

/// TTL for a request history.
pub fn history_ttl(config: &BotDetectionConfig) -> Duration {
    Duration::from_secs(config.history_ttl_secs.max(1))
}

/// Append `now` to a stored history, dropping entries that are too old
/// and keeping at most `history_size` timestamps.
pub fn record(state: Option<&CounterState>, now: Timestamp, config: &BotDetectionConfig) -> Vec<Timestamp> {
    let horizon = config.history_ttl_secs as f64;
    let mut timestamps: Vec<Timestamp> = match state {
        Some(CounterState::RequestHistory { timestamps }) => timestamps
            .iter()
            .copied()
            .filter(|ts| now.secs_since(*ts) < horizon && *ts <= now)
            .collect(),
        _ => Vec::new(),
    };

    timestamps.push(now);

    let keep = config.history_size.max(1);
    if timestamps.len() > keep {
        timestamps.drain(..timestamps.len() - keep);
    }
    timestamps
}

/// Score a history (oldest first, ending with the current request).
pub fn analyze(timestamps: &[Timestamp], now: Timestamp, config: &BotDetectionConfig) -> TimingAnalysis {
    let mut analysis = TimingAnalysis {
        requests_last_second: timestamps.iter().filter(|ts| now.secs_since(**ts) < 1.0).count(),
        requests_last_minute: timestamps.iter().filter(|ts| now.secs_since(**ts) < 60.0).count(),
        ..TimingAnalysis::default()
    };

    let intervals: Vec<f64> = timestamps
        .windows(2)
        .map(|pair| pair[1].secs_since(pair[0]) * 1000.0)
        .collect();

    if !intervals.is_empty() && intervals.len() >= config.min_intervals {
        let stddev = std_dev(&intervals);
        analysis.interval_stddev_ms = Some(stddev);
        if stddev < config.regularity_threshold_ms {
            analysis.regular = true;
            analysis.score += config.regularity_weight;
        }
    }

    analysis.fast_intervals = intervals
        .iter()
        .filter(|interval| **interval < config.min_interval_ms)
        .count() as u32;
    analysis.score += analysis.fast_intervals.min(config.max_fast_requests) * config.fast_request_weight;

    if analysis.requests_last_minute > config.max_requests_per_minute {
        analysis.minute_burst = true;
        analysis.score += config.minute_burst_weight;
    }
    if analysis.requests_last_second > config.max_requests_per_second {
        analysis.second_burst = true;
        analysis.score += config.second_burst_weight;
    }

    analysis
}

fn std_dev(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(offset: f64) -> Timestamp {
        Timestamp::from_secs(1_700_000_000.0 + offset)
    }

    fn series(offsets: &[f64]) -> Vec<Timestamp> {
        offsets.iter().map(|o| t(*o)).collect()
    }

    #[test]
    fn test_single_request_scores_zero() {
        let config = BotDetectionConfig::default();
        let analysis = analyze(&series(&[0.0]), t(0.0), &config);
        assert_eq!(analysis.score, 0);
        assert_eq!(analysis.requests_last_second, 1);
    }

    #[test]
    fn test_irregular_human_pacing() {
        let config = BotDetectionConfig::default();
        let history = series(&[0.0, 2.3, 2.9, 7.4, 8.0]);
        let analysis = analyze(&history, t(8.0), &config);
        assert!(!analysis.regular);
        assert_eq!(analysis.fast_intervals, 0);
        assert_eq!(analysis.score, 0);
    }

    #[test]
    fn test_scripted_pacing() {
        let config = BotDetectionConfig::default();
        // 10 requests, 50 ms apart: regular, fast (capped at 5), > 5/s
        let offsets: Vec<f64> = (0..10).map(|i| i as f64 * 0.05).collect();
        let history = series(&offsets);
        let analysis = analyze(&history, t(0.45), &config);

        assert!(analysis.regular);
        assert_eq!(analysis.fast_intervals, 9);
        assert!(analysis.second_burst);
        assert!(!analysis.minute_burst);
        assert_eq!(analysis.score, 3 + 5 + 3);
    }

    #[test]
    fn test_record_trims_by_age_and_size() {
        let config = BotDetectionConfig {
            history_size: 3,
            history_ttl_secs: 10,
            ..BotDetectionConfig::default()
        };
        let state = CounterState::RequestHistory {
            timestamps: series(&[0.0, 5.0, 6.0, 7.0]),
        };

        let history = record(Some(&state), t(12.0), &config);
        assert_eq!(history, series(&[6.0, 7.0, 12.0]));

        let history = record(None, t(12.0), &config);
        assert_eq!(history, series(&[12.0]));
    }
}
