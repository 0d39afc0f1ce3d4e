//! Signals the backend does not report directly: an aggregate drift score and
//! a latency series shaped for charting.
//!
//! Everything here is a pure function of its input. Nothing fails: absent or
//! non-finite inputs degrade to zero/empty outputs so a view can always
//! render. The cost is that a missing signal can look like a healthy zero;
//! callers that need to tell the two apart must check the raw payload.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use core_types::{
    DriftRaw, DriftSummary, FeatureDriftRaw, LatencyRaw, LatencySnapshot, DRIFT_THRESHOLD,
};

/// Spacing of the synthetic latency series, in milliseconds.
pub const HISTORY_STEP_MS: f64 = 0.2;

/// Size of the backend's rolling latency window. `recent_calls` never
/// exceeds it; callers must reject larger counts before synthesizing.
pub const MAX_LATENCY_SAMPLES: u64 = 200;

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Mean `mean_deviation_ratio` over all features, 0 for an empty report.
/// A row without a usable ratio contributes 0 but still counts.
pub fn drift_score(details: &BTreeMap<String, FeatureDriftRaw>) -> f64 {
    if details.is_empty() {
        return 0.0;
    }
    let total: f64 = details
        .values()
        .map(|row| row.mean_deviation_ratio.map(finite_or_zero).unwrap_or(0.0))
        .sum();
    total / details.len() as f64
}

pub fn summarize_drift(raw: &DriftRaw) -> DriftSummary {
    DriftSummary {
        status: raw.status.clone(),
        score: drift_score(&raw.details),
        threshold: DRIFT_THRESHOLD,
        feature_count: raw.details.len(),
        drifted_features: raw
            .details
            .iter()
            .filter(|(_, row)| row.drift)
            .map(|(name, _)| name.clone())
            .collect(),
    }
}

/// Builds a latency snapshot from the two scalars the backend exposes.
///
/// This is an approximation, not a measured distribution: `history` is the
/// deterministic ramp `average + i * HISTORY_STEP_MS` of length
/// `max(recent_calls, 1)`, and `p95_ms`/`max_ms` are reported equal to the
/// average. Keep it that way until the backend ships real samples.
///
/// The history is allocated in full, so `recent_calls` must already be
/// bounded by [`MAX_LATENCY_SAMPLES`].
pub fn synthesize_latency(raw: &LatencyRaw) -> LatencySnapshot {
    let average = finite_or_zero(raw.avg_latency_ms).max(0.0);
    let len = raw.recent_calls.max(1) as usize;
    let history = (0..len)
        .map(|i| average + i as f64 * HISTORY_STEP_MS)
        .collect::<Vec<_>>();
    LatencySnapshot {
        count: raw.recent_calls,
        average_ms: average,
        p95_ms: average,
        max_ms: average,
        history,
    }
}

/// Age of an RFC 3339 timestamp relative to `now`. `None` when absent or
/// unparsable; clock skew into the future clamps to zero.
pub fn freshness_age(timestamp: Option<&str>, now: DateTime<Utc>) -> Option<Duration> {
    let parsed = DateTime::parse_from_rfc3339(timestamp?.trim()).ok()?;
    let age = now.signed_duration_since(parsed.with_timezone(&Utc));
    Some(age.max(Duration::zero()))
}
