// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-run metrics and cross-run aggregation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Live counters for one run.
#[derive(Debug, Default)]
pub struct RunCounters {
    events: AtomicU64,
    tool_calls: AtomicU64,
    retries: AtomicU64,
    drift: AtomicU64,
}

impl RunCounters {
    /// Count one emitted event.
    pub fn record_event(&self) {
        self.events.fetch_add(1, Relaxed);
    }

    /// Count one gated tool call.
    pub fn record_tool_call(&self) {
        self.tool_calls.fetch_add(1, Relaxed);
    }

    /// Count one retry.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Relaxed);
    }

    /// Count one drift violation.
    pub fn record_drift(&self) {
        self.drift.fetch_add(1, Relaxed);
    }

    /// Freeze into a serializable snapshot.
    #[must_use]
    pub fn snapshot(&self, run_id: &str, outcome: &str, duration_ms: u64) -> RunMetrics {
        RunMetrics {
            run_id: run_id.to_string(),
            outcome: outcome.to_string(),
            duration_ms,
            events: self.events.load(Relaxed),
            tool_calls: self.tool_calls.load(Relaxed),
            retries: self.retries.load(Relaxed),
            drift_violations: self.drift.load(Relaxed),
        }
    }
}

/// Metrics captured for a single finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// The run.
    pub run_id: String,
    /// Terminal state name.
    pub outcome: String,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Events emitted.
    pub events: u64,
    /// Tool calls gated.
    pub tool_calls: u64,
    /// Retries granted.
    pub retries: u64,
    /// Drift violations detected.
    pub drift_violations: u64,
}

/// Aggregated statistics across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Number of runs recorded.
    pub count: usize,
    /// Mean duration in milliseconds.
    pub mean_duration_ms: f64,
    /// Total tool calls.
    pub total_tool_calls: u64,
    /// Total retries.
    pub total_retries: u64,
    /// Runs per outcome (deterministic ordering).
    pub outcome_counts: BTreeMap<String, usize>,
}

impl MetricsSummary {
    /// Aggregate a batch of run metrics.
    #[must_use]
    pub fn aggregate(runs: &[RunMetrics]) -> Self {
        if runs.is_empty() {
            return Self::default();
        }
        let mut outcome_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_duration: u64 = 0;
        let mut total_tool_calls: u64 = 0;
        let mut total_retries: u64 = 0;
        for r in runs {
            *outcome_counts.entry(r.outcome.clone()).or_default() += 1;
            total_duration += r.duration_ms;
            total_tool_calls += r.tool_calls;
            total_retries += r.retries;
        }
        Self {
            count: runs.len(),
            mean_duration_ms: total_duration as f64 / runs.len() as f64,
            total_tool_calls,
            total_retries,
            outcome_counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot() {
        let c = RunCounters::default();
        c.record_event();
        c.record_event();
        c.record_tool_call();
        c.record_retry();
        let m = c.snapshot("run_x", "completed", 1_234);
        assert_eq!(m.events, 2);
        assert_eq!(m.tool_calls, 1);
        assert_eq!(m.retries, 1);
        assert_eq!(m.drift_violations, 0);
        assert_eq!(m.outcome, "completed");
    }

    #[test]
    fn aggregate_handles_empty_and_mixed() {
        assert_eq!(MetricsSummary::aggregate(&[]).count, 0);

        let runs = vec![
            RunMetrics {
                run_id: "a".into(),
                outcome: "completed".into(),
                duration_ms: 100,
                tool_calls: 3,
                ..RunMetrics::default()
            },
            RunMetrics {
                run_id: "b".into(),
                outcome: "failed".into(),
                duration_ms: 300,
                retries: 2,
                ..RunMetrics::default()
            },
        ];
        let summary = MetricsSummary::aggregate(&runs);
        assert_eq!(summary.count, 2);
        assert!((summary.mean_duration_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(summary.total_tool_calls, 3);
        assert_eq!(summary.total_retries, 2);
        assert_eq!(summary.outcome_counts.get("completed"), Some(&1));
    }
}
