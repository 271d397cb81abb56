// SPDX-License-Identifier: MIT OR Apache-2.0
//! rcp-cost
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Cost accounting with budget gating.
//!
//! Every cost entry is checked against the run, day, and month caps before
//! anything mutates; the projection and the commit happen inside one
//! critical section so a burst of parallel runs cannot overshoot a
//! workspace budget. Amounts are integer cents throughout.

/// Pre-run cost estimation.
pub mod estimate;

pub use estimate::{CostEstimate, EstimateInput, RateCard};

use chrono::{DateTime, Utc};
use rcp_core::CostBreakdown;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Warning fires at this fraction of any cap unless configured otherwise.
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.8;

/// What a cost entry paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostKind {
    /// Sandbox compute time.
    E2bCompute,
    /// Model API usage.
    ClaudeApi,
    /// Other external API calls.
    ExternalApi,
}

impl CostKind {
    /// `true` for the compute bucket of the run breakdown.
    #[must_use]
    pub fn is_compute(self) -> bool {
        matches!(self, Self::E2bCompute)
    }
}

/// One recorded spend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    /// Entry id.
    pub entry_id: Uuid,
    /// Run the spend belongs to.
    pub run_id: String,
    /// Spend category.
    pub kind: CostKind,
    /// Amount in cents.
    pub amount_cents: u64,
    /// What the spend was for.
    pub description: String,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata (token counts, durations).
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Which cap a rejected entry would have breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    /// The per-run cap.
    Run,
    /// The workspace daily cap.
    Day,
    /// The workspace monthly cap.
    Month,
}

/// Workspace-level spend caps. `None` means uncapped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Default per-run cap, overridable per run at registration.
    pub max_run_cents: Option<u64>,
    /// Per-workspace daily cap.
    pub max_day_cents: Option<u64>,
    /// Per-workspace monthly cap.
    pub max_month_cents: Option<u64>,
    /// Fraction of a cap at which warnings start.
    pub warning_threshold: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_run_cents: None,
            max_day_cents: None,
            max_month_cents: None,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
        }
    }
}

/// Errors from cost operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CostError {
    /// The projected total would exceed a cap; nothing was recorded.
    #[error("{scope:?} budget exceeded: projected {projected_cents} cents against cap {limit_cents}")]
    BudgetExceeded {
        /// The cap that would be breached.
        scope: BudgetScope,
        /// The operative cap in cents.
        limit_cents: u64,
        /// The total the entry would have produced.
        projected_cents: u64,
    },

    /// The run was never registered with the tracker.
    #[error("run {run_id} is not registered with the cost tracker")]
    UnknownRun {
        /// The unregistered run.
        run_id: String,
    },
}

/// Advisory signal that a cap is close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetWarning {
    /// The cap being approached.
    pub scope: BudgetScope,
    /// Usage as a percentage of that cap.
    pub usage_pct: f64,
}

/// Result of a successful [`CostTracker::add_cost`].
#[derive(Debug, Clone, PartialEq)]
pub struct AddOutcome {
    /// Id of the recorded entry.
    pub entry_id: Uuid,
    /// Run total after the entry.
    pub run_total_cents: u64,
    /// Workspace day total after the entry.
    pub day_total_cents: u64,
    /// Workspace month total after the entry.
    pub month_total_cents: u64,
    /// Set when any cap crossed its warning threshold.
    pub warning: Option<BudgetWarning>,
}

struct RunCosts {
    workspace_id: String,
    run_cap_cents: Option<u64>,
    entries: Vec<CostEntry>,
    breakdown: CostBreakdown,
}

#[derive(Default)]
struct Totals {
    runs: HashMap<String, RunCosts>,
    /// Keyed by `(workspace, YYYY-MM-DD)`.
    day: HashMap<(String, String), u64>,
    /// Keyed by `(workspace, YYYY-MM)`.
    month: HashMap<(String, String), u64>,
}

/// Thread-safe cost tracker shared by every run in the process.
///
/// Workspace day/month totals are the only cross-run mutable state in the
/// control plane; they live behind this tracker's mutex and budget
/// decisions use the snapshot taken inside the same critical section.
pub struct CostTracker {
    limits: BudgetLimits,
    inner: Mutex<Totals>,
}

impl CostTracker {
    /// Tracker with the given workspace caps.
    #[must_use]
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(Totals::default()),
        }
    }

    /// Register a run before recording costs against it.
    ///
    /// `run_cap_cents` overrides the configured default per-run cap
    /// (typically the contract's `max_cost_cents`).
    pub fn register_run(
        &self,
        run_id: impl Into<String>,
        workspace_id: impl Into<String>,
        run_cap_cents: Option<u64>,
    ) {
        let mut inner = self.inner.lock().expect("cost tracker lock poisoned");
        inner.runs.insert(
            run_id.into(),
            RunCosts {
                workspace_id: workspace_id.into(),
                run_cap_cents: run_cap_cents.or(self.limits.max_run_cents),
                entries: Vec::new(),
                breakdown: CostBreakdown::default(),
            },
        );
    }

    /// Record a cost entry, gating on every cap first.
    ///
    /// # Errors
    ///
    /// [`CostError::BudgetExceeded`] when the projected run, day, or month
    /// total would be strictly over its cap — totals stay untouched.
    /// [`CostError::UnknownRun`] for unregistered runs.
    pub fn add_cost(
        &self,
        run_id: &str,
        kind: CostKind,
        amount_cents: u64,
        description: impl Into<String>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<AddOutcome, CostError> {
        self.add_cost_at(run_id, kind, amount_cents, description, metadata, Utc::now())
    }

    /// [`add_cost`](Self::add_cost) with an explicit clock, for tests and
    /// replay.
    ///
    /// # Errors
    ///
    /// Same as [`add_cost`](Self::add_cost).
    pub fn add_cost_at(
        &self,
        run_id: &str,
        kind: CostKind,
        amount_cents: u64,
        description: impl Into<String>,
        metadata: BTreeMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<AddOutcome, CostError> {
        let day_key = now.format("%Y-%m-%d").to_string();
        let month_key = now.format("%Y-%m").to_string();

        let mut inner = self.inner.lock().expect("cost tracker lock poisoned");
        let Some(run) = inner.runs.get(run_id) else {
            return Err(CostError::UnknownRun {
                run_id: run_id.to_string(),
            });
        };
        let workspace = run.workspace_id.clone();
        let run_cap = run.run_cap_cents;

        // Project every dimension before mutating anything. A projected
        // total exactly equal to the cap is allowed.
        let projected_run = run.breakdown.total_cents + amount_cents;
        let day_total = inner
            .day
            .get(&(workspace.clone(), day_key.clone()))
            .copied()
            .unwrap_or(0);
        let month_total = inner
            .month
            .get(&(workspace.clone(), month_key.clone()))
            .copied()
            .unwrap_or(0);
        let projected_day = day_total + amount_cents;
        let projected_month = month_total + amount_cents;

        let checks = [
            (BudgetScope::Run, run_cap, projected_run),
            (BudgetScope::Day, self.limits.max_day_cents, projected_day),
            (
                BudgetScope::Month,
                self.limits.max_month_cents,
                projected_month,
            ),
        ];
        for (scope, cap, projected) in checks {
            if let Some(limit_cents) = cap
                && projected > limit_cents
            {
                warn!(
                    target: "rcp.cost",
                    run_id,
                    ?scope,
                    limit_cents,
                    projected,
                    "cost entry rejected by budget gate"
                );
                return Err(CostError::BudgetExceeded {
                    scope,
                    limit_cents,
                    projected_cents: projected,
                });
            }
        }

        // Commit: entry, breakdown, and both workspace totals together.
        let entry = CostEntry {
            entry_id: Uuid::new_v4(),
            run_id: run_id.to_string(),
            kind,
            amount_cents,
            description: description.into(),
            timestamp: now,
            metadata,
        };
        let entry_id = entry.entry_id;

        let run = inner
            .runs
            .get_mut(run_id)
            .expect("run vanished inside critical section");
        if kind.is_compute() {
            run.breakdown.add_compute(amount_cents);
        } else {
            run.breakdown.add_api(amount_cents);
        }
        run.entries.push(entry);
        *inner.day.entry((workspace.clone(), day_key)).or_default() += amount_cents;
        *inner.month.entry((workspace, month_key)).or_default() += amount_cents;

        let warning = self.warning_for(projected_run, run_cap, projected_day, projected_month);
        debug!(
            target: "rcp.cost",
            run_id,
            amount_cents,
            run_total = projected_run,
            "cost entry recorded"
        );

        Ok(AddOutcome {
            entry_id,
            run_total_cents: projected_run,
            day_total_cents: projected_day,
            month_total_cents: projected_month,
            warning,
        })
    }

    fn warning_for(
        &self,
        run_total: u64,
        run_cap: Option<u64>,
        day_total: u64,
        month_total: u64,
    ) -> Option<BudgetWarning> {
        let threshold = self.limits.warning_threshold;
        let dims = [
            (BudgetScope::Run, run_cap, run_total),
            (BudgetScope::Day, self.limits.max_day_cents, day_total),
            (BudgetScope::Month, self.limits.max_month_cents, month_total),
        ];
        dims.into_iter()
            .filter_map(|(scope, cap, total)| {
                let cap = cap.filter(|&c| c > 0)?;
                let pct = total as f64 / cap as f64;
                (pct >= threshold).then_some(BudgetWarning {
                    scope,
                    usage_pct: pct * 100.0,
                })
            })
            .max_by(|a, b| a.usage_pct.total_cmp(&b.usage_pct))
    }

    /// Current breakdown for a run (zeroed for unknown runs).
    #[must_use]
    pub fn breakdown(&self, run_id: &str) -> CostBreakdown {
        let inner = self.inner.lock().expect("cost tracker lock poisoned");
        inner
            .runs
            .get(run_id)
            .map(|r| r.breakdown)
            .unwrap_or_default()
    }

    /// All entries recorded for a run, in insertion order.
    #[must_use]
    pub fn entries(&self, run_id: &str) -> Vec<CostEntry> {
        let inner = self.inner.lock().expect("cost tracker lock poisoned");
        inner
            .runs
            .get(run_id)
            .map(|r| r.entries.clone())
            .unwrap_or_default()
    }

    /// Workspace total for a `YYYY-MM-DD` day key.
    #[must_use]
    pub fn day_total(&self, workspace_id: &str, day: &str) -> u64 {
        let inner = self.inner.lock().expect("cost tracker lock poisoned");
        inner
            .day
            .get(&(workspace_id.to_string(), day.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Workspace total for a `YYYY-MM` month key.
    #[must_use]
    pub fn month_total(&self, workspace_id: &str, month: &str) -> u64 {
        let inner = self.inner.lock().expect("cost tracker lock poisoned");
        inner
            .month
            .get(&(workspace_id.to_string(), month.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Drop a run's entries (workspace totals are retained). Cleanup only.
    pub fn forget_run(&self, run_id: &str) {
        let mut inner = self.inner.lock().expect("cost tracker lock poisoned");
        inner.runs.remove(run_id);
    }
}

impl std::fmt::Debug for CostTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("cost tracker lock poisoned");
        f.debug_struct("CostTracker")
            .field("limits", &self.limits)
            .field("runs", &inner.runs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(limits: BudgetLimits) -> CostTracker {
        let t = CostTracker::new(limits);
        t.register_run("run_a", "ws-1", None);
        t
    }

    fn add(t: &CostTracker, kind: CostKind, cents: u64) -> Result<AddOutcome, CostError> {
        t.add_cost("run_a", kind, cents, "test", BTreeMap::new())
    }

    #[test]
    fn breakdown_invariant_holds_after_every_mutation() {
        let t = tracker(BudgetLimits::default());
        add(&t, CostKind::E2bCompute, 120).unwrap();
        add(&t, CostKind::ClaudeApi, 30).unwrap();
        add(&t, CostKind::ExternalApi, 5).unwrap();

        let b = t.breakdown("run_a");
        assert_eq!(b.compute_cents, 120);
        assert_eq!(b.api_cents, 35);
        assert_eq!(b.total_cents, 155);
        assert!(b.is_consistent());
    }

    #[test]
    fn budget_exactly_at_limit_is_allowed() {
        let t = CostTracker::new(BudgetLimits::default());
        t.register_run("run_a", "ws-1", Some(100));
        add(&t, CostKind::ClaudeApi, 60).unwrap();
        // 60 + 40 == 100: allowed.
        let outcome = add(&t, CostKind::ClaudeApi, 40).unwrap();
        assert_eq!(outcome.run_total_cents, 100);
    }

    #[test]
    fn budget_strictly_over_is_rejected_without_mutation() {
        let t = CostTracker::new(BudgetLimits::default());
        t.register_run("run_a", "ws-1", Some(100));
        add(&t, CostKind::ClaudeApi, 60).unwrap();

        let err = add(&t, CostKind::ClaudeApi, 41).unwrap_err();
        assert_eq!(
            err,
            CostError::BudgetExceeded {
                scope: BudgetScope::Run,
                limit_cents: 100,
                projected_cents: 101,
            }
        );
        // Nothing mutated: totals and entries unchanged.
        assert_eq!(t.breakdown("run_a").total_cents, 60);
        assert_eq!(t.entries("run_a").len(), 1);
        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert_eq!(t.day_total("ws-1", &today), 60);
    }

    #[test]
    fn day_cap_spans_runs_in_a_workspace() {
        let t = CostTracker::new(BudgetLimits {
            max_day_cents: Some(100),
            ..BudgetLimits::default()
        });
        t.register_run("run_a", "ws-1", None);
        t.register_run("run_b", "ws-1", None);
        t.register_run("run_c", "ws-2", None);

        t.add_cost("run_a", CostKind::ClaudeApi, 70, "a", BTreeMap::new())
            .unwrap();
        let err = t
            .add_cost("run_b", CostKind::ClaudeApi, 31, "b", BTreeMap::new())
            .unwrap_err();
        assert!(matches!(
            err,
            CostError::BudgetExceeded {
                scope: BudgetScope::Day,
                ..
            }
        ));
        // A different workspace is unaffected.
        t.add_cost("run_c", CostKind::ClaudeApi, 90, "c", BTreeMap::new())
            .unwrap();
    }

    #[test]
    fn month_totals_roll_up_across_days() {
        let t = CostTracker::new(BudgetLimits::default());
        t.register_run("run_a", "ws-1", None);
        let d1 = "2026-08-01T10:00:00Z".parse().unwrap();
        let d2 = "2026-08-15T10:00:00Z".parse().unwrap();
        t.add_cost_at("run_a", CostKind::ClaudeApi, 10, "a", BTreeMap::new(), d1)
            .unwrap();
        t.add_cost_at("run_a", CostKind::ClaudeApi, 20, "b", BTreeMap::new(), d2)
            .unwrap();
        assert_eq!(t.day_total("ws-1", "2026-08-01"), 10);
        assert_eq!(t.day_total("ws-1", "2026-08-15"), 20);
        assert_eq!(t.month_total("ws-1", "2026-08"), 30);
    }

    #[test]
    fn warning_at_eighty_percent_does_not_block() {
        let t = CostTracker::new(BudgetLimits::default());
        t.register_run("run_a", "ws-1", Some(100));
        let quiet = add(&t, CostKind::ClaudeApi, 79).unwrap();
        assert!(quiet.warning.is_none());

        let warned = add(&t, CostKind::ClaudeApi, 1).unwrap();
        let warning = warned.warning.expect("should warn at 80%");
        assert_eq!(warning.scope, BudgetScope::Run);
        assert!((warning.usage_pct - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_run_is_an_error() {
        let t = CostTracker::new(BudgetLimits::default());
        let err = t
            .add_cost("run_missing", CostKind::ClaudeApi, 1, "x", BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, CostError::UnknownRun { .. }));
    }

    #[test]
    fn contract_cap_overrides_default() {
        let t = CostTracker::new(BudgetLimits {
            max_run_cents: Some(1_000),
            ..BudgetLimits::default()
        });
        t.register_run("run_a", "ws-1", Some(50));
        let err = add(&t, CostKind::ClaudeApi, 51).unwrap_err();
        assert!(matches!(
            err,
            CostError::BudgetExceeded {
                limit_cents: 50,
                ..
            }
        ));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// total == compute + api after any sequence of entries.
            #[test]
            fn breakdown_total_is_always_the_sum(amounts in proptest::collection::vec((0u64..500, prop::bool::ANY), 0..30)) {
                let t = CostTracker::new(BudgetLimits::default());
                t.register_run("run_p", "ws-p", None);
                for (cents, compute) in amounts {
                    let kind = if compute { CostKind::E2bCompute } else { CostKind::ClaudeApi };
                    t.add_cost("run_p", kind, cents, "p", BTreeMap::new()).unwrap();
                }
                let b = t.breakdown("run_p");
                prop_assert!(b.is_consistent());
            }
        }
    }
}
