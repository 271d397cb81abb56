// SPDX-License-Identifier: MIT OR Apache-2.0
//! Trace bundle assembly.
//!
//! Everything in the bundle is derived from the run row and its ordered
//! event stream; nothing here queries live subsystems, so a bundle can be
//! rebuilt from storage long after the run ended.

use chrono::{DateTime, Utc};
use rcp_core::{ApprovalAuditRecord, Event, EventPayload, Run, RunState, Severity};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A human-relevant decision extracted from the stream.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    /// Seq of the originating event.
    pub seq: i64,
    /// When it happened.
    pub ts: DateTime<Utc>,
    /// Decision kind (`checkpoint_approved`, `drift_detected`, ...).
    pub kind: String,
    /// One-line summary.
    pub summary: String,
}

/// Per-phase aggregates for the summary table.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummaryRow {
    /// The phase.
    pub phase: RunState,
    /// When the run entered it.
    pub started_at: DateTime<Utc>,
    /// When the run left it (run end for the final phase).
    pub ended_at: DateTime<Utc>,
    /// Tool calls made while in the phase.
    pub tool_calls: u64,
}

impl PhaseSummaryRow {
    /// Phase duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}

/// Frontmatter of the markdown wrapper.
#[derive(Debug, Serialize)]
struct Frontmatter<'a> {
    run_id: &'a str,
    template: &'a str,
    goal: &'a str,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    outcome: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cost_cents: Option<u64>,
}

/// The assembled trace: run snapshot, stream, and derived views.
#[derive(Debug)]
pub struct TraceBundle {
    /// Final run row.
    pub run: Run,
    /// The full ordered event stream.
    pub events: Vec<Event>,
    /// Approval audit rows.
    pub audit: Vec<ApprovalAuditRecord>,
    /// Opaque calibration seeds supplied by the caller.
    pub calibration_seeds: Vec<serde_json::Value>,
    /// Decisions derived from checkpoint and drift events.
    pub decisions: Vec<DecisionRecord>,
    /// Phase table derived from `phase.changed` events.
    pub phases: Vec<PhaseSummaryRow>,
}

impl TraceBundle {
    /// Assemble the derived views from the raw inputs.
    #[must_use]
    pub fn build(
        run: Run,
        events: Vec<Event>,
        audit: Vec<ApprovalAuditRecord>,
        calibration_seeds: Vec<serde_json::Value>,
    ) -> Self {
        let decisions = derive_decisions(&events);
        let phases = derive_phases(&run, &events);
        Self {
            run,
            events,
            audit,
            calibration_seeds,
            decisions,
            phases,
        }
    }

    /// Outcome word for the frontmatter (`completed`, `failed`, ...).
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        self.run.state.as_str()
    }

    /// Render the markdown wrapper.
    ///
    /// # Errors
    ///
    /// Frontmatter serialization failures.
    pub fn render_markdown(&self) -> Result<String, serde_yaml::Error> {
        let frontmatter = serde_yaml::to_string(&Frontmatter {
            run_id: &self.run.run_id,
            template: &self.run.template_id,
            goal: &self.run.contract.goal,
            started_at: self.run.started_at,
            finished_at: self.run.completed_at,
            outcome: self.outcome(),
            cost_cents: (self.run.cost.total_cents > 0).then_some(self.run.cost.total_cents),
        })?;

        let mut md = String::new();
        md.push_str("---\n");
        md.push_str(&frontmatter);
        md.push_str("---\n\n");
        let _ = writeln!(md, "# Run {}\n", self.run.run_id);

        md.push_str("## Contract\n\n");
        let _ = writeln!(md, "**Goal.** {}\n", self.run.contract.goal);
        let _ = writeln!(
            md,
            "{} success criteria, {} deliverables, {} constraints.\n",
            self.run.contract.success_criteria.len(),
            self.run.contract.deliverables.len(),
            self.run.contract.constraints.len()
        );

        md.push_str("## Outcome\n\n");
        let _ = writeln!(
            md,
            "Finished `{}` with {} artifacts and {} cents total cost.\n",
            self.outcome(),
            self.run.artifacts.len(),
            self.run.cost.total_cents
        );

        md.push_str("## Phase Summary\n\n");
        md.push_str("| Phase | Duration (ms) | Tool calls |\n|---|---|---|\n");
        for row in &self.phases {
            let _ = writeln!(
                md,
                "| {} | {} | {} |",
                row.phase,
                row.duration_ms(),
                row.tool_calls
            );
        }
        md.push('\n');

        md.push_str("## Decisions\n\n");
        if self.decisions.is_empty() {
            md.push_str("No checkpoints or drift.\n");
        } else {
            for d in &self.decisions {
                let _ = writeln!(md, "- seq {} `{}`: {}", d.seq, d.kind, d.summary);
            }
        }
        md.push('\n');

        md.push_str("## Errors & Recoveries\n\n");
        let errors: Vec<&Event> = self
            .events
            .iter()
            .filter(|e| e.severity == Severity::Error)
            .collect();
        if errors.is_empty() && self.run.error.is_none() {
            md.push_str("None.\n");
        } else {
            for e in errors {
                let _ = writeln!(md, "- seq {} `{}`", e.seq, e.kind());
            }
            if let Some(err) = &self.run.error {
                let _ = writeln!(md, "- terminal: {} ({})", err.message, err.kind);
            }
        }
        md.push('\n');

        md.push_str("## Calibration Notes\n\n");
        if self.calibration_seeds.is_empty() {
            md.push_str("No seeds provided.\n");
        } else {
            let _ = writeln!(md, "{} seeds attached in the JSONL stream.", self.calibration_seeds.len());
        }

        Ok(md)
    }

    /// Flatten the bundle into ordered JSONL records.
    ///
    /// # Errors
    ///
    /// Serialization failures for the contract or derived records.
    pub fn jsonl_records(
        &self,
    ) -> Result<Vec<(&'static str, DateTime<Utc>, serde_json::Value)>, serde_json::Error> {
        let mut records = Vec::new();
        let run_end = self.run.completed_at.unwrap_or(self.run.updated_at);

        records.push((
            "contract",
            self.run.created_at,
            serde_json::to_value(&self.run.contract)?,
        ));

        for row in &self.phases {
            records.push((
                "phase_start",
                row.started_at,
                serde_json::json!({"phase": row.phase}),
            ));
            records.push((
                "phase_end",
                row.ended_at,
                serde_json::json!({
                    "phase": row.phase,
                    "duration_ms": row.duration_ms(),
                    "tool_calls": row.tool_calls,
                }),
            ));
        }

        let mut last_failed_tool: Option<String> = None;
        for event in &self.events {
            match &event.payload {
                EventPayload::ToolCalled {
                    tool_name, input, ..
                } => {
                    records.push((
                        "tool_call",
                        event.ts,
                        serde_json::json!({"tool_name": tool_name, "input": input}),
                    ));
                }
                EventPayload::ToolResult {
                    tool_name, success, duration_ms, ..
                } => {
                    records.push((
                        "tool_result",
                        event.ts,
                        serde_json::json!({
                            "tool_name": tool_name,
                            "success": success,
                            "duration_ms": duration_ms,
                        }),
                    ));
                    if *success {
                        if last_failed_tool.as_deref() == Some(tool_name) {
                            records.push((
                                "recovery",
                                event.ts,
                                serde_json::json!({"tool_name": tool_name}),
                            ));
                        }
                        last_failed_tool = None;
                    } else {
                        last_failed_tool = Some(tool_name.clone());
                    }
                }
                EventPayload::RunFailed {
                    error_type,
                    error_message,
                    ..
                } => {
                    records.push((
                        "run_failed",
                        event.ts,
                        serde_json::json!({
                            "error_type": error_type,
                            "error_message": error_message,
                        }),
                    ));
                }
                EventPayload::RunCompleted {
                    artifact_count,
                    total_cost_cents,
                    duration_ms,
                } => {
                    records.push((
                        "run_complete",
                        event.ts,
                        serde_json::json!({
                            "artifact_count": artifact_count,
                            "total_cost_cents": total_cost_cents,
                            "duration_ms": duration_ms,
                        }),
                    ));
                }
                _ if event.severity == Severity::Error => {
                    records.push((
                        "error",
                        event.ts,
                        serde_json::json!({"event": event.kind().as_str(), "seq": event.seq}),
                    ));
                }
                _ => {}
            }
        }

        for d in &self.decisions {
            records.push(("decision", d.ts, serde_json::to_value(d)?));
        }
        for seed in &self.calibration_seeds {
            records.push(("calibration_seed", run_end, seed.clone()));
        }

        Ok(records)
    }
}

fn derive_decisions(events: &[Event]) -> Vec<DecisionRecord> {
    events
        .iter()
        .filter_map(|e| {
            let (kind, summary) = match &e.payload {
                EventPayload::CheckpointRequested {
                    checkpoint_id,
                    action_type,
                    ..
                } => (
                    "checkpoint_requested",
                    format!("approval requested for '{action_type}' ({checkpoint_id})"),
                ),
                EventPayload::CheckpointApproved {
                    checkpoint_id,
                    actor_id,
                    approved_from,
                } => (
                    "checkpoint_approved",
                    format!(
                        "{} approved {checkpoint_id} via {approved_from:?}",
                        actor_id.as_deref().unwrap_or("system")
                    ),
                ),
                EventPayload::CheckpointRejected {
                    checkpoint_id,
                    reason,
                    ..
                } => (
                    "checkpoint_rejected",
                    format!("{checkpoint_id} rejected ({reason:?})"),
                ),
                EventPayload::CheckpointTimeout {
                    checkpoint_id,
                    timeout_action,
                    ..
                } => (
                    "checkpoint_timeout",
                    format!("{checkpoint_id} expired, applied {timeout_action:?}"),
                ),
                EventPayload::DriftDetected {
                    drift_type, details, ..
                } => ("drift_detected", format!("{drift_type:?}: {details}")),
                _ => return None,
            };
            Some(DecisionRecord {
                seq: e.seq,
                ts: e.ts,
                kind: kind.to_string(),
                summary,
            })
        })
        .collect()
}

fn derive_phases(run: &Run, events: &[Event]) -> Vec<PhaseSummaryRow> {
    let mut tool_calls_by_phase: BTreeMap<&'static str, u64> = BTreeMap::new();
    for e in events {
        if matches!(e.payload, EventPayload::ToolCalled { .. }) {
            *tool_calls_by_phase.entry(e.phase.as_str()).or_default() += 1;
        }
    }

    let run_end = run.completed_at.unwrap_or(run.updated_at);
    let mut rows: Vec<PhaseSummaryRow> = Vec::new();
    for e in events {
        if let EventPayload::PhaseChanged { to, .. } = &e.payload {
            if let Some(last) = rows.last_mut() {
                last.ended_at = e.ts;
            }
            rows.push(PhaseSummaryRow {
                phase: *to,
                started_at: e.ts,
                ended_at: run_end,
                tool_calls: tool_calls_by_phase
                    .get(to.as_str())
                    .copied()
                    .unwrap_or(0),
            });
        }
    }
    rows
}
