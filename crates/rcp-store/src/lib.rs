// SPDX-License-Identifier: MIT OR Apache-2.0
//! rcp-store
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The canonical run store.
//!
//! The store is the only writer of run rows. Every state change commits
//! together with the event that narrates it: the event is appended to the
//! log first, and a failed append aborts the transition, so readers never
//! observe a state the log does not explain. Approval resolutions extend
//! the same transaction with an audit row.

use chrono::Utc;
use rcp_core::{
    ApprovalAuditRecord, ArtifactManifest, Contract, CostBreakdown, Event, EventPayload,
    ExecutionEnv, PartialCapture, Run, RunError, RunState, Severity,
};
use rcp_log::{EventLog, LogError};
use rcp_state::{plan_action, plan_transition, StateError, TransitionPlan, UserAction};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Errors from run-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No run row with the given id.
    #[error("run {run_id} not found")]
    RunNotFound {
        /// The id that was looked up.
        run_id: String,
    },

    /// The state machine rejected the change.
    #[error(transparent)]
    State(#[from] StateError),

    /// The narrating event could not be appended; the state is unchanged.
    #[error("event append failed, transition aborted")]
    Log(#[from] LogError),
}

/// Options for creating a run.
#[derive(Debug, Clone)]
pub struct CreateRunOptions {
    /// Workspace the run belongs to.
    pub workspace_id: String,
    /// Template id.
    pub template_id: String,
    /// Template version.
    pub template_version: String,
    /// Contract to freeze onto the run.
    pub contract: Contract,
}

/// How a state change is narrated in the event log.
#[derive(Debug)]
pub enum Narration {
    /// Derive the event: `phase.changed` for observable phases, nothing for
    /// states narrated by a neighboring event (`initializing`,
    /// `awaiting_approval`, `timeout`, `failed`).
    Auto {
        /// Reason recorded in the `phase.changed` payload.
        reason: Option<String>,
    },
    /// Commit exactly this event with the change.
    Explicit {
        /// Event severity.
        severity: Severity,
        /// Event payload.
        payload: EventPayload,
    },
    /// Commit no event. Reserved for changes another event in the same
    /// logical operation already narrates.
    Silent,
}

impl Narration {
    /// Auto narration with a reason.
    #[must_use]
    pub fn reason(reason: impl Into<String>) -> Self {
        Self::Auto {
            reason: Some(reason.into()),
        }
    }

    /// Auto narration without a reason.
    #[must_use]
    pub fn auto() -> Self {
        Self::Auto { reason: None }
    }
}

/// `from` as reported in `phase.changed`: setup states map to `None`.
fn phase_from(state: RunState) -> Option<RunState> {
    match state {
        RunState::Pending | RunState::Initializing => None,
        other => Some(other),
    }
}

/// The canonical run store.
pub struct RunStore {
    runs: Mutex<HashMap<String, Run>>,
    log: Arc<EventLog>,
    audit: Mutex<Vec<ApprovalAuditRecord>>,
}

impl RunStore {
    /// Store writing into the given event log.
    #[must_use]
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            log,
            audit: Mutex::new(Vec::new()),
        }
    }

    /// The event log this store writes into.
    #[must_use]
    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Create a `pending` run with a frozen contract snapshot.
    pub fn create_run(&self, opts: CreateRunOptions) -> Run {
        let run = Run::new(
            rcp_core::new_run_id(),
            opts.workspace_id,
            opts.template_id,
            opts.template_version,
            opts.contract,
        );
        info!(target: "rcp.store", run_id = %run.run_id, "run created");
        let mut runs = self.runs.lock().expect("run store lock poisoned");
        runs.insert(run.run_id.clone(), run.clone());
        run
    }

    /// Fetch a snapshot of a run row.
    ///
    /// # Errors
    ///
    /// [`StoreError::RunNotFound`].
    pub fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        let runs = self.runs.lock().expect("run store lock poisoned");
        runs.get(run_id).cloned().ok_or_else(|| StoreError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    /// Snapshots of all runs, optionally filtered by workspace.
    #[must_use]
    pub fn list_runs(&self, workspace_id: Option<&str>) -> Vec<Run> {
        let runs = self.runs.lock().expect("run store lock poisoned");
        let mut out: Vec<Run> = runs
            .values()
            .filter(|r| workspace_id.is_none_or(|ws| r.workspace_id == ws))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Delete a run row and its event stream. Test/cleanup paths only.
    pub fn delete_run(&self, run_id: &str) {
        let mut runs = self.runs.lock().expect("run store lock poisoned");
        runs.remove(run_id);
        self.log.delete_run(run_id);
    }

    /// Append an event to a run's stream without a state change.
    ///
    /// The store assigns the next seq and stamps the run's current state as
    /// the event phase. `severity` defaults to the payload's own default.
    ///
    /// # Errors
    ///
    /// [`StoreError::RunNotFound`] or a log append failure.
    pub fn emit(
        &self,
        run_id: &str,
        severity: Option<Severity>,
        payload: EventPayload,
    ) -> Result<Event, StoreError> {
        let mut runs = self.runs.lock().expect("run store lock poisoned");
        let run = runs.get_mut(run_id).ok_or_else(|| StoreError::RunNotFound {
            run_id: run_id.to_string(),
        })?;

        let event = Event {
            event_id: Uuid::new_v4(),
            run_id: run.run_id.clone(),
            seq: run.last_event_seq + 1,
            ts: Utc::now(),
            phase: run.state,
            severity: severity.unwrap_or_else(|| payload.default_severity()),
            payload,
        };
        self.log.append(event.clone())?;
        run.last_event_seq = event.seq;
        run.touch();
        Ok(event)
    }

    /// Commit a validated state change plus its narration as one unit.
    fn commit(
        &self,
        run_id: &str,
        plan: TransitionPlan,
        narration: Narration,
        audit: Option<ApprovalAuditRecord>,
    ) -> Result<Run, StoreError> {
        let mut runs = self.runs.lock().expect("run store lock poisoned");
        let run = runs.get_mut(run_id).ok_or_else(|| StoreError::RunNotFound {
            run_id: run_id.to_string(),
        })?;

        // The plan was computed outside this lock; a racing writer
        // invalidates it.
        if run.state != plan.from {
            return Err(StateError::InvalidTransition {
                from: run.state,
                to: plan.to,
            }
            .into());
        }

        let event = match narration {
            Narration::Explicit { severity, payload } => Some((severity, payload)),
            Narration::Auto { reason } => match plan.to {
                // These states are narrated by a neighboring event
                // (run.started, checkpoint.*, run.failed).
                RunState::Initializing
                | RunState::AwaitingApproval
                | RunState::Timeout
                | RunState::Failed => None,
                to => Some((
                    Severity::Info,
                    EventPayload::PhaseChanged {
                        from: phase_from(plan.from),
                        to,
                        reason,
                    },
                )),
            },
            Narration::Silent => None,
        };

        // Event first: a failed append must abort the state change.
        if let Some((severity, payload)) = event {
            let event = Event {
                event_id: Uuid::new_v4(),
                run_id: run.run_id.clone(),
                seq: run.last_event_seq + 1,
                ts: Utc::now(),
                phase: plan.to,
                severity,
                payload,
            };
            self.log.append(event.clone())?;
            run.last_event_seq = event.seq;
        }

        run.state = plan.to;
        run.previous_state = plan.previous_state;
        if plan.to.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        if plan.to == RunState::Pending {
            // Retry reset: clear the failure residue.
            run.error = None;
            run.partial = None;
            run.completed_at = None;
            run.started_at = None;
        }
        run.touch();
        debug!(
            target: "rcp.store",
            run_id = %run.run_id,
            from = %plan.from,
            to = %plan.to,
            "state committed"
        );
        let snapshot = run.clone();
        drop(runs);

        if let Some(record) = audit {
            let mut audit_log = self.audit.lock().expect("audit lock poisoned");
            audit_log.push(record);
        }
        Ok(snapshot)
    }

    /// Transition a run to `to`, validating against the state machine.
    ///
    /// # Errors
    ///
    /// State-machine rejections and log append failures; both leave the run
    /// unchanged.
    pub fn transition(
        &self,
        run_id: &str,
        to: RunState,
        narration: Narration,
    ) -> Result<Run, StoreError> {
        let current = self.get_run(run_id)?;
        let plan = plan_transition(current.state, current.previous_state, to)?;
        self.commit(run_id, plan, narration, None)
    }

    /// Apply a user action (pause, resume, cancel, retry).
    ///
    /// Approve/reject go through the approval service so the checkpoint
    /// events and audit rows ride the same transaction.
    ///
    /// # Errors
    ///
    /// Same as [`transition`](Self::transition), plus action-validity
    /// errors.
    pub fn apply_action(&self, run_id: &str, action: UserAction) -> Result<Run, StoreError> {
        let current = self.get_run(run_id)?;
        let plan = plan_action(current.state, current.previous_state, action)?;
        self.commit(run_id, plan, Narration::reason(action.name()), None)
    }

    /// Commit an approval resolution: user action + event + audit, atomically.
    ///
    /// # Errors
    ///
    /// Same as [`apply_action`](Self::apply_action); on failure no event or
    /// audit row is written.
    pub fn commit_action_with_audit(
        &self,
        run_id: &str,
        action: UserAction,
        severity: Severity,
        payload: EventPayload,
        audit: ApprovalAuditRecord,
    ) -> Result<Run, StoreError> {
        let current = self.get_run(run_id)?;
        let plan = plan_action(current.state, current.previous_state, action)?;
        self.commit(
            run_id,
            plan,
            Narration::Explicit { severity, payload },
            Some(audit),
        )
    }

    /// Commit a direct transition + event + audit, atomically.
    ///
    /// Used by the reject-on-timeout path, which lands on the `timeout`
    /// state rather than going through a user action.
    ///
    /// # Errors
    ///
    /// Same as [`transition`](Self::transition).
    pub fn commit_transition_with_audit(
        &self,
        run_id: &str,
        to: RunState,
        severity: Severity,
        payload: EventPayload,
        audit: ApprovalAuditRecord,
    ) -> Result<Run, StoreError> {
        let current = self.get_run(run_id)?;
        let plan = plan_transition(current.state, current.previous_state, to)?;
        self.commit(
            run_id,
            plan,
            Narration::Explicit { severity, payload },
            Some(audit),
        )
    }

    /// Record the provisioned execution environment.
    ///
    /// # Errors
    ///
    /// [`StoreError::RunNotFound`].
    pub fn set_execution_env(&self, run_id: &str, env: ExecutionEnv) -> Result<(), StoreError> {
        self.update(run_id, |run| run.execution_env = Some(env))
    }

    /// Stamp `started_at`.
    ///
    /// # Errors
    ///
    /// [`StoreError::RunNotFound`].
    pub fn mark_started(&self, run_id: &str) -> Result<(), StoreError> {
        self.update(run_id, |run| run.started_at = Some(Utc::now()))
    }

    /// Replace the run's cost breakdown with the tracker's current totals.
    ///
    /// # Errors
    ///
    /// [`StoreError::RunNotFound`].
    pub fn set_cost(&self, run_id: &str, cost: CostBreakdown) -> Result<(), StoreError> {
        self.update(run_id, |run| run.cost = cost)
    }

    /// Append an artifact reference to the run row.
    ///
    /// # Errors
    ///
    /// [`StoreError::RunNotFound`].
    pub fn add_artifact(
        &self,
        run_id: &str,
        manifest: ArtifactManifest,
    ) -> Result<(), StoreError> {
        self.update(run_id, |run| run.artifacts.push(manifest))
    }

    /// Record the terminal error and partial capture.
    ///
    /// # Errors
    ///
    /// [`StoreError::RunNotFound`].
    pub fn set_failure(
        &self,
        run_id: &str,
        error: RunError,
        partial: Option<PartialCapture>,
    ) -> Result<(), StoreError> {
        self.update(run_id, |run| {
            run.error = Some(error);
            run.partial = partial;
        })
    }

    fn update(
        &self,
        run_id: &str,
        mutate: impl FnOnce(&mut Run),
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().expect("run store lock poisoned");
        let run = runs.get_mut(run_id).ok_or_else(|| StoreError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        mutate(run);
        run.touch();
        Ok(())
    }

    /// Append an audit row outside a state transaction (rare).
    pub fn append_audit(&self, record: ApprovalAuditRecord) {
        let mut audit = self.audit.lock().expect("audit lock poisoned");
        audit.push(record);
    }

    /// Audit rows for a run, in append order.
    #[must_use]
    pub fn audit_for_run(&self, run_id: &str) -> Vec<ApprovalAuditRecord> {
        let audit = self.audit.lock().expect("audit lock poisoned");
        audit.iter().filter(|r| r.run_id == run_id).cloned().collect()
    }
}

impl std::fmt::Debug for RunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let runs = self.runs.lock().expect("run store lock poisoned");
        f.debug_struct("RunStore").field("runs", &runs.len()).finish()
    }
}
