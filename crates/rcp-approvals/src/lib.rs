// SPDX-License-Identifier: MIT OR Apache-2.0
//! rcp-approvals
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The human approval gate.
//!
//! The service owns every live [`PendingApproval`] and resolves them against
//! the run store with typed calls — state change, checkpoint event, and
//! audit row commit together or not at all. A periodic sweep applies
//! configured timeout actions to expired entries.

use chrono::{DateTime, Duration, Utc};
use rcp_core::{
    ApprovalAuditRecord, ApprovalSource, ApprovalStatus, AuditAction, EventPayload,
    PendingApproval, RejectReason, Run, RunState, Severity, TimeoutAction,
};
use rcp_state::UserAction;
use rcp_store::{Narration, RunStore, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Errors from approval operations.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// A checkpoint with this id is already pending.
    #[error("checkpoint {checkpoint_id} is already pending")]
    DuplicateCheckpoint {
        /// The reused id.
        checkpoint_id: String,
    },

    /// No checkpoint with this id.
    #[error("checkpoint {checkpoint_id} not found")]
    CheckpointNotFound {
        /// The id that was looked up.
        checkpoint_id: String,
    },

    /// The checkpoint is no longer pending.
    #[error("checkpoint {checkpoint_id} is {status:?}, not pending")]
    NotPending {
        /// The resolved checkpoint.
        checkpoint_id: String,
        /// Its current status.
        status: ApprovalStatus,
    },

    /// The underlying store rejected the resolution.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parameters for requesting an approval.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// Checkpoint id, unique among live entries.
    pub checkpoint_id: String,
    /// Side-effectful action kind being gated.
    pub action_type: String,
    /// Preview shown to the approver.
    pub preview: serde_json::Value,
    /// Seconds before the approval expires.
    pub timeout_seconds: u64,
    /// What to do on expiry.
    pub timeout_action: TimeoutAction,
}

/// Filter for [`ApprovalService::bulk_approve`]; present fields AND together.
#[derive(Debug, Clone, Default)]
pub struct BulkFilter {
    /// Restrict to one action kind.
    pub action_type: Option<String>,
    /// Restrict to one run.
    pub run_id: Option<String>,
    /// Cap the number of approvals applied.
    pub limit: Option<usize>,
}

/// Result of a bulk approval.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    /// Checkpoints approved, in application order.
    pub approved: Vec<String>,
    /// Per-item failures that did not abort the batch.
    pub failures: Vec<(String, ApprovalError)>,
}

/// One resolution applied by a timeout sweep.
#[derive(Debug)]
pub struct TimeoutResolution {
    /// The expired checkpoint.
    pub checkpoint_id: String,
    /// Its run.
    pub run_id: String,
    /// The action that was applied.
    pub action: TimeoutAction,
    /// The run state after resolution.
    pub new_state: RunState,
}

/// The approval service.
pub struct ApprovalService {
    store: Arc<RunStore>,
    pending: Mutex<HashMap<String, PendingApproval>>,
}

impl ApprovalService {
    /// Service resolving against the given store.
    #[must_use]
    pub fn new(store: Arc<RunStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Suspend a run on a pending approval.
    ///
    /// The caller (the orchestrator) emits `checkpoint.requested` before
    /// invoking this; the service transitions the run to
    /// `awaiting_approval` and registers the pending entry.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::DuplicateCheckpoint`] when the id is already live,
    /// or a store/state error if the run cannot suspend.
    pub fn request(&self, run_id: &str, req: ApprovalRequest) -> Result<PendingApproval, ApprovalError> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        if let Some(existing) = pending.get(&req.checkpoint_id)
            && existing.status == ApprovalStatus::Pending
        {
            return Err(ApprovalError::DuplicateCheckpoint {
                checkpoint_id: req.checkpoint_id,
            });
        }

        let run = self.store.get_run(run_id)?;
        let requested_from_phase = run.state;
        self.store
            .transition(run_id, RunState::AwaitingApproval, Narration::Silent)?;

        let now = Utc::now();
        let entry = PendingApproval {
            checkpoint_id: req.checkpoint_id.clone(),
            run_id: run_id.to_string(),
            action_type: req.action_type,
            preview: req.preview,
            requested_at: now,
            expires_at: now + Duration::seconds(req.timeout_seconds as i64),
            timeout_action: req.timeout_action,
            status: ApprovalStatus::Pending,
            requested_from_phase,
        };
        info!(
            target: "rcp.approvals",
            run_id,
            checkpoint_id = %entry.checkpoint_id,
            action_type = %entry.action_type,
            "approval requested"
        );
        pending.insert(entry.checkpoint_id.clone(), entry.clone());
        Ok(entry)
    }

    /// Approve a pending checkpoint and resume its run.
    ///
    /// # Errors
    ///
    /// Missing or already-resolved checkpoints, and store failures.
    pub fn approve(
        &self,
        checkpoint_id: &str,
        actor_id: Option<&str>,
        source: ApprovalSource,
    ) -> Result<Run, ApprovalError> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let entry = Self::take_pending(&mut pending, checkpoint_id)?;

        let audit = self.audit_record(
            &entry,
            AuditAction::Approved,
            actor_id.map(String::from),
            source,
            None,
        );
        let result = self.store.commit_action_with_audit(
            &entry.run_id,
            UserAction::Approve,
            Severity::Info,
            EventPayload::CheckpointApproved {
                checkpoint_id: checkpoint_id.to_string(),
                actor_id: actor_id.map(String::from),
                approved_from: source,
            },
            audit,
        );
        match result {
            Ok(run) => {
                info!(
                    target: "rcp.approvals",
                    checkpoint_id,
                    run_id = %entry.run_id,
                    resumed = %run.state,
                    "checkpoint approved"
                );
                if let Some(e) = pending.get_mut(checkpoint_id) {
                    e.status = ApprovalStatus::Approved;
                }
                Ok(run)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reject a pending checkpoint; the reason picks the landing state.
    ///
    /// # Errors
    ///
    /// Missing or already-resolved checkpoints, and store failures.
    pub fn reject(
        &self,
        checkpoint_id: &str,
        reason: RejectReason,
        detail: Option<String>,
        actor_id: Option<&str>,
        source: ApprovalSource,
    ) -> Result<Run, ApprovalError> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let entry = Self::take_pending(&mut pending, checkpoint_id)?;

        let audit = self.audit_record(
            &entry,
            AuditAction::Rejected,
            actor_id.map(String::from),
            source,
            detail.clone(),
        );
        let run = self.store.commit_action_with_audit(
            &entry.run_id,
            UserAction::Reject(reason),
            Severity::Warning,
            EventPayload::CheckpointRejected {
                checkpoint_id: checkpoint_id.to_string(),
                reason,
                detail,
                actor_id: actor_id.map(String::from),
            },
            audit,
        )?;
        warn!(
            target: "rcp.approvals",
            checkpoint_id,
            run_id = %entry.run_id,
            landed = %run.state,
            "checkpoint rejected"
        );
        if let Some(e) = pending.get_mut(checkpoint_id) {
            e.status = ApprovalStatus::Rejected;
        }
        Ok(run)
    }

    /// Approve every pending entry matching the filter.
    ///
    /// Entries are resolved in `(requested_at, checkpoint_id)` order so the
    /// batch is deterministic; per-item failures are collected, not fatal.
    /// Audit source is `bulk` on every record.
    pub fn bulk_approve(&self, actor_id: Option<&str>, filter: &BulkFilter) -> BulkOutcome {
        let selected: Vec<String> = {
            let pending = self.pending.lock().expect("pending lock poisoned");
            let mut matches: Vec<&PendingApproval> = pending
                .values()
                .filter(|p| p.status == ApprovalStatus::Pending)
                .filter(|p| {
                    filter
                        .action_type
                        .as_ref()
                        .is_none_or(|t| &p.action_type == t)
                })
                .filter(|p| filter.run_id.as_ref().is_none_or(|r| &p.run_id == r))
                .collect();
            matches.sort_by(|a, b| {
                (a.requested_at, &a.checkpoint_id).cmp(&(b.requested_at, &b.checkpoint_id))
            });
            matches
                .into_iter()
                .take(filter.limit.unwrap_or(usize::MAX))
                .map(|p| p.checkpoint_id.clone())
                .collect()
        };

        let mut outcome = BulkOutcome::default();
        for checkpoint_id in selected {
            match self.approve(&checkpoint_id, actor_id, ApprovalSource::Bulk) {
                Ok(_) => outcome.approved.push(checkpoint_id),
                Err(e) => outcome.failures.push((checkpoint_id, e)),
            }
        }
        outcome
    }

    /// Apply timeout actions to every expired pending entry.
    ///
    /// Intended to run every few seconds from the orchestrator's driver.
    /// `approve`-on-timeout resumes the run but narrates with
    /// `checkpoint.timeout` (warning); `reject`-on-timeout lands the run on
    /// the `timeout` state with `checkpoint.timeout` at error severity.
    pub fn process_timeouts(&self) -> Vec<TimeoutResolution> {
        self.process_timeouts_at(Utc::now())
    }

    /// [`process_timeouts`](Self::process_timeouts) with an explicit clock.
    pub fn process_timeouts_at(&self, now: DateTime<Utc>) -> Vec<TimeoutResolution> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let expired: Vec<PendingApproval> = pending
            .values()
            .filter(|p| p.status == ApprovalStatus::Pending && p.is_expired_at(now))
            .cloned()
            .collect();

        let mut resolutions = Vec::new();
        for entry in expired {
            let waited_seconds = (now - entry.requested_at).num_seconds();
            let payload = EventPayload::CheckpointTimeout {
                checkpoint_id: entry.checkpoint_id.clone(),
                timeout_action: entry.timeout_action,
                waited_seconds,
            };
            let audit = self.audit_record(
                &entry,
                AuditAction::Timeout,
                None,
                ApprovalSource::Timeout,
                None,
            );

            let result = match entry.timeout_action {
                TimeoutAction::Approve => self.store.commit_action_with_audit(
                    &entry.run_id,
                    UserAction::Approve,
                    Severity::Warning,
                    payload,
                    audit,
                ),
                TimeoutAction::Reject => self.store.commit_transition_with_audit(
                    &entry.run_id,
                    RunState::Timeout,
                    Severity::Error,
                    payload,
                    audit,
                ),
            };

            match result {
                Ok(run) => {
                    warn!(
                        target: "rcp.approvals",
                        checkpoint_id = %entry.checkpoint_id,
                        run_id = %entry.run_id,
                        action = ?entry.timeout_action,
                        "approval expired"
                    );
                    if let Some(e) = pending.get_mut(&entry.checkpoint_id) {
                        e.status = match entry.timeout_action {
                            TimeoutAction::Approve => ApprovalStatus::Approved,
                            TimeoutAction::Reject => ApprovalStatus::Timeout,
                        };
                    }
                    resolutions.push(TimeoutResolution {
                        checkpoint_id: entry.checkpoint_id,
                        run_id: entry.run_id,
                        action: entry.timeout_action,
                        new_state: run.state,
                    });
                }
                Err(e) => {
                    warn!(
                        target: "rcp.approvals",
                        checkpoint_id = %entry.checkpoint_id,
                        error = %e,
                        "timeout resolution failed"
                    );
                }
            }
        }
        resolutions
    }

    /// Snapshot of a live entry.
    #[must_use]
    pub fn get(&self, checkpoint_id: &str) -> Option<PendingApproval> {
        let pending = self.pending.lock().expect("pending lock poisoned");
        pending.get(checkpoint_id).cloned()
    }

    /// Entries still pending, sorted by request time.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingApproval> {
        let pending = self.pending.lock().expect("pending lock poisoned");
        let mut out: Vec<PendingApproval> = pending
            .values()
            .filter(|p| p.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (a.requested_at, &a.checkpoint_id).cmp(&(b.requested_at, &b.checkpoint_id))
        });
        out
    }

    fn take_pending(
        pending: &mut HashMap<String, PendingApproval>,
        checkpoint_id: &str,
    ) -> Result<PendingApproval, ApprovalError> {
        let entry = pending
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| ApprovalError::CheckpointNotFound {
                checkpoint_id: checkpoint_id.to_string(),
            })?;
        if entry.status != ApprovalStatus::Pending {
            return Err(ApprovalError::NotPending {
                checkpoint_id: checkpoint_id.to_string(),
                status: entry.status,
            });
        }
        Ok(entry)
    }

    fn audit_record(
        &self,
        entry: &PendingApproval,
        action: AuditAction,
        actor_id: Option<String>,
        source: ApprovalSource,
        rejection_reason: Option<String>,
    ) -> ApprovalAuditRecord {
        ApprovalAuditRecord {
            audit_id: Uuid::new_v4(),
            run_id: entry.run_id.clone(),
            checkpoint_id: entry.checkpoint_id.clone(),
            action,
            actor_id,
            source,
            rejection_reason,
            timestamp: Utc::now(),
        }
    }
}

impl std::fmt::Debug for ApprovalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.pending.lock().expect("pending lock poisoned");
        f.debug_struct("ApprovalService")
            .field("entries", &pending.len())
            .finish()
    }
}
