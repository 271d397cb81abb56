// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pending approvals and the immutable audit trail of their resolutions.

use crate::run::RunState;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happens when a pending approval expires unresolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Auto-approve and resume the run.
    Approve,
    /// Transition the run to the `timeout` terminal state.
    Reject,
}

/// Lifecycle of a pending approval. Advances monotonically from `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting resolution.
    Pending,
    /// Approved by an actor or auto-approved on timeout.
    Approved,
    /// Rejected by an actor.
    Rejected,
    /// Expired with `timeout_action = reject`.
    Timeout,
}

/// Structured reason for rejecting a checkpoint.
///
/// The reason determines the state the run lands in: `user_cancelled` →
/// `cancelled`, `needs_edit` → `paused`, `policy_violation` → `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The user no longer wants the run.
    UserCancelled,
    /// The user wants to edit and resume later.
    NeedsEdit,
    /// The gated action would violate policy.
    PolicyViolation,
}

impl RejectReason {
    /// The run state a rejection with this reason lands in.
    #[must_use]
    pub fn target_state(self) -> RunState {
        match self {
            Self::UserCancelled => RunState::Cancelled,
            Self::NeedsEdit => RunState::Paused,
            Self::PolicyViolation => RunState::Failed,
        }
    }
}

/// Surface an approval resolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalSource {
    /// Web UI.
    Web,
    /// Desktop app.
    Desktop,
    /// Mobile app.
    Mobile,
    /// Direct API call.
    Api,
    /// Applied by the timeout sweep.
    Timeout,
    /// Applied by a bulk resolution.
    Bulk,
}

/// A live checkpoint waiting on human approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PendingApproval {
    /// Checkpoint identifier (unique among live entries).
    pub checkpoint_id: String,
    /// The suspended run.
    pub run_id: String,
    /// Side-effectful action kind being gated.
    pub action_type: String,
    /// Preview of what would happen on approval.
    pub preview: serde_json::Value,
    /// When the approval was requested.
    pub requested_at: DateTime<Utc>,
    /// When it expires.
    pub expires_at: DateTime<Utc>,
    /// Action applied on expiry.
    pub timeout_action: TimeoutAction,
    /// Current status.
    pub status: ApprovalStatus,
    /// Work phase the run suspended from.
    pub requested_from_phase: RunState,
}

impl PendingApproval {
    /// `true` once `now` has reached the expiry instant.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// The action recorded in an audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// The checkpoint was approved.
    Approved,
    /// The checkpoint was rejected.
    Rejected,
    /// The checkpoint expired.
    Timeout,
}

/// Immutable row appended for every approval resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalAuditRecord {
    /// Audit row id.
    pub audit_id: Uuid,
    /// The run the checkpoint belonged to.
    pub run_id: String,
    /// The resolved checkpoint.
    pub checkpoint_id: String,
    /// What happened.
    pub action: AuditAction,
    /// Resolving actor; `None` for timeouts.
    pub actor_id: Option<String>,
    /// Where the resolution came from.
    pub source: ApprovalSource,
    /// Free-text rejection detail, if any.
    pub rejection_reason: Option<String>,
    /// When the resolution was applied.
    pub timestamp: DateTime<Utc>,
}
