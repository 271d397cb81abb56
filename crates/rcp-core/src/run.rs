// SPDX-License-Identifier: MIT OR Apache-2.0
//! The run row: lifecycle states, cost breakdown, and terminal error capture.

use crate::artifact::ArtifactManifest;
use crate::contract::Contract;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a run.
///
/// Four states are terminal (`completed`, `failed`, `cancelled`, `timeout`);
/// three are resumable work states (`planning`, `executing`, `verifying`)
/// that a suspended run can return to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, not yet started.
    Pending,
    /// Sandbox provisioning and setup.
    Initializing,
    /// The agent is planning its approach.
    Planning,
    /// The agent is executing tool calls.
    Executing,
    /// The agent is verifying its work against the contract.
    Verifying,
    /// Final artifacts are being packaged.
    Packaging,
    /// Suspended on a pending human approval.
    AwaitingApproval,
    /// Suspended by a user pause.
    Paused,
    /// Terminal: finished successfully.
    Completed,
    /// Terminal: failed with a captured error.
    Failed,
    /// Terminal: cancelled by the user.
    Cancelled,
    /// Terminal: timed out (run duration or approval timeout).
    Timeout,
}

impl RunState {
    /// `true` for states with no outgoing transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// `true` for the work states a suspended run can resume into.
    #[must_use]
    pub fn is_resumable_work(self) -> bool {
        matches!(self, Self::Planning | Self::Executing | Self::Verifying)
    }

    /// `true` for the suspension states that carry a `previous_state`.
    #[must_use]
    pub fn is_suspension(self) -> bool {
        matches!(self, Self::AwaitingApproval | Self::Paused)
    }

    /// Wire name of the state (matches the serde representation).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Packaging => "packaging",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    /// All twelve states, in lifecycle order.
    pub const ALL: [Self; 12] = [
        Self::Pending,
        Self::Initializing,
        Self::Planning,
        Self::Executing,
        Self::Verifying,
        Self::Packaging,
        Self::AwaitingApproval,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Timeout,
    ];
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cost accumulated by a run, in integer cents.
///
/// Invariant: `total_cents == compute_cents + api_cents` after every
/// mutation. [`CostBreakdown::add`] maintains it; constructing the struct by
/// hand is reserved for deserialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CostBreakdown {
    /// Sandbox compute spend.
    pub compute_cents: u64,
    /// Model and external API spend.
    pub api_cents: u64,
    /// Sum of the two buckets.
    pub total_cents: u64,
}

impl CostBreakdown {
    /// Add `amount_cents` to the compute bucket.
    pub fn add_compute(&mut self, amount_cents: u64) {
        self.compute_cents += amount_cents;
        self.total_cents += amount_cents;
    }

    /// Add `amount_cents` to the API bucket.
    pub fn add_api(&mut self, amount_cents: u64) {
        self.api_cents += amount_cents;
        self.total_cents += amount_cents;
    }

    /// `true` when the total equals the sum of the buckets.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.total_cents == self.compute_cents + self.api_cents
    }
}

/// The execution environment allocated for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionEnv {
    /// Opaque sandbox identifier from the sandbox host.
    pub sandbox_id: String,
    /// When the sandbox was provisioned.
    pub created_at: DateTime<Utc>,
}

/// Terminal error recorded on a failed run.
///
/// `kind` is the error-handler category name (e.g. `contract_violation`);
/// `message` is the templated user-visible narration, never a stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunError {
    /// Error category name.
    pub kind: String,
    /// User-visible message.
    pub message: String,
    /// Whether a retry could plausibly succeed.
    pub recoverable: bool,
}

/// Partial results preserved when a run fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PartialCapture {
    /// Ids of artifacts produced before the failure.
    pub artifact_ids: Vec<String>,
    /// Workspace paths changed before the failure.
    pub files_changed: Vec<String>,
    /// Last phase the run was working in.
    pub last_phase: RunState,
    /// Sequence number of the last event appended before capture.
    pub last_event_seq: i64,
    /// When the capture was taken.
    pub captured_at: DateTime<Utc>,
}

/// One execution of a templated agent against a user goal.
///
/// The run row is owned by the run store; all mutation goes through it. The
/// contract snapshot is frozen at creation and never changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    /// Unique run identifier (`run_`-prefixed).
    pub run_id: String,
    /// Workspace the run belongs to.
    pub workspace_id: String,
    /// Template the agent was instantiated from.
    pub template_id: String,
    /// Version of that template.
    pub template_version: String,
    /// Immutable contract snapshot.
    pub contract: Contract,
    /// Sandbox allocation, present once provisioning succeeds.
    pub execution_env: Option<ExecutionEnv>,
    /// Current lifecycle state.
    pub state: RunState,
    /// Resumable work state captured on suspension; `None` otherwise.
    pub previous_state: Option<RunState>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Set when the run leaves `initializing`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the run reaches a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Seq of the newest event in the run's log; `-1` before any event.
    pub last_event_seq: i64,
    /// Rolling cost breakdown.
    pub cost: CostBreakdown,
    /// Ordered artifact references.
    pub artifacts: Vec<ArtifactManifest>,
    /// Terminal error, set only on failure paths.
    pub error: Option<RunError>,
    /// Partial results preserved on terminal failure.
    pub partial: Option<PartialCapture>,
}

impl Run {
    /// Create a fresh `pending` run with a frozen contract snapshot.
    #[must_use]
    pub fn new(
        run_id: String,
        workspace_id: impl Into<String>,
        template_id: impl Into<String>,
        template_version: impl Into<String>,
        contract: Contract,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            workspace_id: workspace_id.into(),
            template_id: template_id.into(),
            template_version: template_version.into(),
            contract,
            execution_env: None,
            state: RunState::Pending,
            previous_state: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            last_event_seq: -1,
            cost: CostBreakdown::default(),
            artifacts: Vec::new(),
            error: None,
            partial: None,
        }
    }

    /// `true` once the run has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Refresh the mutation timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
