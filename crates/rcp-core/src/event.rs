// SPDX-License-Identifier: MIT OR Apache-2.0
//! The closed event vocabulary.
//!
//! Every event carries a fixed, structurally-typed payload: the discriminator
//! is the serde tag, so an ill-shaped payload is unrepresentable rather than
//! rejected by a runtime schema table.

use crate::approval::{ApprovalSource, RejectReason, TimeoutAction};
use crate::run::RunState;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine progress.
    Info,
    /// Unexpected but recoverable.
    Warning,
    /// A failure the run may not recover from.
    Error,
}

/// Drift classification attached to `drift.detected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// A tool outside the tool policy was called.
    UnauthorizedTool,
    /// A blocked path was touched.
    PathViolation,
    /// The agent repeated the same call enough times to look stuck.
    LoopDetected,
    /// A declarative constraint was breached.
    ConstraintBreach,
}

/// The closed set of event types, used for query filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum EventKind {
    /// `run.started`
    #[serde(rename = "run.started")]
    RunStarted,
    /// `phase.changed`
    #[serde(rename = "phase.changed")]
    PhaseChanged,
    /// `tool.called`
    #[serde(rename = "tool.called")]
    ToolCalled,
    /// `tool.result`
    #[serde(rename = "tool.result")]
    ToolResult,
    /// `file.changed`
    #[serde(rename = "file.changed")]
    FileChanged,
    /// `artifact.created`
    #[serde(rename = "artifact.created")]
    ArtifactCreated,
    /// `checkpoint.requested`
    #[serde(rename = "checkpoint.requested")]
    CheckpointRequested,
    /// `checkpoint.approved`
    #[serde(rename = "checkpoint.approved")]
    CheckpointApproved,
    /// `checkpoint.rejected`
    #[serde(rename = "checkpoint.rejected")]
    CheckpointRejected,
    /// `checkpoint.timeout`
    #[serde(rename = "checkpoint.timeout")]
    CheckpointTimeout,
    /// `drift.detected`
    #[serde(rename = "drift.detected")]
    DriftDetected,
    /// `run.completed`
    #[serde(rename = "run.completed")]
    RunCompleted,
    /// `run.failed`
    #[serde(rename = "run.failed")]
    RunFailed,
}

impl EventKind {
    /// Wire name of the event type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::PhaseChanged => "phase.changed",
            Self::ToolCalled => "tool.called",
            Self::ToolResult => "tool.result",
            Self::FileChanged => "file.changed",
            Self::ArtifactCreated => "artifact.created",
            Self::CheckpointRequested => "checkpoint.requested",
            Self::CheckpointApproved => "checkpoint.approved",
            Self::CheckpointRejected => "checkpoint.rejected",
            Self::CheckpointTimeout => "checkpoint.timeout",
            Self::DriftDetected => "drift.detected",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The payload discriminator for [`Event`].
///
/// Serialized with `#[serde(tag = "type")]`, so the wire form carries the
/// dotted event name alongside the payload fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum EventPayload {
    /// The run's sandbox is up and the agent is starting.
    #[serde(rename = "run.started")]
    RunStarted {
        /// Template the agent was instantiated from.
        template: String,
        /// The user goal.
        goal: String,
        /// Sandbox identifier, if provisioning succeeded.
        sandbox_id: Option<String>,
    },

    /// The run moved between observable phases.
    #[serde(rename = "phase.changed")]
    PhaseChanged {
        /// Phase left, `None` when entering the first work phase.
        from: Option<RunState>,
        /// Phase entered.
        to: RunState,
        /// Why the change happened (user action, advance, retry).
        reason: Option<String>,
    },

    /// A tool call passed the gate and is about to execute.
    #[serde(rename = "tool.called")]
    ToolCalled {
        /// Name of the tool.
        tool_name: String,
        /// Correlation id for the matching `tool.result`.
        tool_use_id: Option<String>,
        /// JSON input passed to the tool.
        input: serde_json::Value,
    },

    /// A tool call finished.
    #[serde(rename = "tool.result")]
    ToolResult {
        /// Name of the tool.
        tool_name: String,
        /// Correlation id of the originating call.
        tool_use_id: Option<String>,
        /// Whether the tool reported success.
        success: bool,
        /// Wall-clock duration of the call.
        duration_ms: u64,
        /// Truncated preview of the output.
        output_preview: Option<String>,
    },

    /// A file changed in the sandbox workspace.
    #[serde(rename = "file.changed")]
    FileChanged {
        /// Path relative to the workspace root.
        path: String,
        /// Human-readable summary of the change.
        summary: String,
    },

    /// An artifact manifest was recorded.
    #[serde(rename = "artifact.created")]
    ArtifactCreated {
        /// Artifact identifier.
        artifact_id: String,
        /// Artifact kind (e.g. `"markdown"`).
        artifact_kind: String,
        /// Resolved destination path.
        destination_path: String,
        /// Hex SHA-256 of the content.
        sha256: String,
        /// Content size in bytes.
        size_bytes: u64,
    },

    /// The run suspended pending human approval.
    #[serde(rename = "checkpoint.requested")]
    CheckpointRequested {
        /// Checkpoint identifier.
        checkpoint_id: String,
        /// Side-effectful action kind being gated.
        action_type: String,
        /// Preview of what would happen on approval.
        preview: serde_json::Value,
        /// Seconds until the approval expires.
        timeout_seconds: u64,
        /// What happens on expiry.
        timeout_action: TimeoutAction,
    },

    /// A pending checkpoint was approved.
    #[serde(rename = "checkpoint.approved")]
    CheckpointApproved {
        /// Checkpoint identifier.
        checkpoint_id: String,
        /// Who approved, if known.
        actor_id: Option<String>,
        /// Surface the approval came from.
        approved_from: ApprovalSource,
    },

    /// A pending checkpoint was rejected.
    #[serde(rename = "checkpoint.rejected")]
    CheckpointRejected {
        /// Checkpoint identifier.
        checkpoint_id: String,
        /// Structured rejection reason.
        reason: RejectReason,
        /// Free-text detail, if any.
        detail: Option<String>,
        /// Who rejected, if known.
        actor_id: Option<String>,
    },

    /// A pending checkpoint expired and its timeout action was applied.
    #[serde(rename = "checkpoint.timeout")]
    CheckpointTimeout {
        /// Checkpoint identifier.
        checkpoint_id: String,
        /// The configured action that was applied.
        timeout_action: TimeoutAction,
        /// Seconds the checkpoint sat unresolved.
        waited_seconds: i64,
    },

    /// The agent acted outside its contract.
    #[serde(rename = "drift.detected")]
    DriftDetected {
        /// Drift classification.
        drift_type: DriftKind,
        /// Human-readable detail.
        details: String,
        /// Offending tool, if the drift involved one.
        tool_name: Option<String>,
        /// Offending path, if the drift involved one.
        path: Option<String>,
    },

    /// The run reached `completed`.
    #[serde(rename = "run.completed")]
    RunCompleted {
        /// Number of artifacts recorded.
        artifact_count: u64,
        /// Final cost total in cents.
        total_cost_cents: u64,
        /// Wall-clock duration of the run.
        duration_ms: u64,
    },

    /// The run reached `failed`.
    #[serde(rename = "run.failed")]
    RunFailed {
        /// Error category name.
        error_type: String,
        /// User-visible message.
        error_message: String,
        /// Whether a retry could plausibly succeed.
        recoverable: bool,
        /// Whether a resumable checkpoint exists.
        checkpoint_available: bool,
    },
}

/// A semantically invalid payload caught at emit time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} payload: {reason}")]
pub struct PayloadError {
    /// Event type the payload claimed to be.
    pub kind: EventKind,
    /// What was wrong with it.
    pub reason: String,
}

impl EventPayload {
    /// The event type this payload belongs to.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RunStarted { .. } => EventKind::RunStarted,
            Self::PhaseChanged { .. } => EventKind::PhaseChanged,
            Self::ToolCalled { .. } => EventKind::ToolCalled,
            Self::ToolResult { .. } => EventKind::ToolResult,
            Self::FileChanged { .. } => EventKind::FileChanged,
            Self::ArtifactCreated { .. } => EventKind::ArtifactCreated,
            Self::CheckpointRequested { .. } => EventKind::CheckpointRequested,
            Self::CheckpointApproved { .. } => EventKind::CheckpointApproved,
            Self::CheckpointRejected { .. } => EventKind::CheckpointRejected,
            Self::CheckpointTimeout { .. } => EventKind::CheckpointTimeout,
            Self::DriftDetected { .. } => EventKind::DriftDetected,
            Self::RunCompleted { .. } => EventKind::RunCompleted,
            Self::RunFailed { .. } => EventKind::RunFailed,
        }
    }

    /// Severity an emitter should attach unless context says otherwise.
    ///
    /// `checkpoint.timeout` defaults to `warning`; the reject-on-timeout path
    /// upgrades it to `error`.
    #[must_use]
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::CheckpointRejected { .. } | Self::CheckpointTimeout { .. } => Severity::Warning,
            Self::DriftDetected { .. } | Self::RunFailed { .. } => Severity::Error,
            _ => Severity::Info,
        }
    }

    /// Semantic checks the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] naming the offending field.
    pub fn validate(&self) -> Result<(), PayloadError> {
        let fail = |reason: &str| {
            Err(PayloadError {
                kind: self.kind(),
                reason: reason.to_string(),
            })
        };
        match self {
            Self::PhaseChanged { from, to, .. } => {
                if from.as_ref() == Some(to) {
                    return fail("from and to are the same state");
                }
                Ok(())
            }
            Self::ToolCalled { tool_name, .. } | Self::ToolResult { tool_name, .. } => {
                if tool_name.is_empty() {
                    return fail("tool_name is empty");
                }
                Ok(())
            }
            Self::FileChanged { path, .. } => {
                if path.is_empty() {
                    return fail("path is empty");
                }
                Ok(())
            }
            Self::ArtifactCreated { sha256, .. } => {
                if sha256.len() != 64 || !sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return fail("sha256 is not a 64-char hex digest");
                }
                Ok(())
            }
            Self::CheckpointRequested {
                checkpoint_id,
                timeout_seconds,
                ..
            } => {
                if checkpoint_id.is_empty() {
                    return fail("checkpoint_id is empty");
                }
                if *timeout_seconds == 0 {
                    return fail("timeout_seconds is zero");
                }
                Ok(())
            }
            Self::RunFailed { error_message, .. } => {
                if error_message.is_empty() {
                    return fail("error_message is empty");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// A single record in a run's append-only event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    /// Globally unique event id; append is idempotent on it.
    pub event_id: Uuid,
    /// The run this event belongs to.
    pub run_id: String,
    /// Per-run sequence number, gap-free from 0.
    pub seq: i64,
    /// Emission timestamp.
    pub ts: DateTime<Utc>,
    /// Run state at emission time.
    pub phase: RunState,
    /// Severity.
    pub severity: Severity,
    /// The typed payload; the serde tag is the event type.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// The event's type, read from the payload.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: i64, payload: EventPayload) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            run_id: "run_test".into(),
            seq,
            ts: Utc::now(),
            phase: RunState::Executing,
            severity: payload.default_severity(),
            payload,
        }
    }

    #[test]
    fn serde_tag_is_the_dotted_event_name() {
        let ev = event(
            3,
            EventPayload::ToolCalled {
                tool_name: "read_file".into(),
                tool_use_id: Some("tu-1".into()),
                input: serde_json::json!({"path": "notes.md"}),
            },
        );
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "tool.called");
        assert_eq!(json["tool_name"], "read_file");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["phase"], "executing");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn kind_matches_wire_name_for_every_variant() {
        let payloads = vec![
            EventPayload::RunStarted {
                template: "t".into(),
                goal: "g".into(),
                sandbox_id: None,
            },
            EventPayload::PhaseChanged {
                from: None,
                to: RunState::Planning,
                reason: None,
            },
            EventPayload::ToolCalled {
                tool_name: "t".into(),
                tool_use_id: None,
                input: serde_json::Value::Null,
            },
            EventPayload::ToolResult {
                tool_name: "t".into(),
                tool_use_id: None,
                success: true,
                duration_ms: 1,
                output_preview: None,
            },
            EventPayload::FileChanged {
                path: "a.md".into(),
                summary: "created".into(),
            },
            EventPayload::ArtifactCreated {
                artifact_id: "a".into(),
                artifact_kind: "markdown".into(),
                destination_path: "outputs/a.md".into(),
                sha256: "0".repeat(64),
                size_bytes: 1,
            },
            EventPayload::CheckpointRequested {
                checkpoint_id: "cp".into(),
                action_type: "send_email".into(),
                preview: serde_json::Value::Null,
                timeout_seconds: 60,
                timeout_action: TimeoutAction::Reject,
            },
            EventPayload::CheckpointApproved {
                checkpoint_id: "cp".into(),
                actor_id: None,
                approved_from: ApprovalSource::Web,
            },
            EventPayload::CheckpointRejected {
                checkpoint_id: "cp".into(),
                reason: RejectReason::NeedsEdit,
                detail: None,
                actor_id: None,
            },
            EventPayload::CheckpointTimeout {
                checkpoint_id: "cp".into(),
                timeout_action: TimeoutAction::Approve,
                waited_seconds: 61,
            },
            EventPayload::DriftDetected {
                drift_type: DriftKind::UnauthorizedTool,
                details: "shell".into(),
                tool_name: Some("shell".into()),
                path: None,
            },
            EventPayload::RunCompleted {
                artifact_count: 1,
                total_cost_cents: 10,
                duration_ms: 100,
            },
            EventPayload::RunFailed {
                error_type: "agent_error".into(),
                error_message: "it broke".into(),
                recoverable: false,
                checkpoint_available: false,
            },
        ];
        assert_eq!(payloads.len(), 13, "closed vocabulary has 13 kinds");
        for p in payloads {
            let json = serde_json::to_value(&p).unwrap();
            assert_eq!(json["type"], p.kind().as_str());
        }
    }

    #[test]
    fn default_severities() {
        let drift = EventPayload::DriftDetected {
            drift_type: DriftKind::PathViolation,
            details: "".into(),
            tool_name: None,
            path: None,
        };
        assert_eq!(drift.default_severity(), Severity::Error);

        let rejected = EventPayload::CheckpointRejected {
            checkpoint_id: "cp".into(),
            reason: RejectReason::UserCancelled,
            detail: None,
            actor_id: None,
        };
        assert_eq!(rejected.default_severity(), Severity::Warning);

        let started = EventPayload::RunStarted {
            template: "t".into(),
            goal: "g".into(),
            sandbox_id: None,
        };
        assert_eq!(started.default_severity(), Severity::Info);
    }

    #[test]
    fn validate_rejects_self_loop_phase_change() {
        let p = EventPayload::PhaseChanged {
            from: Some(RunState::Executing),
            to: RunState::Executing,
            reason: None,
        };
        let err = p.validate().unwrap_err();
        assert_eq!(err.kind, EventKind::PhaseChanged);
    }

    #[test]
    fn validate_rejects_bad_sha() {
        let p = EventPayload::ArtifactCreated {
            artifact_id: "a".into(),
            artifact_kind: "markdown".into(),
            destination_path: "outputs/a.md".into(),
            sha256: "nothex".into(),
            size_bytes: 1,
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_tool_name() {
        let p = EventPayload::ToolCalled {
            tool_name: String::new(),
            tool_use_id: None,
            input: serde_json::Value::Null,
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn event_kind_filter_names_roundtrip() {
        let kinds = [
            EventKind::RunStarted,
            EventKind::PhaseChanged,
            EventKind::DriftDetected,
        ];
        for k in kinds {
            let json = serde_json::to_string(&k).unwrap();
            assert_eq!(json.trim_matches('"'), k.as_str());
            let back: EventKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, k);
        }
    }
}
