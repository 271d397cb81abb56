// SPDX-License-Identifier: MIT OR Apache-2.0
//! The frozen run contract: what a run may and must do.

use crate::approval::TimeoutAction;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What kind of evidence satisfies a success criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// A produced artifact demonstrates the criterion.
    Artifact,
    /// Log output demonstrates the criterion.
    Log,
    /// An external URL demonstrates the criterion.
    Url,
    /// A human must judge the criterion.
    Manual,
}

/// A single measurable success criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SuccessCriterion {
    /// Unique id within the contract.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Evidence kind that satisfies it.
    pub evidence: EvidenceKind,
}

/// A deliverable the run is expected to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Deliverable {
    /// Unique id within the contract.
    pub id: String,
    /// Deliverable kind (e.g. `"markdown"`, `"dataset"`).
    pub kind: String,
    /// Destination path pattern. Recognized variables: `{run_id}`,
    /// `{year}`, `{month}`, `{slug}`.
    pub destination: String,
    /// Whether the run fails its contract without this deliverable.
    pub required: bool,
}

/// Rule body of a [`Constraint`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintRule {
    /// The listed tools must never be called.
    ToolBlocked {
        /// Blocked tool names.
        tools: Vec<String>,
    },
    /// Paths matching any pattern must never be touched.
    ///
    /// Glob semantics: `*` matches within a path segment, `**` crosses
    /// segments, `?` matches a single character; patterns are anchored at
    /// both ends.
    PathBlocked {
        /// Blocked path glob patterns.
        patterns: Vec<String>,
    },
    /// The call context must not match any of these regular expressions.
    ///
    /// Matched against the first non-empty of `{action, tool_name,
    /// file_path}`.
    PatternBlocked {
        /// Blocking regular expressions.
        patterns: Vec<String>,
    },
    /// Deferred to a named validator in the custom-rule registry.
    Custom {
        /// Registry name of the validator.
        validator: String,
        /// Opaque parameters passed to the validator.
        #[serde(default)]
        params: serde_json::Value,
    },
}

/// A declarative safety constraint checked at the tool-call gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Constraint {
    /// Unique id within the contract.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// The rule body.
    #[serde(flatten)]
    pub rule: ConstraintRule,
}

/// Tool allow/block policy. The two sets must be disjoint.
///
/// An empty `allowed` list means "no allowlist" — any tool not blocked may
/// run. A non-empty `allowed` list is exhaustive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ToolPolicy {
    /// Tool allowlist. Empty means unrestricted (modulo `blocked`).
    #[serde(default)]
    pub allowed: Vec<String>,
    /// Tool denylist. Always wins over `allowed`.
    #[serde(default)]
    pub blocked: Vec<String>,
}

/// Approval behavior for one side-effectful action kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ApprovalRule {
    /// Optional condition expression gating whether approval is required.
    pub condition: Option<String>,
    /// Seconds before the pending approval expires.
    pub timeout_seconds: u64,
    /// What to do when the approval expires unresolved.
    pub timeout_action: TimeoutAction,
}

/// Maps a deliverable to its vault destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OutputDestination {
    /// Id of the deliverable being routed. Must exist in `deliverables`.
    pub deliverable_id: String,
    /// Destination path pattern (same variables as deliverable patterns).
    pub destination: String,
}

/// The immutable statement of what a run may and must do.
///
/// Frozen onto the run row at creation; the validator compiles it once and
/// enforces it at every tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Contract {
    /// The user goal, free text.
    pub goal: String,
    /// Ordered success criteria.
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    /// Expected deliverables.
    #[serde(default)]
    pub deliverables: Vec<Deliverable>,
    /// Safety constraints checked at the tool-call gate.
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Tool allow/block policy.
    #[serde(default)]
    pub tool_policy: ToolPolicy,
    /// External integration scopes granted to the run.
    #[serde(default)]
    pub integration_scopes: Vec<String>,
    /// Approval rules keyed by action kind (e.g. `"send_email"`).
    #[serde(default)]
    pub approval_rules: BTreeMap<String, ApprovalRule>,
    /// Hard wall-clock cap for the whole run.
    pub max_duration_seconds: u64,
    /// Optional spend cap in cents.
    pub max_cost_cents: Option<u64>,
    /// Input files staged into the sandbox.
    #[serde(default)]
    pub input_files: Vec<String>,
    /// Vault routing for deliverables.
    #[serde(default)]
    pub output_destinations: Vec<OutputDestination>,
}

/// Default run duration cap: one hour.
pub const DEFAULT_MAX_DURATION_SECONDS: u64 = 3_600;

/// Builder for constructing [`Contract`]s ergonomically.
///
/// # Examples
///
/// ```
/// use rcp_core::{ContractBuilder, EvidenceKind};
///
/// let contract = ContractBuilder::new("digest the support inbox")
///     .allow_tool("read_file")
///     .block_tool("shell")
///     .success_criterion("sc-1", "a digest exists", EvidenceKind::Artifact)
///     .deliverable("d-1", "markdown", "outputs/{year}/{month}/{run_id}_{slug}.md", true)
///     .max_cost_cents(5_000)
///     .build();
///
/// assert_eq!(contract.tool_policy.allowed, vec!["read_file"]);
/// assert_eq!(contract.max_cost_cents, Some(5_000));
/// ```
#[derive(Debug)]
pub struct ContractBuilder {
    contract: Contract,
}

impl ContractBuilder {
    /// Start a contract for the given goal.
    #[must_use]
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            contract: Contract {
                goal: goal.into(),
                success_criteria: Vec::new(),
                deliverables: Vec::new(),
                constraints: Vec::new(),
                tool_policy: ToolPolicy::default(),
                integration_scopes: Vec::new(),
                approval_rules: BTreeMap::new(),
                max_duration_seconds: DEFAULT_MAX_DURATION_SECONDS,
                max_cost_cents: None,
                input_files: Vec::new(),
                output_destinations: Vec::new(),
            },
        }
    }

    /// Add a tool to the allowlist.
    #[must_use]
    pub fn allow_tool(mut self, tool: impl Into<String>) -> Self {
        self.contract.tool_policy.allowed.push(tool.into());
        self
    }

    /// Add a tool to the denylist.
    #[must_use]
    pub fn block_tool(mut self, tool: impl Into<String>) -> Self {
        self.contract.tool_policy.blocked.push(tool.into());
        self
    }

    /// Add a success criterion.
    #[must_use]
    pub fn success_criterion(
        mut self,
        id: impl Into<String>,
        description: impl Into<String>,
        evidence: EvidenceKind,
    ) -> Self {
        self.contract.success_criteria.push(SuccessCriterion {
            id: id.into(),
            description: description.into(),
            evidence,
        });
        self
    }

    /// Add a deliverable.
    #[must_use]
    pub fn deliverable(
        mut self,
        id: impl Into<String>,
        kind: impl Into<String>,
        destination: impl Into<String>,
        required: bool,
    ) -> Self {
        self.contract.deliverables.push(Deliverable {
            id: id.into(),
            kind: kind.into(),
            destination: destination.into(),
            required,
        });
        self
    }

    /// Add a constraint.
    #[must_use]
    pub fn constraint(
        mut self,
        id: impl Into<String>,
        description: impl Into<String>,
        rule: ConstraintRule,
    ) -> Self {
        self.contract.constraints.push(Constraint {
            id: id.into(),
            description: description.into(),
            rule,
        });
        self
    }

    /// Set the approval rule for an action kind.
    #[must_use]
    pub fn approval_rule(mut self, action_kind: impl Into<String>, rule: ApprovalRule) -> Self {
        self.contract.approval_rules.insert(action_kind.into(), rule);
        self
    }

    /// Set the run duration cap.
    #[must_use]
    pub fn max_duration_seconds(mut self, seconds: u64) -> Self {
        self.contract.max_duration_seconds = seconds;
        self
    }

    /// Set the spend cap in cents.
    #[must_use]
    pub fn max_cost_cents(mut self, cents: u64) -> Self {
        self.contract.max_cost_cents = Some(cents);
        self
    }

    /// Stage an input file.
    #[must_use]
    pub fn input_file(mut self, path: impl Into<String>) -> Self {
        self.contract.input_files.push(path.into());
        self
    }

    /// Grant an integration scope.
    #[must_use]
    pub fn integration_scope(mut self, scope: impl Into<String>) -> Self {
        self.contract.integration_scopes.push(scope.into());
        self
    }

    /// Route a deliverable to a vault destination.
    #[must_use]
    pub fn output_destination(
        mut self,
        deliverable_id: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        self.contract.output_destinations.push(OutputDestination {
            deliverable_id: deliverable_id.into(),
            destination: destination.into(),
        });
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> Contract {
        self.contract
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let c = ContractBuilder::new("do the thing").build();
        assert_eq!(c.goal, "do the thing");
        assert_eq!(c.max_duration_seconds, DEFAULT_MAX_DURATION_SECONDS);
        assert!(c.max_cost_cents.is_none());
        assert!(c.tool_policy.allowed.is_empty());
        assert!(c.tool_policy.blocked.is_empty());
    }

    #[test]
    fn constraint_rule_serde_is_tagged() {
        let rule = ConstraintRule::PathBlocked {
            patterns: vec!["secrets/**".into()],
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["kind"], "path_blocked");
        assert_eq!(json["patterns"][0], "secrets/**");

        let back: ConstraintRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn constraint_flattens_rule_fields() {
        let c = Constraint {
            id: "c-1".into(),
            description: "no shell".into(),
            rule: ConstraintRule::ToolBlocked {
                tools: vec!["shell".into()],
            },
        };
        let json = serde_json::to_value(&c).unwrap();
        // Rule fields sit alongside id/description, not nested.
        assert_eq!(json["kind"], "tool_blocked");
        assert_eq!(json["id"], "c-1");
    }

    #[test]
    fn contract_roundtrips_through_json() {
        let c = ContractBuilder::new("roundtrip")
            .allow_tool("read_file")
            .deliverable("d-1", "markdown", "outputs/{slug}.md", true)
            .output_destination("d-1", "outputs/{year}/{month}/{slug}.md")
            .constraint(
                "c-1",
                "no env files",
                ConstraintRule::PathBlocked {
                    patterns: vec!["**/.env".into()],
                },
            )
            .build();
        let json = serde_json::to_string(&c).unwrap();
        let back: Contract = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn custom_rule_defaults_params_to_null() {
        let json = r#"{"kind":"custom","validator":"no_weekends"}"#;
        let rule: ConstraintRule = serde_json::from_str(json).unwrap();
        match rule {
            ConstraintRule::Custom { validator, params } => {
                assert_eq!(validator, "no_weekends");
                assert!(params.is_null());
            }
            other => panic!("expected custom rule, got {other:?}"),
        }
    }
}
