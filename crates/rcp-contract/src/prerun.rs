// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pre-run contract validation.
//!
//! Structural and semantic checks run before a contract is frozen onto a
//! run. A run may only start when no error-severity issue remains.

use rcp_core::{Contract, ConstraintRule};
use rcp_glob::PathPatterns;
use std::collections::BTreeSet;

/// How serious a pre-run issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IssueSeverity {
    /// Advisory; the run may start.
    Warning,
    /// Blocking; the run must not start.
    Error,
}

/// One problem found in a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreRunIssue {
    /// Severity.
    pub severity: IssueSeverity,
    /// Stable machine-readable code (e.g. `tool_policy_conflict`).
    pub code: &'static str,
    /// Human-readable description.
    pub message: String,
}

impl PreRunIssue {
    fn error(code: &'static str, message: String) -> Self {
        Self {
            severity: IssueSeverity::Error,
            code,
            message,
        }
    }

    fn warning(code: &'static str, message: String) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            code,
            message,
        }
    }
}

/// `true` when any issue is blocking.
#[must_use]
pub fn has_blocking_issues(issues: &[PreRunIssue]) -> bool {
    issues.iter().any(|i| i.severity == IssueSeverity::Error)
}

fn check_unique_ids<'a>(
    issues: &mut Vec<PreRunIssue>,
    list_name: &str,
    ids: impl Iterator<Item = &'a str>,
) {
    let mut seen = BTreeSet::new();
    for id in ids {
        if id.is_empty() {
            issues.push(PreRunIssue::error(
                "empty_id",
                format!("{list_name} contains an entry with an empty id"),
            ));
        } else if !seen.insert(id) {
            issues.push(PreRunIssue::error(
                "duplicate_id",
                format!("{list_name} id '{id}' is not unique"),
            ));
        }
    }
}

/// Validate a contract, returning every issue found.
///
/// Checks, in order: structural soundness, tool-policy conflicts, id
/// uniqueness within each list, reference integrity of output destinations,
/// and compilability of constraint patterns.
#[must_use]
pub fn validate_contract(contract: &Contract) -> Vec<PreRunIssue> {
    let mut issues = Vec::new();

    // Structural.
    if contract.goal.trim().is_empty() {
        issues.push(PreRunIssue::error(
            "empty_goal",
            "contract goal is empty".into(),
        ));
    }
    if contract.max_duration_seconds == 0 {
        issues.push(PreRunIssue::error(
            "zero_duration",
            "max_duration_seconds must be positive".into(),
        ));
    }
    if contract.max_cost_cents == Some(0) {
        issues.push(PreRunIssue::warning(
            "zero_budget",
            "max_cost_cents of 0 will block the first cost entry".into(),
        ));
    }
    for d in &contract.deliverables {
        if d.destination.trim().is_empty() {
            issues.push(PreRunIssue::error(
                "empty_destination",
                format!("deliverable '{}' has an empty destination", d.id),
            ));
        }
    }
    for (action, rule) in &contract.approval_rules {
        if rule.timeout_seconds == 0 {
            issues.push(PreRunIssue::error(
                "zero_approval_timeout",
                format!("approval rule for '{action}' has a zero timeout"),
            ));
        }
    }

    // Tool-policy conflict: a tool in both sets is always an authoring bug.
    let allowed: BTreeSet<&str> = contract
        .tool_policy
        .allowed
        .iter()
        .map(String::as_str)
        .collect();
    for blocked in &contract.tool_policy.blocked {
        if allowed.contains(blocked.as_str()) {
            issues.push(PreRunIssue::error(
                "tool_policy_conflict",
                format!("tool '{blocked}' is both allowed and blocked"),
            ));
        }
    }

    // Id uniqueness per list.
    check_unique_ids(
        &mut issues,
        "success_criteria",
        contract.success_criteria.iter().map(|s| s.id.as_str()),
    );
    check_unique_ids(
        &mut issues,
        "deliverables",
        contract.deliverables.iter().map(|d| d.id.as_str()),
    );
    check_unique_ids(
        &mut issues,
        "constraints",
        contract.constraints.iter().map(|c| c.id.as_str()),
    );

    // Reference integrity.
    let deliverable_ids: BTreeSet<&str> = contract
        .deliverables
        .iter()
        .map(|d| d.id.as_str())
        .collect();
    for dest in &contract.output_destinations {
        if !deliverable_ids.contains(dest.deliverable_id.as_str()) {
            issues.push(PreRunIssue::error(
                "unknown_deliverable",
                format!(
                    "output destination references unknown deliverable '{}'",
                    dest.deliverable_id
                ),
            ));
        }
    }

    // Constraint patterns must compile.
    for c in &contract.constraints {
        match &c.rule {
            ConstraintRule::PathBlocked { patterns } => {
                if let Err(e) = PathPatterns::compile(patterns) {
                    issues.push(PreRunIssue::error(
                        "bad_path_pattern",
                        format!("constraint '{}': {e}", c.id),
                    ));
                }
            }
            ConstraintRule::PatternBlocked { patterns } => {
                for p in patterns {
                    if let Err(e) = regex::Regex::new(p) {
                        issues.push(PreRunIssue::error(
                            "bad_regex",
                            format!("constraint '{}': {e}", c.id),
                        ));
                    }
                }
            }
            ConstraintRule::ToolBlocked { tools } => {
                if tools.is_empty() {
                    issues.push(PreRunIssue::warning(
                        "empty_tool_list",
                        format!("constraint '{}' blocks no tools", c.id),
                    ));
                }
            }
            ConstraintRule::Custom { validator, .. } => {
                if validator.is_empty() {
                    issues.push(PreRunIssue::error(
                        "empty_validator_name",
                        format!("constraint '{}' names no validator", c.id),
                    ));
                }
            }
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcp_core::{ContractBuilder, EvidenceKind};

    #[test]
    fn minimal_valid_contract_has_no_issues() {
        let contract = ContractBuilder::new("summarize the inbox")
            .allow_tool("read_file")
            .deliverable("d-1", "markdown", "outputs/{slug}.md", true)
            .build();
        let issues = validate_contract(&contract);
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
    }

    #[test]
    fn tool_policy_conflict_is_an_error() {
        let contract = ContractBuilder::new("g")
            .allow_tool("shell")
            .block_tool("shell")
            .build();
        let issues = validate_contract(&contract);
        assert!(has_blocking_issues(&issues));
        assert!(issues.iter().any(|i| i.code == "tool_policy_conflict"));
    }

    #[test]
    fn duplicate_ids_are_errors_per_list() {
        let contract = ContractBuilder::new("g")
            .success_criterion("sc-1", "a", EvidenceKind::Manual)
            .success_criterion("sc-1", "b", EvidenceKind::Manual)
            .deliverable("d-1", "markdown", "o.md", true)
            .deliverable("d-1", "markdown", "p.md", false)
            .build();
        let issues = validate_contract(&contract);
        let dupes: Vec<_> = issues.iter().filter(|i| i.code == "duplicate_id").collect();
        assert_eq!(dupes.len(), 2);
    }

    #[test]
    fn same_id_across_lists_is_fine() {
        let contract = ContractBuilder::new("g")
            .success_criterion("x", "a", EvidenceKind::Manual)
            .deliverable("x", "markdown", "o.md", true)
            .build();
        assert!(validate_contract(&contract).is_empty());
    }

    #[test]
    fn dangling_output_destination_is_an_error() {
        let contract = ContractBuilder::new("g")
            .deliverable("d-1", "markdown", "o.md", true)
            .output_destination("d-2", "outputs/else.md")
            .build();
        let issues = validate_contract(&contract);
        assert!(issues.iter().any(|i| i.code == "unknown_deliverable"));
        assert!(has_blocking_issues(&issues));
    }

    #[test]
    fn empty_goal_and_zero_duration_are_errors() {
        let contract = ContractBuilder::new("  ").max_duration_seconds(0).build();
        let issues = validate_contract(&contract);
        assert!(issues.iter().any(|i| i.code == "empty_goal"));
        assert!(issues.iter().any(|i| i.code == "zero_duration"));
    }

    #[test]
    fn bad_patterns_are_reported_with_constraint_id() {
        let contract = ContractBuilder::new("g")
            .constraint(
                "c-glob",
                "broken glob",
                rcp_core::ConstraintRule::PathBlocked {
                    patterns: vec!["[".into()],
                },
            )
            .constraint(
                "c-re",
                "broken regex",
                rcp_core::ConstraintRule::PatternBlocked {
                    patterns: vec!["(open".into()],
                },
            )
            .build();
        let issues = validate_contract(&contract);
        assert!(issues
            .iter()
            .any(|i| i.code == "bad_path_pattern" && i.message.contains("c-glob")));
        assert!(issues
            .iter()
            .any(|i| i.code == "bad_regex" && i.message.contains("c-re")));
    }

    #[test]
    fn warnings_do_not_block() {
        let contract = ContractBuilder::new("g")
            .constraint(
                "c-empty",
                "noop",
                rcp_core::ConstraintRule::ToolBlocked { tools: vec![] },
            )
            .build();
        let issues = validate_contract(&contract);
        assert!(!issues.is_empty());
        assert!(!has_blocking_issues(&issues));
    }
}
