// SPDX-License-Identifier: MIT OR Apache-2.0
//! rcp-contract
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Contract enforcement.
//!
//! Two surfaces: pre-run validation of the contract itself, and the runtime
//! tool-call gate that every agent action passes through. Violations come
//! back as typed [`Violation`]s carrying a ready-to-emit `drift.detected`
//! payload; the orchestrator owns emission so the event gets the run's real
//! next seq.

/// Custom constraint rule registry.
pub mod custom;
/// Consecutive-identical-call loop detection.
pub mod loopdetect;
/// Pre-run contract validation.
pub mod prerun;

pub use custom::{CustomRule, CustomRuleRegistry};
pub use loopdetect::LoopDetector;
pub use prerun::{has_blocking_issues, validate_contract, IssueSeverity, PreRunIssue};

use rcp_core::{Contract, ConstraintRule, DriftKind, EventPayload};
use rcp_glob::PathPatterns;
use regex::Regex;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::warn;

/// The candidate action evaluated at the tool-call gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolCallContext<'a> {
    /// Name of the tool being called.
    pub tool_name: &'a str,
    /// File path the call touches, if any.
    pub file_path: Option<&'a str>,
    /// Higher-level action label, if the caller has one.
    pub action: Option<&'a str>,
}

impl<'a> ToolCallContext<'a> {
    /// Gate context for a bare tool call.
    #[must_use]
    pub fn tool(tool_name: &'a str) -> Self {
        Self {
            tool_name,
            file_path: None,
            action: None,
        }
    }

    /// The subject string pattern rules match against: the first non-empty
    /// of `{action, tool_name, file_path}`.
    #[must_use]
    pub fn pattern_subject(&self) -> &'a str {
        if let Some(action) = self.action
            && !action.is_empty()
        {
            return action;
        }
        if !self.tool_name.is_empty() {
            return self.tool_name;
        }
        self.file_path.unwrap_or("")
    }
}

/// A contract breach detected at the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Drift classification.
    pub drift_type: DriftKind,
    /// Id of the breached constraint; `None` for tool-policy breaches.
    pub constraint_id: Option<String>,
    /// Human-readable detail.
    pub message: String,
    /// Offending tool, if any.
    pub tool_name: Option<String>,
    /// Offending path, if any.
    pub path: Option<String>,
}

impl Violation {
    /// The `drift.detected` payload for this violation.
    #[must_use]
    pub fn to_payload(&self) -> EventPayload {
        EventPayload::DriftDetected {
            drift_type: self.drift_type,
            details: self.message.clone(),
            tool_name: self.tool_name.clone(),
            path: self.path.clone(),
        }
    }
}

/// The contract could not be compiled into a validator.
#[derive(Debug, Error)]
pub enum CompileError {
    /// A path pattern failed to compile.
    #[error("constraint {constraint_id}: {source}")]
    BadPathPattern {
        /// Offending constraint.
        constraint_id: String,
        /// Compile failure.
        #[source]
        source: anyhow::Error,
    },

    /// A regular expression failed to compile.
    #[error("constraint {constraint_id}: invalid pattern '{pattern}'")]
    BadRegex {
        /// Offending constraint.
        constraint_id: String,
        /// The pattern that failed.
        pattern: String,
        /// Compile failure.
        #[source]
        source: regex::Error,
    },
}

enum CompiledConstraint {
    ToolBlocked {
        id: String,
        tools: BTreeSet<String>,
    },
    PathBlocked {
        id: String,
        patterns: PathPatterns,
    },
    PatternBlocked {
        id: String,
        regexes: Vec<Regex>,
    },
    Custom {
        id: String,
        validator: String,
        params: serde_json::Value,
    },
}

/// A contract compiled for the hot path: policy sets, glob sets, and
/// regexes are built once at run start.
pub struct ContractValidator {
    allowed: BTreeSet<String>,
    blocked: BTreeSet<String>,
    constraints: Vec<CompiledConstraint>,
    registry: CustomRuleRegistry,
}

impl ContractValidator {
    /// Compile a contract with an empty custom-rule registry.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError`] naming the first constraint whose patterns
    /// do not compile.
    pub fn compile(contract: &Contract) -> Result<Self, CompileError> {
        Self::compile_with(contract, CustomRuleRegistry::default())
    }

    /// Compile a contract against a registry of named custom validators.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError`] naming the first constraint whose patterns
    /// do not compile.
    pub fn compile_with(
        contract: &Contract,
        registry: CustomRuleRegistry,
    ) -> Result<Self, CompileError> {
        let mut constraints = Vec::with_capacity(contract.constraints.len());
        for c in &contract.constraints {
            let compiled = match &c.rule {
                ConstraintRule::ToolBlocked { tools } => CompiledConstraint::ToolBlocked {
                    id: c.id.clone(),
                    tools: tools.iter().cloned().collect(),
                },
                ConstraintRule::PathBlocked { patterns } => CompiledConstraint::PathBlocked {
                    id: c.id.clone(),
                    patterns: PathPatterns::compile(patterns).map_err(|source| {
                        CompileError::BadPathPattern {
                            constraint_id: c.id.clone(),
                            source,
                        }
                    })?,
                },
                ConstraintRule::PatternBlocked { patterns } => {
                    let mut regexes = Vec::with_capacity(patterns.len());
                    for p in patterns {
                        regexes.push(Regex::new(p).map_err(|source| CompileError::BadRegex {
                            constraint_id: c.id.clone(),
                            pattern: p.clone(),
                            source,
                        })?);
                    }
                    CompiledConstraint::PatternBlocked {
                        id: c.id.clone(),
                        regexes,
                    }
                }
                ConstraintRule::Custom { validator, params } => CompiledConstraint::Custom {
                    id: c.id.clone(),
                    validator: validator.clone(),
                    params: params.clone(),
                },
            };
            constraints.push(compiled);
        }

        Ok(Self {
            allowed: contract.tool_policy.allowed.iter().cloned().collect(),
            blocked: contract.tool_policy.blocked.iter().cloned().collect(),
            constraints,
            registry,
        })
    }

    /// Check a tool name against the allow/block policy.
    ///
    /// # Errors
    ///
    /// Returns an `unauthorized_tool` [`Violation`] when the tool is blocked
    /// or missing from a non-empty allowlist.
    pub fn check_tool_call(&self, tool_name: &str) -> Result<(), Violation> {
        if self.blocked.contains(tool_name) {
            return Err(Violation {
                drift_type: DriftKind::UnauthorizedTool,
                constraint_id: None,
                message: format!("tool '{tool_name}' is blocked by the contract"),
                tool_name: Some(tool_name.to_string()),
                path: None,
            });
        }
        if !self.allowed.is_empty() && !self.allowed.contains(tool_name) {
            return Err(Violation {
                drift_type: DriftKind::UnauthorizedTool,
                constraint_id: None,
                message: format!("tool '{tool_name}' is not in the contract allowlist"),
                tool_name: Some(tool_name.to_string()),
                path: None,
            });
        }
        Ok(())
    }

    /// Check a call context against every declarative constraint.
    ///
    /// Unknown custom validators are skipped with a warning, matching the
    /// contract author's expectation that an unregistered rule cannot fail
    /// a run it was never wired into.
    ///
    /// # Errors
    ///
    /// Returns the first [`Violation`], carrying the breached constraint id.
    pub fn check_constraints(&self, ctx: &ToolCallContext<'_>) -> Result<(), Violation> {
        for constraint in &self.constraints {
            match constraint {
                CompiledConstraint::ToolBlocked { id, tools } => {
                    if tools.contains(ctx.tool_name) {
                        return Err(Violation {
                            drift_type: DriftKind::ConstraintBreach,
                            constraint_id: Some(id.clone()),
                            message: format!(
                                "constraint {id}: tool '{}' is blocked",
                                ctx.tool_name
                            ),
                            tool_name: Some(ctx.tool_name.to_string()),
                            path: None,
                        });
                    }
                }
                CompiledConstraint::PathBlocked { id, patterns } => {
                    if let Some(path) = ctx.file_path
                        && let Some(pattern) = patterns.first_match(path)
                    {
                        return Err(Violation {
                            drift_type: DriftKind::PathViolation,
                            constraint_id: Some(id.clone()),
                            message: format!(
                                "constraint {id}: path '{path}' matches blocked pattern '{pattern}'"
                            ),
                            tool_name: Some(ctx.tool_name.to_string()),
                            path: Some(path.to_string()),
                        });
                    }
                }
                CompiledConstraint::PatternBlocked { id, regexes } => {
                    let subject = ctx.pattern_subject();
                    if let Some(regex) = regexes.iter().find(|r| r.is_match(subject)) {
                        return Err(Violation {
                            drift_type: DriftKind::ConstraintBreach,
                            constraint_id: Some(id.clone()),
                            message: format!(
                                "constraint {id}: '{subject}' matches blocked pattern '{}'",
                                regex.as_str()
                            ),
                            tool_name: Some(ctx.tool_name.to_string()),
                            path: ctx.file_path.map(String::from),
                        });
                    }
                }
                CompiledConstraint::Custom {
                    id,
                    validator,
                    params,
                } => match self.registry.get(validator) {
                    Some(rule) => {
                        if let Err(reason) = rule.check(ctx, params) {
                            return Err(Violation {
                                drift_type: DriftKind::ConstraintBreach,
                                constraint_id: Some(id.clone()),
                                message: format!("constraint {id} ({validator}): {reason}"),
                                tool_name: Some(ctx.tool_name.to_string()),
                                path: ctx.file_path.map(String::from),
                            });
                        }
                    }
                    None => {
                        warn!(
                            target: "rcp.contract",
                            constraint = %id,
                            validator = %validator,
                            "unknown custom validator, skipping"
                        );
                    }
                },
            }
        }
        Ok(())
    }

    /// The full gate: tool policy first, then constraints.
    ///
    /// # Errors
    ///
    /// Returns the first [`Violation`] from either check.
    pub fn check(&self, ctx: &ToolCallContext<'_>) -> Result<(), Violation> {
        self.check_tool_call(ctx.tool_name)?;
        self.check_constraints(ctx)
    }
}

impl std::fmt::Debug for ContractValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractValidator")
            .field("allowed", &self.allowed.len())
            .field("blocked", &self.blocked.len())
            .field("constraints", &self.constraints.len())
            .finish()
    }
}
