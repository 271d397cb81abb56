// SPDX-License-Identifier: MIT OR Apache-2.0
//! rcp-error
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The closed error taxonomy and categorized retry.
//!
//! Errors reaching the orchestrator are classified into one of eight
//! categories; each category carries its own retry budget and backoff
//! schedule. Exhausted retries produce a templated user-visible message and
//! a `run.failed` payload — raw error strings and stack traces never reach
//! the user.

use chrono::Utc;
use rcp_core::{EventPayload, PartialCapture, Run, RunState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// The closed set of error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Rate limits, connection resets, flaky upstreams.
    Transient,
    /// A tool invocation failed.
    ToolFailure,
    /// The agent produced an unrecoverable error.
    AgentError,
    /// The sandbox died underneath the run.
    SandboxCrash,
    /// The agent breached its contract.
    ContractViolation,
    /// The run exceeded its duration cap.
    Timeout,
    /// A required approval expired.
    ApprovalTimeout,
    /// The run stopped making progress.
    Stalled,
}

impl ErrorCategory {
    /// Wire name of the category.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::ToolFailure => "tool_failure",
            Self::AgentError => "agent_error",
            Self::SandboxCrash => "sandbox_crash",
            Self::ContractViolation => "contract_violation",
            Self::Timeout => "timeout",
            Self::ApprovalTimeout => "approval_timeout",
            Self::Stalled => "stalled",
        }
    }

    /// The retry policy for this category.
    #[must_use]
    pub fn retry_policy(self) -> RetryPolicy {
        match self {
            Self::Transient => RetryPolicy {
                max_retries: 3,
                base_delay_ms: 2_000,
                exponential: true,
                cap_ms: 16_000,
            },
            Self::ToolFailure => RetryPolicy {
                max_retries: 2,
                base_delay_ms: 1_000,
                exponential: true,
                cap_ms: 4_000,
            },
            Self::SandboxCrash => RetryPolicy {
                max_retries: 1,
                base_delay_ms: 5_000,
                exponential: false,
                cap_ms: 5_000,
            },
            Self::AgentError
            | Self::ContractViolation
            | Self::Timeout
            | Self::ApprovalTimeout
            | Self::Stalled => RetryPolicy::none(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category retry budget and backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed before the error becomes terminal.
    pub max_retries: u32,
    /// First delay.
    pub base_delay_ms: u64,
    /// Whether delays double per retry.
    pub exponential: bool,
    /// Delay ceiling.
    pub cap_ms: u64,
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            exponential: false,
            cap_ms: 0,
        }
    }

    /// Delay before retry number `n` (0-based: the first retry is `n = 0`).
    #[must_use]
    pub fn delay_for(&self, n: u32) -> Duration {
        let ms = if self.exponential {
            let factor = 1u64.checked_shl(n).unwrap_or(u64::MAX);
            self.base_delay_ms.saturating_mul(factor).min(self.cap_ms)
        } else {
            self.base_delay_ms
        };
        Duration::from_millis(ms)
    }
}

/// Classify an error by substring heuristics over its type and message.
///
/// Used when the caller has no better category; the checks run in
/// decreasing specificity so "sandbox timed out" lands on `sandbox_crash`
/// rather than `transient`.
#[must_use]
pub fn classify(error_type: &str, message: &str) -> ErrorCategory {
    let haystack = format!("{error_type} {message}").to_lowercase();
    let contains = |needles: &[&str]| needles.iter().any(|n| haystack.contains(n));

    if contains(&["constraint", "not allowed", "drift", "policy violation"]) {
        ErrorCategory::ContractViolation
    } else if contains(&["sandbox", "oom", "crashed", "killed"]) {
        ErrorCategory::SandboxCrash
    } else if contains(&[
        "rate limit",
        "rate_limited",
        "econnrefused",
        "econnreset",
        "timed out",
        "too many requests",
        "unavailable",
    ]) {
        ErrorCategory::Transient
    } else if contains(&["tool failed", "tool error", "tool_failed"]) {
        ErrorCategory::ToolFailure
    } else if contains(&["stalled", "no progress"]) {
        ErrorCategory::Stalled
    } else {
        ErrorCategory::AgentError
    }
}

/// An error as reported to the handler.
#[derive(Debug, Clone, Default)]
pub struct Fault {
    /// Machine error type (e.g. `"TOOL_RATE_LIMITED"`).
    pub error_type: String,
    /// Internal message. Never shown to users.
    pub message: String,
    /// Category, when the caller already knows it.
    pub category: Option<ErrorCategory>,
}

impl Fault {
    /// A fault with type and message, classified by the handler.
    #[must_use]
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            category: None,
        }
    }

    /// A fault with a pre-assigned category.
    #[must_use]
    pub fn categorized(
        category: ErrorCategory,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            category: Some(category),
        }
    }
}

/// Context interpolated into user-visible messages.
#[derive(Debug, Clone, Default)]
pub struct FaultContext {
    /// Tool involved, if any.
    pub tool_name: Option<String>,
    /// Sandbox involved, if any.
    pub sandbox_id: Option<String>,
    /// Operative timeout, if the error was a timeout.
    pub timeout_seconds: Option<u64>,
}

/// Partial results supplied by the orchestrator at failure time.
#[derive(Debug, Clone, Default)]
pub struct PartialInputs {
    /// Ids of artifacts produced so far.
    pub artifact_ids: Vec<String>,
    /// Workspace paths changed so far.
    pub files_changed: Vec<String>,
}

/// What the handler decided.
#[derive(Debug, Clone)]
pub struct Disposition {
    /// `true` when the caller should retry after `retry_delay`.
    pub should_retry: bool,
    /// Backoff before the retry; `None` when not retrying.
    pub retry_delay: Option<Duration>,
    /// The resolved category.
    pub category: ErrorCategory,
    /// User-visible narration.
    pub user_message: String,
    /// Partial results to preserve; set only on terminal failure.
    pub partial: Option<PartialCapture>,
    /// State to transition to; set only on terminal failure.
    pub new_state: Option<RunState>,
    /// `run.failed` payload; set only on terminal failure.
    pub failure_payload: Option<EventPayload>,
}

/// The error handler: per-`{run, category}` retry counters plus message
/// templating.
#[derive(Debug, Default)]
pub struct ErrorHandler {
    counters: Mutex<HashMap<(String, ErrorCategory), u32>>,
}

impl ErrorHandler {
    /// Fresh handler with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether to retry `fault` or fail the run.
    ///
    /// While the category's retry budget lasts: increments the counter,
    /// returns the backoff delay, and leaves the run state alone.
    /// Afterwards: captures partial results and returns the `failed`
    /// transition with its `run.failed` payload.
    pub fn handle(
        &self,
        run: &Run,
        fault: &Fault,
        ctx: &FaultContext,
        partial: Option<PartialInputs>,
    ) -> Disposition {
        let category = fault
            .category
            .unwrap_or_else(|| classify(&fault.error_type, &fault.message));
        let policy = category.retry_policy();

        let retries_so_far = {
            let mut counters = self.counters.lock().expect("retry counter lock poisoned");
            let count = counters
                .entry((run.run_id.clone(), category))
                .or_insert(0);
            if *count < policy.max_retries {
                let n = *count;
                *count += 1;
                debug!(
                    target: "rcp.error",
                    run_id = %run.run_id,
                    %category,
                    retry = n + 1,
                    max = policy.max_retries,
                    "retrying after backoff"
                );
                return Disposition {
                    should_retry: true,
                    retry_delay: Some(policy.delay_for(n)),
                    category,
                    user_message: user_message(category, ctx, n + 1, policy.max_retries),
                    partial: None,
                    new_state: None,
                    failure_payload: None,
                };
            }
            *count
        };

        // Retries exhausted (or never available): terminal failure.
        let message = user_message(category, ctx, retries_so_far, policy.max_retries);
        info!(
            target: "rcp.error",
            run_id = %run.run_id,
            %category,
            retries = retries_so_far,
            "error is terminal, failing run"
        );

        let inputs = partial.unwrap_or_default();
        let capture = PartialCapture {
            artifact_ids: inputs.artifact_ids,
            files_changed: inputs.files_changed,
            last_phase: run.state,
            last_event_seq: run.last_event_seq,
            captured_at: Utc::now(),
        };

        Disposition {
            should_retry: false,
            retry_delay: None,
            category,
            user_message: message.clone(),
            partial: Some(capture),
            new_state: Some(RunState::Failed),
            failure_payload: Some(EventPayload::RunFailed {
                error_type: category.as_str().to_string(),
                error_message: message,
                recoverable: false,
                checkpoint_available: false,
            }),
        }
    }

    /// Retries consumed so far for a `{run, category}` pair.
    #[must_use]
    pub fn retry_count(&self, run_id: &str, category: ErrorCategory) -> u32 {
        let counters = self.counters.lock().expect("retry counter lock poisoned");
        counters
            .get(&(run_id.to_string(), category))
            .copied()
            .unwrap_or(0)
    }

    /// Clear every counter for a run. Called on successful completion.
    pub fn clear_run(&self, run_id: &str) {
        let mut counters = self.counters.lock().expect("retry counter lock poisoned");
        counters.retain(|(r, _), _| r != run_id);
    }
}

/// Templated user-visible narration. No stack traces, no internal types.
fn user_message(
    category: ErrorCategory,
    ctx: &FaultContext,
    retries: u32,
    max_retries: u32,
) -> String {
    let tool = ctx.tool_name.as_deref().unwrap_or("a tool");
    match category {
        ErrorCategory::Transient => format!(
            "A temporary service error kept recurring (retried {retries} of {max_retries} times). \
             Try the run again in a few minutes."
        ),
        ErrorCategory::ToolFailure => format!(
            "The tool '{tool}' kept failing (retried {retries} of {max_retries} times)."
        ),
        ErrorCategory::AgentError => {
            "The agent hit an unexpected error and could not continue.".to_string()
        }
        ErrorCategory::SandboxCrash => match &ctx.sandbox_id {
            Some(id) => format!("The sandbox environment ({id}) crashed and could not be recovered."),
            None => "The sandbox environment crashed and could not be recovered.".to_string(),
        },
        ErrorCategory::ContractViolation => match &ctx.tool_name {
            Some(tool) => format!(
                "Contract violation: the agent attempted to use '{tool}' outside its contract."
            ),
            None => "Contract violation: the agent attempted an action outside its contract."
                .to_string(),
        },
        ErrorCategory::Timeout => match ctx.timeout_seconds {
            Some(secs) => format!("The run exceeded its time limit of {secs} seconds."),
            None => "The run exceeded its time limit.".to_string(),
        },
        ErrorCategory::ApprovalTimeout => match ctx.timeout_seconds {
            Some(secs) => {
                format!("A required approval was not resolved within {secs} seconds.")
            }
            None => "A required approval was not resolved in time.".to_string(),
        },
        ErrorCategory::Stalled => {
            "The run stopped making progress and was ended.".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcp_core::ContractBuilder;

    fn run() -> Run {
        let mut r = Run::new(
            rcp_core::new_run_id(),
            "ws-1",
            "tpl",
            "1",
            ContractBuilder::new("goal").build(),
        );
        r.state = RunState::Executing;
        r.last_event_seq = 4;
        r
    }

    #[test]
    fn classify_follows_the_heuristics() {
        assert_eq!(classify("TOOL_RATE_LIMITED", ""), ErrorCategory::Transient);
        assert_eq!(classify("", "connect ECONNREFUSED"), ErrorCategory::Transient);
        assert_eq!(classify("", "request timed out"), ErrorCategory::Transient);
        assert_eq!(classify("", "sandbox process crashed"), ErrorCategory::SandboxCrash);
        assert_eq!(classify("", "container OOM killed"), ErrorCategory::SandboxCrash);
        assert_eq!(
            classify("", "constraint c-1 breached"),
            ErrorCategory::ContractViolation
        );
        assert_eq!(
            classify("", "tool shell is not allowed"),
            ErrorCategory::ContractViolation
        );
        assert_eq!(classify("", "no progress for 120s"), ErrorCategory::Stalled);
        assert_eq!(classify("SOMETHING_ELSE", "???"), ErrorCategory::AgentError);
    }

    #[test]
    fn sandbox_beats_transient_on_mixed_messages() {
        assert_eq!(
            classify("", "sandbox timed out"),
            ErrorCategory::SandboxCrash
        );
    }

    #[test]
    fn retry_schedule_doubles_to_the_cap() {
        let p = ErrorCategory::Transient.retry_policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(2_000));
        assert_eq!(p.delay_for(1), Duration::from_millis(4_000));
        assert_eq!(p.delay_for(2), Duration::from_millis(8_000));
        assert_eq!(p.delay_for(3), Duration::from_millis(16_000));
        assert_eq!(p.delay_for(10), Duration::from_millis(16_000));

        let fixed = ErrorCategory::SandboxCrash.retry_policy();
        assert_eq!(fixed.delay_for(0), Duration::from_millis(5_000));
        assert_eq!(fixed.delay_for(5), Duration::from_millis(5_000));
    }

    #[test]
    fn transient_retries_then_fails() {
        let handler = ErrorHandler::new();
        let r = run();
        let fault = Fault::new("TOOL_RATE_LIMITED", "429 from upstream");
        let ctx = FaultContext::default();

        let first = handler.handle(&r, &fault, &ctx, None);
        assert!(first.should_retry);
        assert_eq!(first.retry_delay, Some(Duration::from_millis(2_000)));
        assert!(first.new_state.is_none());

        let second = handler.handle(&r, &fault, &ctx, None);
        assert_eq!(second.retry_delay, Some(Duration::from_millis(4_000)));

        let third = handler.handle(&r, &fault, &ctx, None);
        assert_eq!(third.retry_delay, Some(Duration::from_millis(8_000)));
        assert_eq!(handler.retry_count(&r.run_id, ErrorCategory::Transient), 3);

        let fourth = handler.handle(&r, &fault, &ctx, None);
        assert!(!fourth.should_retry);
        assert_eq!(fourth.new_state, Some(RunState::Failed));
        assert!(fourth.failure_payload.is_some());
    }

    #[test]
    fn zero_retry_categories_fail_immediately() {
        let handler = ErrorHandler::new();
        let r = run();
        let fault = Fault::categorized(
            ErrorCategory::ContractViolation,
            "DRIFT",
            "blocked tool shell",
        );
        let ctx = FaultContext {
            tool_name: Some("shell".into()),
            ..FaultContext::default()
        };

        let d = handler.handle(&r, &fault, &ctx, None);
        assert!(!d.should_retry);
        assert!(d.user_message.starts_with("Contract violation"));
        match d.failure_payload {
            Some(EventPayload::RunFailed {
                error_type,
                recoverable,
                ..
            }) => {
                assert_eq!(error_type, "contract_violation");
                assert!(!recoverable);
            }
            other => panic!("expected run.failed payload, got {other:?}"),
        }
    }

    #[test]
    fn terminal_failure_captures_partial_results() {
        let handler = ErrorHandler::new();
        let r = run();
        let fault = Fault::categorized(ErrorCategory::AgentError, "X", "boom");
        let d = handler.handle(
            &r,
            &fault,
            &FaultContext::default(),
            Some(PartialInputs {
                artifact_ids: vec!["art_1".into()],
                files_changed: vec!["notes.md".into()],
            }),
        );
        let partial = d.partial.expect("partial capture on terminal failure");
        assert_eq!(partial.artifact_ids, vec!["art_1"]);
        assert_eq!(partial.last_phase, RunState::Executing);
        assert_eq!(partial.last_event_seq, 4);
    }

    #[test]
    fn counters_are_per_run_and_category() {
        let handler = ErrorHandler::new();
        let a = run();
        let b = run();
        let transient = Fault::new("RATE_LIMIT", "rate limit");
        let tool = Fault::categorized(ErrorCategory::ToolFailure, "T", "tool failed");

        handler.handle(&a, &transient, &FaultContext::default(), None);
        handler.handle(&a, &tool, &FaultContext::default(), None);
        handler.handle(&b, &transient, &FaultContext::default(), None);

        assert_eq!(handler.retry_count(&a.run_id, ErrorCategory::Transient), 1);
        assert_eq!(handler.retry_count(&a.run_id, ErrorCategory::ToolFailure), 1);
        assert_eq!(handler.retry_count(&b.run_id, ErrorCategory::Transient), 1);
        assert_eq!(handler.retry_count(&b.run_id, ErrorCategory::ToolFailure), 0);
    }

    #[test]
    fn clear_run_resets_counters() {
        let handler = ErrorHandler::new();
        let r = run();
        handler.handle(
            &r,
            &Fault::new("RATE_LIMIT", "rate limit"),
            &FaultContext::default(),
            None,
        );
        assert_eq!(handler.retry_count(&r.run_id, ErrorCategory::Transient), 1);
        handler.clear_run(&r.run_id);
        assert_eq!(handler.retry_count(&r.run_id, ErrorCategory::Transient), 0);
    }

    #[test]
    fn user_messages_never_leak_internals() {
        let handler = ErrorHandler::new();
        let r = run();
        let fault = Fault::categorized(
            ErrorCategory::AgentError,
            "InternalPanicError",
            "thread panicked at src/agent.rs:42",
        );
        let d = handler.handle(&r, &fault, &FaultContext::default(), None);
        assert!(!d.user_message.contains("panicked"));
        assert!(!d.user_message.contains("src/agent.rs"));
    }

    #[test]
    fn timeout_messages_interpolate_the_cap() {
        let handler = ErrorHandler::new();
        let r = run();
        let fault = Fault::categorized(ErrorCategory::ApprovalTimeout, "T", "expired");
        let ctx = FaultContext {
            timeout_seconds: Some(60),
            ..FaultContext::default()
        };
        let d = handler.handle(&r, &fault, &ctx, None);
        assert!(d.user_message.contains("60 seconds"));
    }
}
