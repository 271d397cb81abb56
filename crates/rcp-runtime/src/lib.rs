// SPDX-License-Identifier: MIT OR Apache-2.0
//! rcp-runtime
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Orchestration layer.
//!
//! Responsibilities:
//! - own one run from creation through terminal state
//! - sequence phases and gate every tool call through the validator
//! - broker approvals, costs, and error handling
//! - tear down the sandbox and write the trace bundle on the way out
//!
//! The process-scoped [`ControlPlane`] owns every subsystem handle and
//! hands out one [`Orchestrator`] per run; request handlers receive the
//! control plane by reference instead of constructing infrastructure
//! per call.

/// Run metrics and aggregation.
pub mod metrics;
/// The sandbox adapter seam and its mock.
pub mod sandbox;

pub use metrics::{MetricsSummary, RunCounters, RunMetrics};
pub use sandbox::{MockSandbox, Sandbox, SandboxArtifact, SandboxEnv, SandboxToolCall, ToolOutcome};

use chrono::Utc;
use rcp_approvals::{ApprovalError, ApprovalRequest, ApprovalService};
use rcp_config::ControlPlaneConfig;
use rcp_contract::{
    has_blocking_issues, validate_contract, CompileError, ContractValidator, CustomRuleRegistry,
    LoopDetector, PreRunIssue, ToolCallContext, Violation,
};
use rcp_core::{
    ArtifactManifest, ArtifactStatus, Contract, CostBreakdown, EventPayload, PendingApproval,
    Run, RunError, RunState, Severity, TimeoutAction,
};
use rcp_cost::{AddOutcome, BudgetLimits, CostError, CostKind, CostTracker};
use rcp_error::{Disposition, ErrorCategory, ErrorHandler, Fault, FaultContext, PartialInputs};
use rcp_log::EventLog;
use rcp_state::UserAction;
use rcp_store::{CreateRunOptions, Narration, RunStore, StoreError};
use rcp_trace::{TraceBundle, TraceError, TraceWriter};
use rcp_vault::{VaultDoc, VaultError, VaultWriter};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the orchestrator loop is doing, distinct from the run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Constructed, not yet started.
    Idle,
    /// Start sequence in progress.
    Starting,
    /// Driving phase work.
    Running,
    /// Run paused by the user.
    Paused,
    /// Suspended on a pending approval.
    AwaitingApproval,
    /// Teardown in progress.
    Stopping,
    /// Fully torn down.
    Stopped,
    /// Terminal failure observed.
    Error,
}

/// Why the orchestrator stopped driving its run.
///
/// Only the first cause is recorded; the teardown that follows any stop
/// never overwrites it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// The user asked for the run to be cancelled.
    UserCancel,
    /// The run's duration cap expired.
    DurationExceeded,
    /// The caller stopped the run after the budget gate refused spend.
    BudgetExhausted,
    /// Ordinary teardown at the end of the run.
    Teardown,
}

/// The orchestrator loop's mutable bookkeeping, under a single lock so the
/// state and the reason it is winding down can never disagree.
#[derive(Debug, Clone, Copy)]
struct LoopState {
    state: OrchestratorState,
    stop_cause: Option<StopCause>,
}

/// Errors from orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Pre-run validation found blocking issues; nothing was created.
    #[error("contract rejected with {} blocking issue(s)", .issues.len())]
    ContractRejected {
        /// Every issue found, warnings included.
        issues: Vec<PreRunIssue>,
    },

    /// The contract could not be compiled for the gate.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An approval operation failed.
    #[error(transparent)]
    Approval(#[from] ApprovalError),

    /// The budget gate refused a cost entry.
    #[error(transparent)]
    Budget(#[from] CostError),

    /// The sandbox host failed.
    #[error("sandbox operation failed")]
    Sandbox(#[source] anyhow::Error),

    /// The vault sink failed.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// The trace writer failed.
    #[error(transparent)]
    Trace(#[from] TraceError),

    /// The run failed terminally through the error handler.
    #[error("{user_message}")]
    Failed {
        /// The resolved category.
        category: ErrorCategory,
        /// The user-visible narration.
        user_message: String,
    },

    /// The run was cancelled while the operation was in flight.
    #[error("run cancelled")]
    Cancelled,

    /// The run is not in a phase this operation applies to.
    #[error("phase cannot advance from {state}")]
    PhaseNotAdvanceable {
        /// The current run state.
        state: RunState,
    },
}

/// Options for starting a run.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Workspace the run belongs to.
    pub workspace_id: String,
    /// Template id.
    pub template_id: String,
    /// Template version.
    pub template_version: String,
    /// The contract to freeze.
    pub contract: Contract,
    /// Opaque seeds copied into the trace bundle.
    pub calibration_seeds: Vec<serde_json::Value>,
}

/// Options for recording an artifact.
#[derive(Debug, Clone)]
pub struct ArtifactOptions {
    /// Artifact kind (e.g. `"markdown"`).
    pub kind: String,
    /// MIME type.
    pub mime: String,
    /// Title the vault slug derives from.
    pub title: String,
    /// Finality.
    pub status: ArtifactStatus,
    /// Destination pattern; defaults to the standard vault layout.
    pub destination_pattern: Option<String>,
}

/// A request to gate a side-effectful action behind human approval.
#[derive(Debug, Clone)]
pub struct ApprovalAsk {
    /// Checkpoint id; minted when `None`.
    pub checkpoint_id: Option<String>,
    /// Action kind, matched against the contract's approval rules.
    pub action_type: String,
    /// Preview shown to the approver.
    pub preview: serde_json::Value,
    /// Override the rule/config timeout.
    pub timeout_seconds: Option<u64>,
    /// Override the rule/config timeout action.
    pub timeout_action: Option<TimeoutAction>,
}

/// The process-scoped owner of every control-plane subsystem.
pub struct ControlPlane {
    config: ControlPlaneConfig,
    log: Arc<EventLog>,
    store: Arc<RunStore>,
    approvals: Arc<ApprovalService>,
    costs: Arc<CostTracker>,
    errors: Arc<ErrorHandler>,
    rules: CustomRuleRegistry,
}

impl ControlPlane {
    /// Build the control plane from configuration.
    #[must_use]
    pub fn new(config: ControlPlaneConfig) -> Self {
        Self::with_rules(config, CustomRuleRegistry::default())
    }

    /// Build with a registry of named custom constraint validators.
    #[must_use]
    pub fn with_rules(config: ControlPlaneConfig, rules: CustomRuleRegistry) -> Self {
        let log = Arc::new(EventLog::new());
        let store = Arc::new(RunStore::new(Arc::clone(&log)));
        let approvals = Arc::new(ApprovalService::new(Arc::clone(&store)));
        let costs = Arc::new(CostTracker::new(BudgetLimits {
            max_run_cents: config.budgets.max_run_cents,
            max_day_cents: config.budgets.max_day_cents,
            max_month_cents: config.budgets.max_month_cents,
            warning_threshold: config.budgets.warning_threshold,
        }));
        Self {
            config,
            log,
            store,
            approvals,
            costs,
            errors: Arc::new(ErrorHandler::new()),
            rules,
        }
    }

    /// The shared event log.
    #[must_use]
    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// The run store.
    #[must_use]
    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    /// The approval service.
    #[must_use]
    pub fn approvals(&self) -> &Arc<ApprovalService> {
        &self.approvals
    }

    /// The cost tracker.
    #[must_use]
    pub fn costs(&self) -> &Arc<CostTracker> {
        &self.costs
    }

    /// The error handler (retry counters live here).
    #[must_use]
    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    /// The configuration this plane was built from.
    #[must_use]
    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    /// Pre-run cost estimate using the configured rate card.
    #[must_use]
    pub fn estimate_run(&self, input: &rcp_cost::EstimateInput) -> rcp_cost::CostEstimate {
        let rates = rcp_cost::RateCard {
            input_per_1k_cents: self.config.rates.input_per_1k_cents,
            output_per_1k_cents: self.config.rates.output_per_1k_cents,
            compute_per_minute_cents: self.config.rates.compute_per_minute_cents,
            external_per_call_cents: self.config.rates.external_per_call_cents,
        };
        rcp_cost::estimate::estimate(&rates, input)
    }

    /// Validate, create, and start a run against the given sandbox.
    ///
    /// Runs the pre-run contract validation, creates the run row,
    /// provisions the sandbox, emits `run.started`, advances to `planning`,
    /// and spins up the periodic approval-timeout driver.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::ContractRejected`] on blocking pre-run issues;
    /// provisioning failures fail the run row and surface as
    /// [`OrchestratorError::Failed`].
    pub async fn start_run(
        &self,
        sandbox: Arc<dyn Sandbox>,
        opts: StartOptions,
    ) -> Result<Orchestrator, OrchestratorError> {
        let issues = validate_contract(&opts.contract);
        if has_blocking_issues(&issues) {
            warn!(
                target: "rcp.runtime",
                blocking = issues.len(),
                "contract rejected before run creation"
            );
            return Err(OrchestratorError::ContractRejected { issues });
        }
        let validator = ContractValidator::compile_with(&opts.contract, self.rules.clone())?;

        let run = self.store.create_run(CreateRunOptions {
            workspace_id: opts.workspace_id.clone(),
            template_id: opts.template_id.clone(),
            template_version: opts.template_version,
            contract: opts.contract.clone(),
        });
        self.costs.register_run(
            &run.run_id,
            &opts.workspace_id,
            opts.contract.max_cost_cents,
        );

        let orchestrator = Orchestrator {
            run_id: run.run_id.clone(),
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            approvals: Arc::clone(&self.approvals),
            costs: Arc::clone(&self.costs),
            errors: Arc::clone(&self.errors),
            validator,
            sandbox,
            vault: VaultWriter::new(self.config.storage.vault_root.clone()),
            traces: TraceWriter::new(self.config.storage.trace_root.clone()),
            state: Mutex::new(LoopState {
                state: OrchestratorState::Starting,
                stop_cause: None,
            }),
            shutdown: CancellationToken::new(),
            driver: Mutex::new(None),
            loops: Mutex::new(LoopDetector::new()),
            counters: RunCounters::default(),
            started: Instant::now(),
            phase_started: Mutex::new(Instant::now()),
            files_changed: Mutex::new(Vec::new()),
            calibration_seeds: opts.calibration_seeds,
            sandbox_id: Mutex::new(None),
        };
        orchestrator.start().await?;
        Ok(orchestrator)
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("runs", &self.store.list_runs(None).len())
            .finish()
    }
}

/// Owns one run from creation through terminal state.
pub struct Orchestrator {
    run_id: String,
    config: ControlPlaneConfig,
    store: Arc<RunStore>,
    approvals: Arc<ApprovalService>,
    costs: Arc<CostTracker>,
    errors: Arc<ErrorHandler>,
    validator: ContractValidator,
    sandbox: Arc<dyn Sandbox>,
    vault: VaultWriter,
    traces: TraceWriter,
    state: Mutex<LoopState>,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    loops: Mutex<LoopDetector>,
    counters: RunCounters,
    started: Instant,
    phase_started: Mutex<Instant>,
    files_changed: Mutex<Vec<String>>,
    calibration_seeds: Vec<serde_json::Value>,
    sandbox_id: Mutex<Option<String>>,
}

impl Orchestrator {
    /// The run this orchestrator owns.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Snapshot of the run row.
    ///
    /// # Errors
    ///
    /// [`StoreError::RunNotFound`] after cleanup.
    pub fn run(&self) -> Result<Run, StoreError> {
        self.store.get_run(&self.run_id)
    }

    /// The orchestrator loop state.
    #[must_use]
    pub fn state(&self) -> OrchestratorState {
        self.state
            .lock()
            .expect("orchestrator state lock poisoned")
            .state
    }

    /// Why the loop stopped, once it has.
    #[must_use]
    pub fn stop_cause(&self) -> Option<StopCause> {
        self.state
            .lock()
            .expect("orchestrator state lock poisoned")
            .stop_cause
    }

    /// Ask the run to stop.
    ///
    /// Records the cause (first one wins) and trips the shutdown token
    /// raced by every suspension point.
    pub fn interrupt(&self, cause: StopCause) {
        {
            let mut control = self.state.lock().expect("orchestrator state lock poisoned");
            control.stop_cause.get_or_insert(cause);
        }
        self.shutdown.cancel();
    }

    /// Time spent in the current phase. Resets on phase advance, resume,
    /// and approval grant.
    #[must_use]
    pub fn phase_elapsed(&self) -> Duration {
        self.phase_started
            .lock()
            .expect("phase timer lock poisoned")
            .elapsed()
    }

    /// Frozen metrics snapshot for the run so far.
    #[must_use]
    pub fn metrics(&self) -> RunMetrics {
        let outcome = self
            .run()
            .map_or_else(|_| "unknown".to_string(), |r| r.state.as_str().to_string());
        self.counters
            .snapshot(&self.run_id, &outcome, self.started.elapsed().as_millis() as u64)
    }

    // ── start sequence ──────────────────────────────────────────────

    async fn start(&self) -> Result<(), OrchestratorError> {
        self.store
            .transition(&self.run_id, RunState::Initializing, Narration::Silent)?;

        // Sandbox crashes carry a single-retry budget; provisioning
        // failures go through the same categorized path.
        let provision_cap =
            Duration::from_secs(self.config.sandbox.provision_timeout_seconds.max(1));
        let env = loop {
            let provisioned =
                tokio::time::timeout(provision_cap, self.sandbox.provision(&self.run_id)).await;
            let fault = match provisioned {
                Ok(Ok(env)) => break env,
                Ok(Err(e)) => Fault::categorized(
                    ErrorCategory::SandboxCrash,
                    "SANDBOX_PROVISION",
                    e.to_string(),
                ),
                Err(_) => Fault::categorized(
                    ErrorCategory::SandboxCrash,
                    "SANDBOX_PROVISION_TIMEOUT",
                    "sandbox provisioning timed out",
                ),
            };
            let run = self.run()?;
            let disposition = self
                .errors
                .handle(&run, &fault, &FaultContext::default(), None);
            if disposition.should_retry {
                self.counters.record_retry();
                let delay = disposition.retry_delay.unwrap_or_default();
                tokio::select! {
                    () = tokio::time::sleep(delay) => continue,
                    () = self.shutdown.cancelled() => {
                        return Err(OrchestratorError::Cancelled);
                    }
                }
            }
            self.apply_terminal_disposition(&disposition)?;
            return Err(OrchestratorError::Failed {
                category: disposition.category,
                user_message: disposition.user_message,
            });
        };

        self.store.set_execution_env(
            &self.run_id,
            rcp_core::ExecutionEnv {
                sandbox_id: env.sandbox_id.clone(),
                created_at: Utc::now(),
            },
        )?;
        self.store.mark_started(&self.run_id)?;
        *self.sandbox_id.lock().expect("sandbox id lock poisoned") = Some(env.sandbox_id.clone());

        let run = self.run()?;
        self.emit(
            None,
            EventPayload::RunStarted {
                template: run.template_id.clone(),
                goal: run.contract.goal.clone(),
                sandbox_id: Some(env.sandbox_id),
            },
        )?;
        self.store
            .transition(&self.run_id, RunState::Planning, Narration::auto())?;

        self.spawn_timeout_driver();
        self.set_state(OrchestratorState::Running);
        info!(target: "rcp.runtime", run_id = %self.run_id, "run started");
        Ok(())
    }

    fn spawn_timeout_driver(&self) {
        let approvals = Arc::clone(&self.approvals);
        let token = self.shutdown.clone();
        let every =
            Duration::from_secs(self.config.approvals.sweep_interval_seconds.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = approvals.process_timeouts();
                    }
                    () = token.cancelled() => break,
                }
            }
        });
        *self.driver.lock().expect("driver lock poisoned") = Some(handle);
    }

    // ── tool-call gate ──────────────────────────────────────────────

    /// Check a tool name against the contract's tool policy. Pure.
    ///
    /// # Errors
    ///
    /// The violation, when the tool is blocked or not allowlisted.
    pub fn validate_tool_call(&self, tool_name: &str) -> Result<(), Violation> {
        self.validator.check_tool_call(tool_name)
    }

    /// Check a call context against the contract's constraints. Pure.
    ///
    /// # Errors
    ///
    /// The first violation.
    pub fn validate_constraints(
        &self,
        tool_name: &str,
        file_path: Option<&str>,
        action: Option<&str>,
    ) -> Result<(), Violation> {
        self.validator.check_constraints(&ToolCallContext {
            tool_name,
            file_path,
            action,
        })
    }

    /// The hot loop: gate, execute, and narrate one tool call.
    ///
    /// On a gate violation the orchestrator emits `drift.detected` with the
    /// run's next seq, fails the run as a `contract_violation`, and returns
    /// [`OrchestratorError::Failed`]. Valid calls produce `tool.called`
    /// before execution and `tool.result` after; changed files are tracked
    /// and narrated as `file.changed`.
    ///
    /// # Errors
    ///
    /// Gate violations, sandbox transport failures, and cancellation.
    pub async fn record_tool_call(
        &self,
        call: SandboxToolCall,
    ) -> Result<ToolOutcome, OrchestratorError> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        self.check_run_duration()?;

        // Two validator passes: tool policy, then constraint context.
        let gate = self
            .validator
            .check_tool_call(&call.tool_name)
            .and_then(|()| {
                self.validator.check_constraints(&ToolCallContext {
                    tool_name: &call.tool_name,
                    file_path: call.file_path.as_deref(),
                    action: call.action.as_deref(),
                })
            });
        let gate = gate.and_then(|()| {
            let mut loops = self.loops.lock().expect("loop detector lock poisoned");
            match loops.record(&call.tool_name, &call.input) {
                Some(violation) => Err(violation),
                None => Ok(()),
            }
        });
        if let Err(violation) = gate {
            return Err(self.fail_with_drift(violation, &call));
        }

        self.counters.record_tool_call();
        self.emit(
            None,
            EventPayload::ToolCalled {
                tool_name: call.tool_name.clone(),
                tool_use_id: call.tool_use_id.clone(),
                input: call.input.clone(),
            },
        )?;

        let sandbox_id = self.sandbox_id().unwrap_or_default();
        let t0 = Instant::now();
        let outcome = tokio::select! {
            res = self.sandbox.run_tool(&sandbox_id, &call) => {
                res.map_err(OrchestratorError::Sandbox)?
            }
            () = self.shutdown.cancelled() => {
                return Err(OrchestratorError::Cancelled);
            }
        };
        let duration_ms = t0.elapsed().as_millis() as u64;

        self.emit(
            None,
            EventPayload::ToolResult {
                tool_name: call.tool_name.clone(),
                tool_use_id: call.tool_use_id.clone(),
                success: outcome.success,
                duration_ms,
                output_preview: preview_of(&outcome.output),
            },
        )?;

        for path in &outcome.files_changed {
            self.emit(
                None,
                EventPayload::FileChanged {
                    path: path.clone(),
                    summary: format!("changed by {}", call.tool_name),
                },
            )?;
            self.files_changed
                .lock()
                .expect("files lock poisoned")
                .push(path.clone());
        }

        Ok(outcome)
    }

    fn fail_with_drift(
        &self,
        violation: Violation,
        call: &SandboxToolCall,
    ) -> OrchestratorError {
        self.counters.record_drift();
        // Emitted through the store so the event carries the real next seq.
        if let Err(e) = self
            .store
            .emit(&self.run_id, Some(Severity::Error), violation.to_payload())
        {
            warn!(target: "rcp.runtime", run_id = %self.run_id, error = %e, "drift emission failed");
        }
        self.counters.record_event();

        let fault = Fault::categorized(
            ErrorCategory::ContractViolation,
            "CONTRACT_DRIFT",
            violation.message.clone(),
        );
        let ctx = FaultContext {
            tool_name: Some(call.tool_name.clone()),
            sandbox_id: self.sandbox_id(),
            timeout_seconds: None,
        };
        self.fail_terminal(fault, ctx)
    }

    fn check_run_duration(&self) -> Result<(), OrchestratorError> {
        let run = self.run()?;
        let cap = run.contract.max_duration_seconds;
        if let Some(started) = run.started_at {
            let elapsed = (Utc::now() - started).num_seconds();
            if elapsed >= 0 && elapsed as u64 > cap {
                self.interrupt(StopCause::DurationExceeded);
                return Err(self.fail_terminal(
                    Fault::categorized(ErrorCategory::Timeout, "RUN_TIMEOUT", "run exceeded cap"),
                    FaultContext {
                        timeout_seconds: Some(cap),
                        ..FaultContext::default()
                    },
                ));
            }
        }
        Ok(())
    }

    // ── approval gate ───────────────────────────────────────────────

    /// Suspend the run behind a pending human approval.
    ///
    /// Emits `checkpoint.requested`, then delegates to the approval
    /// service, which transitions the run to `awaiting_approval`. Timeout
    /// settings resolve from the ask, then the contract's rule for the
    /// action kind, then configuration defaults.
    ///
    /// # Errors
    ///
    /// Duplicate checkpoints and store/state failures.
    pub fn request_approval(&self, ask: ApprovalAsk) -> Result<PendingApproval, OrchestratorError> {
        let run = self.run()?;
        let rule = run.contract.approval_rules.get(&ask.action_type);
        let timeout_seconds = ask
            .timeout_seconds
            .or(rule.map(|r| r.timeout_seconds))
            .unwrap_or(self.config.approvals.default_timeout_seconds);
        let timeout_action = ask
            .timeout_action
            .or(rule.map(|r| r.timeout_action))
            .unwrap_or(self.config.approvals.default_timeout_action);
        let checkpoint_id = ask
            .checkpoint_id
            .unwrap_or_else(rcp_core::new_checkpoint_id);

        self.emit(
            None,
            EventPayload::CheckpointRequested {
                checkpoint_id: checkpoint_id.clone(),
                action_type: ask.action_type.clone(),
                preview: ask.preview.clone(),
                timeout_seconds,
                timeout_action,
            },
        )?;

        let pending = self.approvals.request(
            &self.run_id,
            ApprovalRequest {
                checkpoint_id,
                action_type: ask.action_type,
                preview: ask.preview,
                timeout_seconds,
                timeout_action,
            },
        )?;
        self.set_state(OrchestratorState::AwaitingApproval);
        Ok(pending)
    }

    /// Resume after a checkpoint was approved.
    ///
    /// # Errors
    ///
    /// Store failures reading the run.
    pub fn on_approval_granted(&self, checkpoint_id: &str) -> Result<(), OrchestratorError> {
        let run = self.run()?;
        debug!(
            target: "rcp.runtime",
            run_id = %self.run_id,
            checkpoint_id,
            state = %run.state,
            "approval granted"
        );
        if run.state.is_resumable_work() {
            self.set_state(OrchestratorState::Running);
            *self.phase_started.lock().expect("phase timer lock poisoned") = Instant::now();
        }
        Ok(())
    }

    /// Observe a checkpoint rejection and map the run state back onto the
    /// orchestrator loop.
    ///
    /// # Errors
    ///
    /// Store failures reading the run.
    pub fn on_approval_rejected(&self, checkpoint_id: &str) -> Result<(), OrchestratorError> {
        let run = self.run()?;
        let next = match run.state {
            RunState::Paused => OrchestratorState::Paused,
            RunState::Cancelled => OrchestratorState::Stopped,
            RunState::Failed | RunState::Timeout => OrchestratorState::Error,
            _ => OrchestratorState::Running,
        };
        self.set_state(next);
        // Resolution is surfaced to external listeners via logs/metrics,
        // not as a log event (the vocabulary is closed).
        info!(
            target: "rcp.runtime",
            run_id = %self.run_id,
            checkpoint_id,
            state = %run.state,
            "checkpoint resolved"
        );
        Ok(())
    }

    // ── phase progression ───────────────────────────────────────────

    /// Step to the next phase in `planning → executing → verifying →
    /// packaging → completed`.
    ///
    /// Entering `completed` triggers final artifact extraction, a last cost
    /// sync, `run.completed`, trace assembly, and shutdown.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::PhaseNotAdvanceable`] outside those phases,
    /// plus store and teardown failures.
    pub async fn advance_phase(&self, reason: Option<&str>) -> Result<Run, OrchestratorError> {
        let run = self.run()?;
        let next = match run.state {
            RunState::Planning => RunState::Executing,
            RunState::Executing => RunState::Verifying,
            RunState::Verifying => RunState::Packaging,
            RunState::Packaging => RunState::Completed,
            state => return Err(OrchestratorError::PhaseNotAdvanceable { state }),
        };
        self.store.transition(
            &self.run_id,
            next,
            Narration::Auto {
                reason: reason.map(String::from),
            },
        )?;
        self.counters.record_event();
        *self.phase_started.lock().expect("phase timer lock poisoned") = Instant::now();
        self.loops.lock().expect("loop detector lock poisoned").reset();

        if next == RunState::Completed {
            self.finalize().await?;
        }
        Ok(self.run()?)
    }

    /// Send a run back from `verifying` to `executing`.
    ///
    /// This is an explicit orchestrator decision — nothing in the state
    /// machine or error handler requests it implicitly.
    ///
    /// # Errors
    ///
    /// Store/state failures (the run must be in `verifying`).
    pub fn retry_verification(&self, reason: &str) -> Result<Run, OrchestratorError> {
        let run = self
            .store
            .transition(&self.run_id, RunState::Executing, Narration::reason(reason))?;
        self.counters.record_event();
        *self.phase_started.lock().expect("phase timer lock poisoned") = Instant::now();
        Ok(run)
    }

    async fn finalize(&self) -> Result<(), OrchestratorError> {
        // Pull any remaining artifacts before narrating completion.
        if let Some(sandbox_id) = self.sandbox_id() {
            match self.sandbox.extract_artifacts(&sandbox_id).await {
                Ok(artifacts) => {
                    for artifact in artifacts {
                        self.store_artifact_bytes(
                            &artifact.bytes,
                            ArtifactOptions {
                                kind: artifact.kind,
                                mime: artifact.mime,
                                title: artifact.title,
                                status: ArtifactStatus::Final,
                                destination_pattern: None,
                            },
                        )?;
                    }
                }
                Err(e) => {
                    warn!(target: "rcp.runtime", run_id = %self.run_id, error = %e, "final extraction failed");
                }
            }
        }

        let breakdown = self.costs.breakdown(&self.run_id);
        self.store.set_cost(&self.run_id, breakdown)?;

        let run = self.run()?;
        let duration_ms = run
            .started_at
            .map_or(0, |s| (Utc::now() - s).num_milliseconds().max(0) as u64);
        self.emit(
            None,
            EventPayload::RunCompleted {
                artifact_count: run.artifacts.len() as u64,
                total_cost_cents: breakdown.total_cents,
                duration_ms,
            },
        )?;
        self.errors.clear_run(&self.run_id);
        self.shutdown().await?;
        Ok(())
    }

    // ── user actions ────────────────────────────────────────────────

    /// Pause the run from a work phase.
    ///
    /// # Errors
    ///
    /// Store/state failures.
    pub fn pause(&self) -> Result<Run, OrchestratorError> {
        let run = self.store.apply_action(&self.run_id, UserAction::Pause)?;
        self.counters.record_event();
        self.set_state(OrchestratorState::Paused);
        Ok(run)
    }

    /// Resume a paused run into its previous work state.
    ///
    /// # Errors
    ///
    /// Store/state failures.
    pub fn resume(&self) -> Result<Run, OrchestratorError> {
        let run = self.store.apply_action(&self.run_id, UserAction::Resume)?;
        self.counters.record_event();
        self.set_state(OrchestratorState::Running);
        *self.phase_started.lock().expect("phase timer lock poisoned") = Instant::now();
        Ok(run)
    }

    /// Cancel the run: force-kill in-flight sandbox work, transition to
    /// `cancelled`, then extract best-effort and tear down.
    ///
    /// # Errors
    ///
    /// Store/state failures (cancel is valid from every non-terminal
    /// state).
    pub async fn cancel_run(&self) -> Result<Run, OrchestratorError> {
        self.interrupt(StopCause::UserCancel);
        self.set_state(OrchestratorState::Stopping);
        if let Some(sandbox_id) = self.sandbox_id() {
            self.sandbox.kill(&sandbox_id).await;
        }
        let run = self.store.apply_action(&self.run_id, UserAction::Cancel)?;
        self.counters.record_event();
        self.shutdown().await?;
        Ok(run)
    }

    // ── errors ──────────────────────────────────────────────────────

    /// Route an error through the handler.
    ///
    /// Retryable faults wait out their backoff here — cancellable: a
    /// `cancel` arriving during the delay aborts the retry with
    /// [`OrchestratorError::Cancelled`]. Terminal faults fail the run
    /// (state, `run.failed` event, partial capture) and return the
    /// disposition.
    ///
    /// # Errors
    ///
    /// Cancellation during backoff, and store failures applying the
    /// terminal transition.
    pub async fn handle_error(
        &self,
        fault: Fault,
        ctx: FaultContext,
    ) -> Result<Disposition, OrchestratorError> {
        let run = self.run()?;
        let partial = self.partial_inputs(&run);
        let disposition = self.errors.handle(&run, &fault, &ctx, Some(partial));

        if disposition.should_retry {
            self.counters.record_retry();
            let delay = disposition.retry_delay.unwrap_or_default();
            tokio::select! {
                () = tokio::time::sleep(delay) => Ok(disposition),
                () = self.shutdown.cancelled() => Err(OrchestratorError::Cancelled),
            }
        } else {
            self.apply_terminal_disposition(&disposition)?;
            Ok(disposition)
        }
    }

    fn fail_terminal(&self, fault: Fault, ctx: FaultContext) -> OrchestratorError {
        match self.run() {
            Ok(run) => {
                let partial = self.partial_inputs(&run);
                let disposition = self.errors.handle(&run, &fault, &ctx, Some(partial));
                if let Err(e) = self.apply_terminal_disposition(&disposition) {
                    warn!(target: "rcp.runtime", run_id = %self.run_id, error = %e, "failed to apply terminal state");
                }
                OrchestratorError::Failed {
                    category: disposition.category,
                    user_message: disposition.user_message,
                }
            }
            Err(e) => OrchestratorError::Store(e),
        }
    }

    fn apply_terminal_disposition(
        &self,
        disposition: &Disposition,
    ) -> Result<(), OrchestratorError> {
        let Some(new_state) = disposition.new_state else {
            return Ok(());
        };
        let payload = disposition
            .failure_payload
            .clone()
            .unwrap_or(EventPayload::RunFailed {
                error_type: disposition.category.as_str().to_string(),
                error_message: disposition.user_message.clone(),
                recoverable: false,
                checkpoint_available: false,
            });
        self.store.transition(
            &self.run_id,
            new_state,
            Narration::Explicit {
                severity: Severity::Error,
                payload,
            },
        )?;
        self.counters.record_event();
        self.store.set_failure(
            &self.run_id,
            RunError {
                kind: disposition.category.as_str().to_string(),
                message: disposition.user_message.clone(),
                recoverable: false,
            },
            disposition.partial.clone(),
        )?;
        self.set_state(OrchestratorState::Error);
        Ok(())
    }

    // ── artifacts & cost ────────────────────────────────────────────

    /// Write artifact bytes to the vault and record the manifest.
    ///
    /// The document lands under the vault layout (collision-suffixed), the
    /// manifest is appended to the run row, and `artifact.created` is
    /// emitted.
    ///
    /// # Errors
    ///
    /// Vault IO and store failures.
    pub fn add_artifact(
        &self,
        bytes: &[u8],
        opts: ArtifactOptions,
    ) -> Result<ArtifactManifest, OrchestratorError> {
        self.store_artifact_bytes(bytes, opts)
    }

    fn store_artifact_bytes(
        &self,
        bytes: &[u8],
        opts: ArtifactOptions,
    ) -> Result<ArtifactManifest, OrchestratorError> {
        let run = self.run()?;
        let slug = rcp_vault::slugify(&opts.title);
        let destination = opts.destination_pattern.as_deref().map(|pattern| {
            rcp_vault::expand_pattern(pattern, &self.run_id, &slug, Utc::now())
        });

        let path = self.vault.write(&VaultDoc {
            run_id: self.run_id.clone(),
            agent: run.template_id.clone(),
            source: run.workspace_id.clone(),
            status: opts.status,
            doc_type: opts.kind.clone(),
            title: opts.title.clone(),
            body: String::from_utf8_lossy(bytes).into_owned(),
        })?;
        let destination_path =
            destination.unwrap_or_else(|| path.to_string_lossy().into_owned());

        let manifest = ArtifactManifest::for_bytes(
            &self.run_id,
            opts.kind.clone(),
            opts.mime,
            destination_path.clone(),
            bytes,
            opts.status,
        );
        self.store.add_artifact(&self.run_id, manifest.clone())?;
        self.emit(
            None,
            EventPayload::ArtifactCreated {
                artifact_id: manifest.artifact_id.clone(),
                artifact_kind: manifest.artifact_kind.clone(),
                destination_path,
                sha256: manifest.sha256.clone(),
                size_bytes: manifest.size_bytes,
            },
        )?;
        Ok(manifest)
    }

    /// Record a cost entry through the budget gate and sync the run row.
    ///
    /// # Errors
    ///
    /// [`CostError::BudgetExceeded`] passes through untouched so the caller
    /// can decide between failing and cancelling.
    pub fn add_cost(
        &self,
        kind: CostKind,
        amount_cents: u64,
        description: &str,
    ) -> Result<AddOutcome, OrchestratorError> {
        let outcome = self.costs.add_cost(
            &self.run_id,
            kind,
            amount_cents,
            description,
            BTreeMap::new(),
        )?;
        if let Some(warning) = outcome.warning {
            warn!(
                target: "rcp.cost",
                run_id = %self.run_id,
                scope = ?warning.scope,
                usage_pct = warning.usage_pct,
                "budget warning threshold crossed"
            );
        }
        self.store
            .set_cost(&self.run_id, self.costs.breakdown(&self.run_id))?;
        Ok(outcome)
    }

    /// Current cost breakdown for the run.
    #[must_use]
    pub fn cost_breakdown(&self) -> CostBreakdown {
        self.costs.breakdown(&self.run_id)
    }

    // ── teardown ────────────────────────────────────────────────────

    /// Tear down: stop the timeout driver, extract outstanding artifacts,
    /// shut down the sandbox, and write the trace bundle atomically.
    ///
    /// Idempotent; later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Trace write failures. Sandbox teardown is best-effort.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        {
            let mut control = self.state.lock().expect("orchestrator state lock poisoned");
            if control.state == OrchestratorState::Stopped {
                return Ok(());
            }
            if control.state != OrchestratorState::Error {
                control.state = OrchestratorState::Stopping;
            }
        }
        self.interrupt(StopCause::Teardown);
        if let Some(handle) = self.driver.lock().expect("driver lock poisoned").take() {
            handle.abort();
        }

        if let Some(sandbox_id) = self.sandbox_id() {
            // Best-effort: pull anything the run left behind, then let the
            // sandbox go.
            if let Ok(artifacts) = self.sandbox.extract_artifacts(&sandbox_id).await {
                for artifact in artifacts {
                    let _ = self.store_artifact_bytes(
                        &artifact.bytes,
                        ArtifactOptions {
                            kind: artifact.kind,
                            mime: artifact.mime,
                            title: artifact.title,
                            status: ArtifactStatus::Partial,
                            destination_pattern: None,
                        },
                    );
                }
            }
            if let Err(e) = self.sandbox.shutdown(&sandbox_id).await {
                warn!(target: "rcp.runtime", run_id = %self.run_id, error = %e, "sandbox shutdown failed");
            }
        }

        self.write_trace()?;

        let final_state = {
            let mut control = self.state.lock().expect("orchestrator state lock poisoned");
            if control.state != OrchestratorState::Error {
                control.state = OrchestratorState::Stopped;
            }
            control.state
        };
        info!(
            target: "rcp.runtime",
            run_id = %self.run_id,
            state = ?final_state,
            metrics = ?self.metrics(),
            "orchestrator shut down"
        );
        Ok(())
    }

    fn write_trace(&self) -> Result<(), OrchestratorError> {
        let run = self.run()?;
        let total = self.store.log().stats(&self.run_id).total as usize;
        let events = self
            .store
            .log()
            .query(&self.run_id, -1, Some(total.max(1)), None)
            .events;
        let bundle = TraceBundle::build(
            run,
            events,
            self.store.audit_for_run(&self.run_id),
            self.calibration_seeds.clone(),
        );
        self.traces.write(&bundle)?;
        Ok(())
    }

    // ── helpers ─────────────────────────────────────────────────────

    fn emit(
        &self,
        severity: Option<Severity>,
        payload: EventPayload,
    ) -> Result<(), OrchestratorError> {
        self.store.emit(&self.run_id, severity, payload)?;
        self.counters.record_event();
        Ok(())
    }

    fn set_state(&self, next: OrchestratorState) {
        self.state
            .lock()
            .expect("orchestrator state lock poisoned")
            .state = next;
    }

    fn sandbox_id(&self) -> Option<String> {
        self.sandbox_id
            .lock()
            .expect("sandbox id lock poisoned")
            .clone()
    }

    fn partial_inputs(&self, run: &Run) -> PartialInputs {
        PartialInputs {
            artifact_ids: run.artifacts.iter().map(|a| a.artifact_id.clone()).collect(),
            files_changed: self
                .files_changed
                .lock()
                .expect("files lock poisoned")
                .clone(),
        }
    }
}

fn preview_of(output: &serde_json::Value) -> Option<String> {
    if output.is_null() {
        return None;
    }
    let text = output.to_string();
    let preview: String = text.chars().take(200).collect();
    Some(preview)
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("run_id", &self.run_id)
            .field("state", &self.state())
            .finish()
    }
}
