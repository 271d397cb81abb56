// SPDX-License-Identifier: MIT OR Apache-2.0
//! The sandbox adapter seam.
//!
//! The sandbox host is an external collaborator: an opaque process host
//! that accepts tool calls, streams output, and yields artifact bytes. The
//! control plane only ever talks to it through this trait, so tests run
//! against [`MockSandbox`] with scripted outcomes.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// A provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxEnv {
    /// Opaque identifier from the sandbox host.
    pub sandbox_id: String,
}

/// A tool call handed to the sandbox.
#[derive(Debug, Clone)]
pub struct SandboxToolCall {
    /// Tool name.
    pub tool_name: String,
    /// JSON input.
    pub input: Value,
    /// File path the call touches, if any (checked against constraints).
    pub file_path: Option<String>,
    /// Higher-level action label, if any.
    pub action: Option<String>,
    /// Correlation id for `tool.called`/`tool.result`.
    pub tool_use_id: Option<String>,
}

impl SandboxToolCall {
    /// A bare call with just a tool name and input.
    #[must_use]
    pub fn new(tool_name: impl Into<String>, input: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            input,
            file_path: None,
            action: None,
            tool_use_id: Some(format!("tu_{}", Uuid::new_v4().simple())),
        }
    }

    /// Attach the file path the call touches.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }
}

/// What a tool call produced.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Whether the tool reported success.
    pub success: bool,
    /// JSON output.
    pub output: Value,
    /// Workspace paths the call changed.
    pub files_changed: Vec<String>,
}

impl ToolOutcome {
    /// A successful outcome with output.
    #[must_use]
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            files_changed: Vec::new(),
        }
    }
}

/// Artifact bytes pulled out of the sandbox at extraction time.
#[derive(Debug, Clone)]
pub struct SandboxArtifact {
    /// Artifact kind (e.g. `"markdown"`).
    pub kind: String,
    /// MIME type.
    pub mime: String,
    /// Title the vault slug derives from.
    pub title: String,
    /// Content bytes.
    pub bytes: Vec<u8>,
}

/// The external sandbox host.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Provision an environment for a run.
    ///
    /// # Errors
    ///
    /// Provider failures; classified by the error handler.
    async fn provision(&self, run_id: &str) -> anyhow::Result<SandboxEnv>;

    /// Execute one tool call.
    ///
    /// # Errors
    ///
    /// Transport or host failures (a tool that *ran* and failed comes back
    /// as `ToolOutcome { success: false, .. }` instead).
    async fn run_tool(&self, sandbox_id: &str, call: &SandboxToolCall)
        -> anyhow::Result<ToolOutcome>;

    /// Pull out any artifacts the run produced.
    ///
    /// # Errors
    ///
    /// Transport or host failures.
    async fn extract_artifacts(&self, sandbox_id: &str) -> anyhow::Result<Vec<SandboxArtifact>>;

    /// Graceful teardown.
    ///
    /// # Errors
    ///
    /// Transport or host failures.
    async fn shutdown(&self, sandbox_id: &str) -> anyhow::Result<()>;

    /// Force-kill. Infallible by contract: there is nothing useful a caller
    /// can do when a kill fails.
    async fn kill(&self, sandbox_id: &str);
}

/// In-process sandbox with scripted tool outcomes, for tests and demos.
#[derive(Default)]
pub struct MockSandbox {
    outcomes: Mutex<VecDeque<anyhow::Result<ToolOutcome>>>,
    artifacts: Mutex<Vec<SandboxArtifact>>,
    killed: AtomicBool,
    shut_down: AtomicBool,
    provision_failures: AtomicU32,
}

impl MockSandbox {
    /// A mock that succeeds every call with empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome for the next unscripted tool call.
    pub fn push_outcome(&self, outcome: anyhow::Result<ToolOutcome>) {
        self.outcomes
            .lock()
            .expect("mock outcomes lock poisoned")
            .push_back(outcome);
    }

    /// Stage an artifact for extraction.
    pub fn push_artifact(&self, artifact: SandboxArtifact) {
        self.artifacts
            .lock()
            .expect("mock artifacts lock poisoned")
            .push(artifact);
    }

    /// Make the next `provision` call fail; stackable.
    pub fn fail_next_provision(&self) {
        self.provision_failures.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether `kill` was called.
    #[must_use]
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Whether `shutdown` was called.
    #[must_use]
    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn provision(&self, run_id: &str) -> anyhow::Result<SandboxEnv> {
        if self
            .provision_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("sandbox host rejected provisioning for {run_id}");
        }
        Ok(SandboxEnv {
            sandbox_id: format!("sbx_{}", Uuid::new_v4().simple()),
        })
    }

    async fn run_tool(
        &self,
        _sandbox_id: &str,
        _call: &SandboxToolCall,
    ) -> anyhow::Result<ToolOutcome> {
        let scripted = self
            .outcomes
            .lock()
            .expect("mock outcomes lock poisoned")
            .pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => Ok(ToolOutcome::ok(Value::Null)),
        }
    }

    async fn extract_artifacts(&self, _sandbox_id: &str) -> anyhow::Result<Vec<SandboxArtifact>> {
        Ok(self
            .artifacts
            .lock()
            .expect("mock artifacts lock poisoned")
            .drain(..)
            .collect())
    }

    async fn shutdown(&self, _sandbox_id: &str) -> anyhow::Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self, _sandbox_id: &str) {
        self.killed.store(true, Ordering::SeqCst);
    }
}
