// SPDX-License-Identifier: MIT OR Apache-2.0
//! rcp-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the Run Control Plane.
//!
//! Every other crate in the workspace speaks these types: the run row, the
//! frozen contract, the event vocabulary, approvals, and artifact manifests.
//! If you only take one dependency, take this one.

/// Pending approvals, audit records, and resolution sources.
pub mod approval;
/// Artifact manifests and statuses.
pub mod artifact;
/// The frozen run contract and its builder.
pub mod contract;
/// The closed event vocabulary and its payload sum type.
pub mod event;
/// The run row, its lifecycle states, and cost breakdown.
pub mod run;

use sha2::{Digest, Sha256};
use uuid::Uuid;

pub use approval::{
    ApprovalAuditRecord, ApprovalSource, ApprovalStatus, AuditAction, PendingApproval,
    RejectReason, TimeoutAction,
};
pub use artifact::{ArtifactManifest, ArtifactStatus};
pub use contract::{
    ApprovalRule, Constraint, ConstraintRule, Contract, ContractBuilder, Deliverable,
    EvidenceKind, OutputDestination, SuccessCriterion, ToolPolicy,
};
pub use event::{DriftKind, Event, EventKind, EventPayload, PayloadError, Severity};
pub use run::{CostBreakdown, ExecutionEnv, PartialCapture, Run, RunError, RunState};

/// Current control-plane contract version embedded in traces and wire frames.
///
/// # Examples
///
/// ```
/// assert_eq!(rcp_core::PLANE_VERSION, "rcp/v0.1");
/// ```
pub const PLANE_VERSION: &str = "rcp/v0.1";

/// Mint a fresh run identifier.
///
/// Run ids are `run_`-prefixed simple (dashless) UUIDs, so they are safe in
/// file names, URLs, and trace paths without escaping.
#[must_use]
pub fn new_run_id() -> String {
    format!("run_{}", Uuid::new_v4().simple())
}

/// Mint a fresh checkpoint identifier.
#[must_use]
pub fn new_checkpoint_id() -> String {
    format!("cp_{}", Uuid::new_v4().simple())
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_prefixed_and_unique() {
        let a = new_run_id();
        let b = new_run_id();
        assert!(a.starts_with("run_"));
        assert_ne!(a, b);
        // Prefix plus 32 hex chars.
        assert_eq!(a.len(), 4 + 32);
    }

    #[test]
    fn checkpoint_ids_are_prefixed() {
        assert!(new_checkpoint_id().starts_with("cp_"));
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
