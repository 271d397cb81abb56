// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact manifests.
//!
//! The control plane owns artifacts by reference only; the bytes live in the
//! vault or the sandbox.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Finality of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Produced mid-run, may be superseded.
    Draft,
    /// The packaged, final version.
    Final,
    /// Captured from a failed run.
    Partial,
}

/// Reference to a produced artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactManifest {
    /// Artifact identifier.
    pub artifact_id: String,
    /// Owning run.
    pub run_id: String,
    /// Artifact kind (e.g. `"markdown"`, `"dataset"`).
    pub artifact_kind: String,
    /// MIME type of the content.
    pub mime: String,
    /// How a UI should preview it (e.g. `"markdown"`, `"text"`, `"none"`).
    pub preview_kind: String,
    /// Resolved destination path.
    pub destination_path: String,
    /// Hex SHA-256 of the content.
    pub sha256: String,
    /// Content size in bytes.
    pub size_bytes: u64,
    /// When the manifest was recorded.
    pub created_at: DateTime<Utc>,
    /// Finality.
    pub status: ArtifactStatus,
}

impl ArtifactManifest {
    /// Build a manifest for `bytes`, computing size and digest.
    #[must_use]
    pub fn for_bytes(
        run_id: impl Into<String>,
        artifact_kind: impl Into<String>,
        mime: impl Into<String>,
        destination_path: impl Into<String>,
        bytes: &[u8],
        status: ArtifactStatus,
    ) -> Self {
        Self {
            artifact_id: format!("art_{}", Uuid::new_v4().simple()),
            run_id: run_id.into(),
            artifact_kind: artifact_kind.into(),
            mime: mime.into(),
            preview_kind: "markdown".into(),
            destination_path: destination_path.into(),
            sha256: crate::sha256_hex(bytes),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
            status,
        }
    }
}
