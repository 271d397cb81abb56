// SPDX-License-Identifier: MIT OR Apache-2.0
//! rcp-trace
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Post-run trace bundles.
//!
//! A trace is the durable record a run leaves behind for humans and for
//! offline calibration: a markdown wrapper with YAML frontmatter next to a
//! one-record-per-line JSONL stream, both written atomically (temp file,
//! then rename) under `traces/YYYY/MM/`.

/// Bundle assembly from the run row and its event stream.
pub mod bundle;

pub use bundle::{DecisionRecord, PhaseSummaryRow, TraceBundle};

use chrono::Datelike;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Errors from trace writing.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Directory creation or file IO failed.
    #[error("trace io failed: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be serialized.
    #[error("trace serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Frontmatter could not be serialized.
    #[error("frontmatter serialization failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The temp file could not be persisted into place.
    #[error("trace persist failed: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Paths produced by a successful trace write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracePaths {
    /// The human-readable markdown wrapper.
    pub markdown: PathBuf,
    /// The machine-readable JSONL stream.
    pub jsonl: PathBuf,
}

/// One line in the JSONL stream.
#[derive(Debug, Serialize)]
struct JsonlRecord<'a> {
    /// Record type (`contract`, `phase_start`, `decision`, ...).
    r#type: &'a str,
    timestamp: chrono::DateTime<chrono::Utc>,
    data: serde_json::Value,
}

/// Writes trace bundles under a root directory.
#[derive(Debug, Clone)]
pub struct TraceWriter {
    root: PathBuf,
}

impl TraceWriter {
    /// Writer rooted at `root` (the directory containing `traces/`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write the bundle's markdown and JSONL files atomically.
    ///
    /// Files land at `traces/YYYY/MM/{run_id}.md` and `.jsonl`, keyed by the
    /// run's start time (falling back to creation time). Each file is
    /// written to a temp file in the destination directory and renamed into
    /// place, so readers never observe a partial trace.
    ///
    /// # Errors
    ///
    /// IO, serialization, or persist failures.
    pub fn write(&self, bundle: &TraceBundle) -> Result<TracePaths, TraceError> {
        let stamp = bundle.run.started_at.unwrap_or(bundle.run.created_at);
        let dir = self
            .root
            .join("traces")
            .join(format!("{:04}", stamp.year()))
            .join(format!("{:02}", stamp.month()));
        std::fs::create_dir_all(&dir)?;

        let markdown = dir.join(format!("{}.md", bundle.run.run_id));
        let jsonl = dir.join(format!("{}.jsonl", bundle.run.run_id));

        self.write_atomic(&dir, &markdown, bundle.render_markdown()?.as_bytes())?;
        self.write_atomic(&dir, &jsonl, self.render_jsonl(bundle)?.as_bytes())?;

        info!(
            target: "rcp.trace",
            run_id = %bundle.run.run_id,
            path = %markdown.display(),
            "trace written"
        );
        Ok(TracePaths { markdown, jsonl })
    }

    fn write_atomic(&self, dir: &Path, dest: &Path, bytes: &[u8]) -> Result<(), TraceError> {
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.persist(dest)?;
        Ok(())
    }

    fn render_jsonl(&self, bundle: &TraceBundle) -> Result<String, TraceError> {
        let mut out = String::new();
        for (record_type, timestamp, data) in bundle.jsonl_records()? {
            let line = serde_json::to_string(&JsonlRecord {
                r#type: record_type,
                timestamp,
                data,
            })?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }
}
