// SPDX-License-Identifier: MIT OR Apache-2.0
//! rcp-vault
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The markdown vault sink.
//!
//! Deliverables land as markdown with YAML frontmatter under
//! `outputs/YYYY/MM/{run_id_prefix}_{slug}.md`. Filename collisions get a
//! `-2`, `-3`, ... suffix; slugs are lowercase `[a-z0-9-]`, at most 100
//! characters.

use chrono::{DateTime, Datelike, Utc};
use rcp_core::ArtifactStatus;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Longest slug the sink will produce.
pub const MAX_SLUG_LEN: usize = 100;

/// How many run-id characters prefix the filename.
const RUN_ID_PREFIX_LEN: usize = 12;

/// Errors from vault writes.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Directory creation or file IO failed.
    #[error("vault io failed: {0}")]
    Io(#[from] std::io::Error),

    /// Frontmatter could not be serialized.
    #[error("frontmatter serialization failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Ran out of collision suffixes (pathological).
    #[error("no free filename for slug '{slug}'")]
    NoFreeName {
        /// The contested slug.
        slug: String,
    },
}

/// A document headed for the vault.
#[derive(Debug, Clone)]
pub struct VaultDoc {
    /// Owning run.
    pub run_id: String,
    /// Agent/template name recorded in frontmatter.
    pub agent: String,
    /// Source label (e.g. the template id or integration).
    pub source: String,
    /// Document status (`draft`, `final`, `partial`).
    pub status: ArtifactStatus,
    /// Document type (e.g. `digest`, `brief`).
    pub doc_type: String,
    /// Title the slug is derived from.
    pub title: String,
    /// Markdown body (without frontmatter).
    pub body: String,
}

/// Frontmatter written at the top of every vault document.
#[derive(Debug, Serialize)]
struct Frontmatter<'a> {
    run_id: &'a str,
    agent: &'a str,
    source: &'a str,
    created_at: DateTime<Utc>,
    status: ArtifactStatus,
    r#type: &'a str,
}

/// Reduce a title to a filename slug: lowercase, `[a-z0-9-]`, runs of other
/// characters collapse to single dashes, trimmed, at most
/// [`MAX_SLUG_LEN`] characters.
#[must_use]
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug.truncate(MAX_SLUG_LEN);
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// Expand the recognized destination-pattern variables: `{run_id}`,
/// `{year}`, `{month}`, `{slug}`. Unknown variables pass through verbatim.
#[must_use]
pub fn expand_pattern(pattern: &str, run_id: &str, slug: &str, at: DateTime<Utc>) -> String {
    pattern
        .replace("{run_id}", run_id)
        .replace("{year}", &format!("{:04}", at.year()))
        .replace("{month}", &format!("{:02}", at.month()))
        .replace("{slug}", slug)
}

/// Writes vault documents under a root directory.
#[derive(Debug, Clone)]
pub struct VaultWriter {
    root: PathBuf,
}

impl VaultWriter {
    /// Writer rooted at `root` (the directory containing `outputs/`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write a document, resolving filename collisions with `-2`, `-3`, ...
    ///
    /// Returns the path the document landed at.
    ///
    /// # Errors
    ///
    /// IO and serialization failures.
    pub fn write(&self, doc: &VaultDoc) -> Result<PathBuf, VaultError> {
        self.write_at(doc, Utc::now())
    }

    /// [`write`](Self::write) with an explicit clock, for tests.
    ///
    /// # Errors
    ///
    /// IO and serialization failures.
    pub fn write_at(&self, doc: &VaultDoc, now: DateTime<Utc>) -> Result<PathBuf, VaultError> {
        let dir = self
            .root
            .join("outputs")
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()));
        std::fs::create_dir_all(&dir)?;

        let slug = slugify(&doc.title);
        let prefix: String = doc.run_id.chars().take(RUN_ID_PREFIX_LEN).collect();
        let path = self.free_path(&dir, &prefix, &slug)?;

        let frontmatter = serde_yaml::to_string(&Frontmatter {
            run_id: &doc.run_id,
            agent: &doc.agent,
            source: &doc.source,
            created_at: now,
            status: doc.status,
            r#type: &doc.doc_type,
        })?;

        let mut content = String::with_capacity(frontmatter.len() + doc.body.len() + 16);
        content.push_str("---\n");
        content.push_str(&frontmatter);
        content.push_str("---\n\n");
        content.push_str(&doc.body);
        if !content.ends_with('\n') {
            content.push('\n');
        }
        std::fs::write(&path, content)?;

        info!(
            target: "rcp.vault",
            run_id = %doc.run_id,
            path = %path.display(),
            "vault document written"
        );
        Ok(path)
    }

    fn free_path(&self, dir: &Path, prefix: &str, slug: &str) -> Result<PathBuf, VaultError> {
        let base = dir.join(format!("{prefix}_{slug}.md"));
        if !base.exists() {
            return Ok(base);
        }
        for n in 2..1_000u32 {
            let candidate = dir.join(format!("{prefix}_{slug}-{n}.md"));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(VaultError::NoFreeName {
            slug: slug.to_string(),
        })
    }
}
