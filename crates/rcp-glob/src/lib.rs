//! rcp-glob
#![deny(unsafe_code)]
//!
//! Constraint path pattern compilation and matching.
//!
//! Contract path rules are segment-aware: `*` matches any run of characters
//! within one path segment, `**` crosses segments, `?` matches a single
//! character, and patterns are anchored at both ends.

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::Path;

/// A compiled set of blocked-path patterns.
///
/// An empty pattern list blocks nothing.
#[derive(Debug, Clone)]
pub struct PathPatterns {
    set: Option<GlobSet>,
    patterns: Vec<String>,
}

impl PathPatterns {
    /// Compile a list of path patterns into a reusable matcher.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first pattern that fails to compile.
    pub fn compile(patterns: &[String]) -> Result<Self> {
        Ok(Self {
            set: build_globset(patterns)?,
            patterns: patterns.to_vec(),
        })
    }

    /// `true` when `candidate` matches any compiled pattern.
    #[must_use]
    pub fn matches_path(&self, candidate: &Path) -> bool {
        self.set.as_ref().is_some_and(|set| set.is_match(candidate))
    }

    /// Convenience wrapper around [`matches_path`](Self::matches_path).
    #[must_use]
    pub fn matches_str(&self, candidate: &str) -> bool {
        self.matches_path(Path::new(candidate))
    }

    /// The first pattern that matches `candidate`, for violation messages.
    #[must_use]
    pub fn first_match(&self, candidate: &str) -> Option<&str> {
        let set = self.set.as_ref()?;
        let hits = set.matches(Path::new(candidate));
        hits.first().map(|&i| self.patterns[i].as_str())
    }

    /// `true` when no patterns were compiled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_none()
    }
}

/// Compile patterns into a [`GlobSet`], returning `None` for empty input.
///
/// Uses `literal_separator` so `*` and `?` never cross a `/`.
///
/// # Errors
///
/// Returns an error naming the first invalid pattern.
pub fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut b = GlobSetBuilder::new();
    for p in patterns {
        let glob = GlobBuilder::new(p)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid path pattern: {p}"))?;
        b.add(glob);
    }
    Ok(Some(b.build()?))
}

#[cfg(test)]
mod tests {
    use super::PathPatterns;

    fn patterns(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn empty_patterns_block_nothing() {
        let p = PathPatterns::compile(&Vec::new()).expect("compile empty");
        assert!(p.is_empty());
        assert!(!p.matches_str("src/lib.rs"));
        assert!(!p.matches_str(""));
    }

    #[test]
    fn single_star_stays_within_a_segment() {
        let p = PathPatterns::compile(&patterns(&["secrets/*.pem"])).expect("compile");
        assert!(p.matches_str("secrets/key.pem"));
        // `*` must not cross `/`.
        assert!(!p.matches_str("secrets/nested/key.pem"));
    }

    #[test]
    fn double_star_crosses_segments() {
        let p = PathPatterns::compile(&patterns(&["secrets/**"])).expect("compile");
        assert!(p.matches_str("secrets/key.pem"));
        assert!(p.matches_str("secrets/a/b/c.txt"));
        assert!(!p.matches_str("public/key.pem"));
    }

    #[test]
    fn question_mark_matches_one_character() {
        let p = PathPatterns::compile(&patterns(&["logs/run-?.txt"])).expect("compile");
        assert!(p.matches_str("logs/run-1.txt"));
        assert!(!p.matches_str("logs/run-12.txt"));
        assert!(!p.matches_str("logs/run-.txt"));
    }

    #[test]
    fn patterns_are_anchored() {
        let p = PathPatterns::compile(&patterns(&["*.env"])).expect("compile");
        assert!(p.matches_str("prod.env"));
        // Anchored: does not match as a suffix of a deeper path.
        assert!(!p.matches_str("config/prod.env"));
        assert!(!p.matches_str("prod.env.bak"));
    }

    #[test]
    fn leading_double_star_matches_any_depth() {
        let p = PathPatterns::compile(&patterns(&["**/.env"])).expect("compile");
        assert!(p.matches_str(".env"));
        assert!(p.matches_str("config/.env"));
        assert!(p.matches_str("a/b/c/.env"));
        assert!(!p.matches_str("config/.envrc"));
    }

    #[test]
    fn first_match_reports_the_pattern() {
        let p =
            PathPatterns::compile(&patterns(&["**/.git/**", "secrets/**"])).expect("compile");
        assert_eq!(p.first_match("secrets/key.pem"), Some("secrets/**"));
        assert_eq!(p.first_match("work/.git/config"), Some("**/.git/**"));
        assert_eq!(p.first_match("src/lib.rs"), None);
    }

    #[test]
    fn invalid_pattern_is_named_in_the_error() {
        let err = PathPatterns::compile(&patterns(&["ok/**", "["])).expect_err("should fail");
        assert!(err.to_string().contains("invalid path pattern"), "{err:?}");
    }
}
