// SPDX-License-Identifier: MIT OR Apache-2.0
//! Consecutive-identical-call loop detection.
//!
//! An agent that issues the same tool call with the same input over and over
//! is almost certainly stuck. The detector keeps only the last call
//! signature and a repeat counter, so the hot path is one comparison.

use crate::Violation;
use rcp_core::DriftKind;

/// Default number of consecutive identical calls that counts as a loop.
pub const DEFAULT_LOOP_THRESHOLD: usize = 3;

/// Flags runs of identical `{tool_name, input}` calls as `loop_detected`
/// drift.
#[derive(Debug)]
pub struct LoopDetector {
    threshold: usize,
    last_signature: Option<String>,
    repeats: usize,
}

impl LoopDetector {
    /// Detector with the default threshold.
    #[must_use]
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_LOOP_THRESHOLD)
    }

    /// Detector flagging after `threshold` consecutive identical calls.
    #[must_use]
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(2),
            last_signature: None,
            repeats: 0,
        }
    }

    /// Record a call; returns a violation when the threshold is reached.
    pub fn record(&mut self, tool_name: &str, input: &serde_json::Value) -> Option<Violation> {
        let signature = format!("{tool_name}\u{1f}{input}");
        if self.last_signature.as_deref() == Some(signature.as_str()) {
            self.repeats += 1;
        } else {
            self.last_signature = Some(signature);
            self.repeats = 1;
        }

        if self.repeats >= self.threshold {
            // Reset so a post-drift retry starts a fresh window.
            self.repeats = 0;
            self.last_signature = None;
            return Some(Violation {
                drift_type: DriftKind::LoopDetected,
                constraint_id: None,
                message: format!(
                    "tool '{tool_name}' called {} times in a row with identical input",
                    self.threshold
                ),
                tool_name: Some(tool_name.to_string()),
                path: None,
            });
        }
        None
    }

    /// Forget the current window (e.g. on phase change).
    pub fn reset(&mut self) {
        self.last_signature = None;
        self.repeats = 0;
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_calls_trip_the_threshold() {
        let mut d = LoopDetector::with_threshold(3);
        let input = json!({"path": "notes.md"});
        assert!(d.record("read_file", &input).is_none());
        assert!(d.record("read_file", &input).is_none());
        let violation = d.record("read_file", &input).unwrap();
        assert_eq!(violation.drift_type, DriftKind::LoopDetected);
    }

    #[test]
    fn different_input_resets_the_window() {
        let mut d = LoopDetector::with_threshold(3);
        assert!(d.record("read_file", &json!({"path": "a.md"})).is_none());
        assert!(d.record("read_file", &json!({"path": "a.md"})).is_none());
        assert!(d.record("read_file", &json!({"path": "b.md"})).is_none());
        assert!(d.record("read_file", &json!({"path": "b.md"})).is_none());
        assert!(d.record("read_file", &json!({"path": "b.md"})).is_some());
    }

    #[test]
    fn different_tool_resets_the_window() {
        let mut d = LoopDetector::with_threshold(2);
        let input = json!({});
        assert!(d.record("read_file", &input).is_none());
        assert!(d.record("list_files", &input).is_none());
        assert!(d.record("read_file", &input).is_none());
    }

    #[test]
    fn window_restarts_after_a_trip() {
        let mut d = LoopDetector::with_threshold(2);
        let input = json!(1);
        assert!(d.record("t", &input).is_none());
        assert!(d.record("t", &input).is_some());
        // Fresh window after the violation.
        assert!(d.record("t", &input).is_none());
        assert!(d.record("t", &input).is_some());
    }

    #[test]
    fn threshold_floor_is_two() {
        let mut d = LoopDetector::with_threshold(0);
        let input = json!(null);
        assert!(d.record("t", &input).is_none());
        assert!(d.record("t", &input).is_some());
    }
}
