// SPDX-License-Identifier: MIT OR Apache-2.0
//! rcp-config
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Control-plane configuration: TOML loading, layered defaults, and
//! advisory validation warnings.

use rcp_core::TimeoutAction;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The requested file does not exist.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// The requested path.
        path: String,
    },

    /// The file could not be read.
    #[error("config read failed: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Parser detail.
        reason: String,
    },
}

/// Advisory issues that do not prevent startup.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarning {
    /// An approval timeout long enough to stall runs for hours.
    LargeApprovalTimeout {
        /// The configured default, in seconds.
        seconds: u64,
    },
    /// A budget cap of zero blocks the first cost entry.
    ZeroBudget {
        /// Which cap (`run`, `day`, `month`).
        scope: &'static str,
    },
    /// Warning threshold outside `(0, 1]`.
    BadWarningThreshold {
        /// The configured value.
        value: f64,
    },
    /// Timeout sweep slower than approval timeouts can usefully be.
    SlowTimeoutSweep {
        /// The configured interval, in seconds.
        seconds: u64,
    },
}

/// Budget caps, in cents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BudgetSection {
    /// Default per-run cap.
    pub max_run_cents: Option<u64>,
    /// Per-workspace daily cap.
    pub max_day_cents: Option<u64>,
    /// Per-workspace monthly cap.
    pub max_month_cents: Option<u64>,
    /// Fraction of a cap at which warnings start.
    pub warning_threshold: f64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            max_run_cents: None,
            max_day_cents: None,
            max_month_cents: None,
            warning_threshold: 0.8,
        }
    }
}

/// Cost estimation rates, in cents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RatesSection {
    /// Model input tokens, per 1K.
    pub input_per_1k_cents: f64,
    /// Model output tokens, per 1K.
    pub output_per_1k_cents: f64,
    /// Sandbox compute, per minute.
    pub compute_per_minute_cents: f64,
    /// External API calls, per call.
    pub external_per_call_cents: f64,
}

impl Default for RatesSection {
    fn default() -> Self {
        Self {
            input_per_1k_cents: 0.3,
            output_per_1k_cents: 1.5,
            compute_per_minute_cents: 2.0,
            external_per_call_cents: 0.5,
        }
    }
}

/// Approval gate defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ApprovalSection {
    /// Timeout applied when a contract rule names none.
    pub default_timeout_seconds: u64,
    /// Action applied on expiry when a contract rule names none.
    pub default_timeout_action: TimeoutAction,
    /// How often the timeout sweep runs.
    pub sweep_interval_seconds: u64,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 300,
            default_timeout_action: TimeoutAction::Reject,
            sweep_interval_seconds: 5,
        }
    }
}

/// Filesystem roots for the trace and vault sinks.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StorageSection {
    /// Directory the trace writer roots `traces/` under.
    pub trace_root: String,
    /// Directory the vault writer roots `outputs/` under.
    pub vault_root: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            trace_root: "data".into(),
            vault_root: "data".into(),
        }
    }
}

/// Sandbox adapter knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SandboxSection {
    /// Provisioning timeout.
    pub provision_timeout_seconds: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            provision_timeout_seconds: 60,
        }
    }
}

/// Top-level control-plane configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Budget caps.
    pub budgets: BudgetSection,
    /// Estimation rates.
    pub rates: RatesSection,
    /// Approval defaults.
    pub approvals: ApprovalSection,
    /// Trace/vault roots.
    pub storage: StorageSection,
    /// Sandbox knobs.
    pub sandbox: SandboxSection,
}

impl ControlPlaneConfig {
    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileNotFound`] or [`ConfigError::ParseError`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse from a TOML string. Missing sections take their defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ParseError`].
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    /// Advisory checks: misconfigurations worth logging but not fatal.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if self.approvals.default_timeout_seconds > 86_400 {
            warnings.push(ConfigWarning::LargeApprovalTimeout {
                seconds: self.approvals.default_timeout_seconds,
            });
        }
        for (scope, cap) in [
            ("run", self.budgets.max_run_cents),
            ("day", self.budgets.max_day_cents),
            ("month", self.budgets.max_month_cents),
        ] {
            if cap == Some(0) {
                warnings.push(ConfigWarning::ZeroBudget { scope });
            }
        }
        let t = self.budgets.warning_threshold;
        if !(t > 0.0 && t <= 1.0) {
            warnings.push(ConfigWarning::BadWarningThreshold { value: t });
        }
        if self.approvals.sweep_interval_seconds > 60 {
            warnings.push(ConfigWarning::SlowTimeoutSweep {
                seconds: self.approvals.sweep_interval_seconds,
            });
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_clean() {
        let config = ControlPlaneConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.approvals.sweep_interval_seconds, 5);
        assert_eq!(config.approvals.default_timeout_action, TimeoutAction::Reject);
    }

    #[test]
    fn parse_partial_toml_fills_defaults() {
        let config = ControlPlaneConfig::parse(
            r#"
            [budgets]
            max_day_cents = 10000

            [approvals]
            default_timeout_seconds = 120
            "#,
        )
        .unwrap();
        assert_eq!(config.budgets.max_day_cents, Some(10_000));
        assert_eq!(config.budgets.max_run_cents, None);
        assert_eq!(config.approvals.default_timeout_seconds, 120);
        // Untouched sections keep defaults.
        assert_eq!(config.sandbox.provision_timeout_seconds, 60);
    }

    #[test]
    fn parse_rejects_bad_toml() {
        let err = ControlPlaneConfig::parse("budgets = nonsense").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn load_missing_file_errors() {
        let err = ControlPlaneConfig::load("/definitely/missing.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rcp.toml");
        std::fs::write(
            &path,
            "[approvals]\ndefault_timeout_action = \"approve\"\n",
        )
        .unwrap();
        let config = ControlPlaneConfig::load(&path).unwrap();
        assert_eq!(
            config.approvals.default_timeout_action,
            TimeoutAction::Approve
        );
    }

    #[test]
    fn validate_flags_misconfigurations() {
        let mut config = ControlPlaneConfig::default();
        config.approvals.default_timeout_seconds = 1_000_000;
        config.budgets.max_day_cents = Some(0);
        config.budgets.warning_threshold = 1.5;
        config.approvals.sweep_interval_seconds = 300;

        let warnings = config.validate();
        assert_eq!(warnings.len(), 4);
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::ZeroBudget { scope: "day" })));
    }
}
