// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pre-run cost estimation.
//!
//! Rough by design: the estimator exists so the budget gate can refuse runs
//! that obviously cannot fit, not to predict invoices. Bounds are ±30%
//! around the central estimate.

use serde::{Deserialize, Serialize};

/// Relative width of the low/high bounds.
const BOUND_SPREAD: f64 = 0.30;

/// Configurable unit rates, all in cents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateCard {
    /// Model input tokens, per 1K.
    pub input_per_1k_cents: f64,
    /// Model output tokens, per 1K.
    pub output_per_1k_cents: f64,
    /// Sandbox compute, per minute.
    pub compute_per_minute_cents: f64,
    /// External API calls, per call.
    pub external_per_call_cents: f64,
}

impl Default for RateCard {
    fn default() -> Self {
        Self {
            input_per_1k_cents: 0.3,
            output_per_1k_cents: 1.5,
            compute_per_minute_cents: 2.0,
            external_per_call_cents: 0.5,
        }
    }
}

/// Inputs to an estimate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EstimateInput {
    /// Tokens in the goal and seeded context.
    pub goal_tokens: u64,
    /// Expected output tokens; defaults to `3 × goal_tokens`.
    pub expected_output_tokens: Option<u64>,
    /// Expected sandbox wall-clock minutes.
    pub estimated_minutes: u64,
    /// Expected external tool calls.
    pub expected_tool_calls: u64,
}

/// A central estimate with ±30% bounds, in cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Low bound.
    pub low_cents: u64,
    /// Central estimate.
    pub expected_cents: u64,
    /// High bound.
    pub high_cents: u64,
}

/// Estimate the cost of a run from its shape.
#[must_use]
pub fn estimate(rates: &RateCard, input: &EstimateInput) -> CostEstimate {
    let output_tokens = input
        .expected_output_tokens
        .unwrap_or(input.goal_tokens.saturating_mul(3));

    let token_cents = (input.goal_tokens as f64 / 1_000.0) * rates.input_per_1k_cents
        + (output_tokens as f64 / 1_000.0) * rates.output_per_1k_cents;
    let compute_cents = input.estimated_minutes as f64 * rates.compute_per_minute_cents;
    let external_cents = input.expected_tool_calls as f64 * rates.external_per_call_cents;

    let central = token_cents + compute_cents + external_cents;
    CostEstimate {
        low_cents: (central * (1.0 - BOUND_SPREAD)).round() as u64,
        expected_cents: central.round() as u64,
        high_cents: (central * (1.0 + BOUND_SPREAD)).ceil() as u64,
    }
}
