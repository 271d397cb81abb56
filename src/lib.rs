// SPDX-License-Identifier: MIT OR Apache-2.0
//! run-control-plane
//!
//! Umbrella crate for the Run Control Plane workspace. The root package
//! exists so the cross-crate end-to-end suites under `tests/` have a home;
//! library consumers should depend on the member crates directly.
