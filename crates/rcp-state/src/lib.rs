// SPDX-License-Identifier: MIT OR Apache-2.0
//! rcp-state
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The run lifecycle state machine.
//!
//! This crate is pure: it validates edges and plans the `previous_state`
//! bookkeeping, and the run store applies the plan inside its transaction.
//! An invalid transition is a programmer error at the call site and fails
//! loudly rather than corrupting the log.

use rcp_core::{RejectReason, RunState};
use thiserror::Error;

/// Errors from transition and action planning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// The edge is not in the permitted-transition table.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: RunState,
        /// Requested state.
        to: RunState,
    },

    /// The run is in a terminal state and cannot move.
    #[error("run is terminal in state {state}")]
    TerminalState {
        /// The terminal state.
        state: RunState,
    },

    /// Resuming to a work state that is not the stored `previous_state`.
    #[error("resume target {got} does not match stored previous state {expected:?}")]
    ResumeTargetMismatch {
        /// The stored `previous_state`.
        expected: Option<RunState>,
        /// The requested target.
        got: RunState,
    },

    /// The action is not valid from the current state.
    #[error("action {action} is not valid from state {state}")]
    InvalidAction {
        /// Name of the attempted action.
        action: &'static str,
        /// Current state.
        state: RunState,
    },
}

/// A user-initiated action mapped onto the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    /// Suspend a work state.
    Pause,
    /// Return a paused run to its previous work state.
    Resume,
    /// Cancel from any non-terminal state.
    Cancel,
    /// Approve the pending checkpoint and resume.
    Approve,
    /// Reject the pending checkpoint; the reason picks the landing state.
    Reject(RejectReason),
    /// Reset a failed/cancelled/timed-out run back to `pending`.
    Retry,
}

impl UserAction {
    /// Short name used in errors and `phase.changed` reasons.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Approve => "approve",
            Self::Reject(_) => "reject",
            Self::Retry => "retry",
        }
    }
}

/// A validated state change, ready for the store to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    /// State being left.
    pub from: RunState,
    /// State being entered.
    pub to: RunState,
    /// Value of `previous_state` after the commit.
    pub previous_state: Option<RunState>,
}

/// `true` when `from -> to` is in the permitted-transition table.
///
/// Terminal states have no outgoing edges; the `retry` reset is not an edge
/// (see [`plan_action`]).
#[must_use]
pub fn is_edge(from: RunState, to: RunState) -> bool {
    use RunState::{
        AwaitingApproval, Cancelled, Completed, Executing, Failed, Initializing, Packaging,
        Paused, Pending, Planning, Timeout, Verifying,
    };
    match from {
        Pending => matches!(to, Initializing | Cancelled),
        Initializing => matches!(to, Planning | Failed | Cancelled),
        Planning => matches!(to, Executing | AwaitingApproval | Paused | Failed | Cancelled),
        Executing => matches!(to, Verifying | AwaitingApproval | Paused | Failed | Cancelled),
        Verifying => matches!(to, Packaging | Executing | Paused | Failed | Cancelled),
        Packaging => matches!(to, Completed | Failed | Cancelled),
        AwaitingApproval => matches!(
            to,
            Planning | Executing | Verifying | Cancelled | Paused | Failed | Timeout
        ),
        Paused => matches!(to, Planning | Executing | Verifying | Cancelled),
        Completed | Failed | Cancelled | Timeout => false,
    }
}

/// Validate a transition and plan the `previous_state` bookkeeping.
///
/// `previous` is the run's stored `previous_state` before the transition.
///
/// Discipline:
/// - entering `awaiting_approval` or `paused` from a resumable work state
///   captures that state;
/// - `awaiting_approval -> paused` preserves the already-captured state so a
///   later resume still lands correctly;
/// - exiting a suspension into a work state requires the target to equal the
///   stored `previous_state`, which is then cleared.
///
/// # Errors
///
/// [`StateError::TerminalState`], [`StateError::InvalidTransition`], or
/// [`StateError::ResumeTargetMismatch`].
pub fn plan_transition(
    from: RunState,
    previous: Option<RunState>,
    to: RunState,
) -> Result<TransitionPlan, StateError> {
    if from.is_terminal() {
        return Err(StateError::TerminalState { state: from });
    }
    if !is_edge(from, to) {
        return Err(StateError::InvalidTransition { from, to });
    }

    let previous_state = if to.is_suspension() {
        if from.is_resumable_work() {
            Some(from)
        } else {
            // Only awaiting_approval -> paused reaches here; keep the
            // original work state for the eventual resume.
            previous
        }
    } else if to.is_resumable_work() && from.is_suspension() {
        if previous != Some(to) {
            return Err(StateError::ResumeTargetMismatch {
                expected: previous,
                got: to,
            });
        }
        None
    } else {
        None
    };

    Ok(TransitionPlan {
        from,
        to,
        previous_state,
    })
}

/// Map a user action onto a transition plan.
///
/// `retry` is the one action that is not a table edge: it resets a
/// `failed`/`cancelled`/`timeout` run to `pending`, clearing the suspension
/// bookkeeping.
///
/// # Errors
///
/// [`StateError::InvalidAction`] when the action does not apply to the
/// current state, plus anything [`plan_transition`] returns.
pub fn plan_action(
    from: RunState,
    previous: Option<RunState>,
    action: UserAction,
) -> Result<TransitionPlan, StateError> {
    let invalid = || {
        Err(StateError::InvalidAction {
            action: action.name(),
            state: from,
        })
    };
    match action {
        UserAction::Pause => {
            if !from.is_resumable_work() {
                return invalid();
            }
            plan_transition(from, previous, RunState::Paused)
        }
        UserAction::Resume => {
            if from != RunState::Paused {
                return invalid();
            }
            let Some(target) = previous else {
                return Err(StateError::ResumeTargetMismatch {
                    expected: None,
                    got: RunState::Paused,
                });
            };
            plan_transition(from, previous, target)
        }
        UserAction::Cancel => {
            if from.is_terminal() {
                return Err(StateError::TerminalState { state: from });
            }
            plan_transition(from, previous, RunState::Cancelled)
        }
        UserAction::Approve => {
            if from != RunState::AwaitingApproval {
                return invalid();
            }
            let Some(target) = previous else {
                return Err(StateError::ResumeTargetMismatch {
                    expected: None,
                    got: RunState::AwaitingApproval,
                });
            };
            plan_transition(from, previous, target)
        }
        UserAction::Reject(reason) => {
            if from != RunState::AwaitingApproval {
                return invalid();
            }
            plan_transition(from, previous, reason.target_state())
        }
        UserAction::Retry => {
            if !matches!(
                from,
                RunState::Failed | RunState::Cancelled | RunState::Timeout
            ) {
                return invalid();
            }
            Ok(TransitionPlan {
                from,
                to: RunState::Pending,
                previous_state: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcp_core::RunState::{
        AwaitingApproval, Cancelled, Completed, Executing, Failed, Initializing, Packaging,
        Paused, Pending, Planning, Timeout, Verifying,
    };

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in [Completed, Failed, Cancelled, Timeout] {
            for to in RunState::ALL {
                assert!(!is_edge(from, to), "{from} -> {to} should be closed");
            }
        }
    }

    #[test]
    fn happy_path_edges_exist() {
        let path = [Pending, Initializing, Planning, Executing, Verifying, Packaging, Completed];
        for pair in path.windows(2) {
            assert!(is_edge(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn verification_retry_edge_exists() {
        assert!(is_edge(Verifying, Executing));
        // But not the reverse skip.
        assert!(!is_edge(Executing, Packaging));
    }

    #[test]
    fn every_non_terminal_state_can_cancel() {
        for from in RunState::ALL {
            if !from.is_terminal() {
                assert!(is_edge(from, Cancelled), "{from} -> cancelled missing");
            }
        }
    }

    #[test]
    fn suspension_captures_previous_state() {
        let plan = plan_transition(Executing, None, AwaitingApproval).unwrap();
        assert_eq!(plan.previous_state, Some(Executing));

        let plan = plan_transition(Planning, None, Paused).unwrap();
        assert_eq!(plan.previous_state, Some(Planning));
    }

    #[test]
    fn awaiting_to_paused_preserves_previous_state() {
        let plan = plan_transition(AwaitingApproval, Some(Verifying), Paused).unwrap();
        assert_eq!(plan.previous_state, Some(Verifying));
    }

    #[test]
    fn resume_must_match_previous_state() {
        let plan = plan_transition(Paused, Some(Executing), Executing).unwrap();
        assert_eq!(plan.previous_state, None);

        let err = plan_transition(Paused, Some(Executing), Planning).unwrap_err();
        assert_eq!(
            err,
            StateError::ResumeTargetMismatch {
                expected: Some(Executing),
                got: Planning,
            }
        );
    }

    #[test]
    fn invalid_edges_fail_loudly() {
        let err = plan_transition(Pending, None, Executing).unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidTransition {
                from: Pending,
                to: Executing
            }
        );

        let err = plan_transition(Completed, None, Pending).unwrap_err();
        assert_eq!(err, StateError::TerminalState { state: Completed });
    }

    #[test]
    fn pause_action_only_from_work_states() {
        for from in [Planning, Executing, Verifying] {
            let plan = plan_action(from, None, UserAction::Pause).unwrap();
            assert_eq!(plan.to, Paused);
            assert_eq!(plan.previous_state, Some(from));
        }
        for from in [Pending, Initializing, Packaging, Paused, AwaitingApproval] {
            assert!(plan_action(from, None, UserAction::Pause).is_err(), "{from}");
        }
    }

    #[test]
    fn resume_action_restores_previous_state() {
        let plan = plan_action(Paused, Some(Verifying), UserAction::Resume).unwrap();
        assert_eq!(plan.to, Verifying);
        assert_eq!(plan.previous_state, None);

        // Paused without a stored previous state is corrupt; fail loudly.
        assert!(plan_action(Paused, None, UserAction::Resume).is_err());
    }

    #[test]
    fn cancel_action_from_any_non_terminal() {
        for from in RunState::ALL {
            let result = plan_action(from, Some(Executing), UserAction::Cancel);
            if from.is_terminal() {
                assert_eq!(result.unwrap_err(), StateError::TerminalState { state: from });
            } else {
                assert_eq!(result.unwrap().to, Cancelled);
            }
        }
    }

    #[test]
    fn approve_action_returns_to_previous_state() {
        let plan = plan_action(AwaitingApproval, Some(Executing), UserAction::Approve).unwrap();
        assert_eq!(plan.to, Executing);
        assert_eq!(plan.previous_state, None);

        assert!(plan_action(Executing, None, UserAction::Approve).is_err());
    }

    #[test]
    fn reject_action_lands_by_reason() {
        use rcp_core::RejectReason;
        let cases = [
            (RejectReason::UserCancelled, Cancelled),
            (RejectReason::NeedsEdit, Paused),
            (RejectReason::PolicyViolation, Failed),
        ];
        for (reason, target) in cases {
            let plan =
                plan_action(AwaitingApproval, Some(Executing), UserAction::Reject(reason))
                    .unwrap();
            assert_eq!(plan.to, target);
            if target == Paused {
                // needs_edit keeps the resume target alive.
                assert_eq!(plan.previous_state, Some(Executing));
            }
        }
    }

    #[test]
    fn retry_action_resets_to_pending() {
        for from in [Failed, Cancelled, Timeout] {
            let plan = plan_action(from, Some(Executing), UserAction::Retry).unwrap();
            assert_eq!(plan.to, Pending);
            assert_eq!(plan.previous_state, None);
        }
        assert!(plan_action(Completed, None, UserAction::Retry).is_err());
        assert!(plan_action(Executing, None, UserAction::Retry).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn any_state() -> impl Strategy<Value = RunState> {
            prop::sample::select(RunState::ALL.to_vec())
        }

        proptest! {
            /// Planning never succeeds for an edge outside the table, and a
            /// successful plan into suspension always records a resumable
            /// previous state.
            #[test]
            fn plans_respect_the_table(from in any_state(), to in any_state(), prev in proptest::option::of(any_state())) {
                match plan_transition(from, prev, to) {
                    Ok(plan) => {
                        prop_assert!(is_edge(from, to));
                        if to.is_suspension() {
                            if let Some(p) = plan.previous_state {
                                prop_assert!(p.is_resumable_work() || prev == Some(p));
                            }
                        }
                        if to.is_resumable_work() && from.is_suspension() {
                            prop_assert_eq!(plan.previous_state, None);
                        }
                    }
                    Err(_) => {
                        // Errors only where the table or the discipline forbids.
                        let forbidden = !is_edge(from, to)
                            || from.is_terminal()
                            || (to.is_resumable_work()
                                && from.is_suspension()
                                && prev != Some(to));
                        prop_assert!(forbidden);
                    }
                }
            }
        }
    }
}
