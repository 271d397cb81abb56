// SPDX-License-Identifier: MIT OR Apache-2.0
//! Boundary behaviors at the edges the components promise to hold.

use chrono::{Duration as ChronoDuration, Utc};
use rcp_approvals::{ApprovalRequest, ApprovalService};
use rcp_core::{ContractBuilder, Event, EventPayload, RunState, Severity, TimeoutAction};
use rcp_cost::{BudgetLimits, CostError, CostKind, CostTracker};
use rcp_log::{AppendOutcome, EventLog, LogError};
use rcp_state::UserAction;
use rcp_store::{CreateRunOptions, Narration, RunStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

fn event(run_id: &str, seq: i64) -> Event {
    Event {
        event_id: Uuid::new_v4(),
        run_id: run_id.into(),
        seq,
        ts: Utc::now(),
        phase: RunState::Executing,
        severity: Severity::Info,
        payload: EventPayload::FileChanged {
            path: format!("f{seq}.md"),
            summary: "edited".into(),
        },
    }
}

#[test]
fn append_off_by_one_leaves_log_unchanged() {
    let log = EventLog::new();
    log.append(event("run_b", 0)).unwrap();

    for bad_seq in [-1, 0, 2, 100] {
        let err = log.append(event("run_b", bad_seq)).unwrap_err();
        assert!(matches!(err, LogError::InvalidSeq { expected: 1, .. }));
    }
    assert_eq!(log.latest_seq("run_b"), 0);
    assert_eq!(log.stats("run_b").total, 1);
}

#[test]
fn duplicate_event_id_with_fresh_seq_is_still_a_no_op() {
    let log = EventLog::new();
    let first = event("run_b", 0);
    log.append(first.clone()).unwrap();
    log.append(event("run_b", 1)).unwrap();

    // Same id at the "correct" next seq: idempotency wins, nothing lands.
    let mut replay = event("run_b", 2);
    replay.event_id = first.event_id;
    assert_eq!(log.append(replay).unwrap(), AppendOutcome::Duplicate);
    assert_eq!(log.latest_seq("run_b"), 1);
}

#[test]
fn budget_boundary_exact_vs_over() {
    let tracker = CostTracker::new(BudgetLimits {
        max_day_cents: Some(500),
        ..BudgetLimits::default()
    });
    tracker.register_run("run_b", "ws-b", None);

    // Landing exactly on the cap is allowed...
    tracker
        .add_cost("run_b", CostKind::ClaudeApi, 500, "all of it", BTreeMap::new())
        .unwrap();
    // ...one cent over is not, and nothing mutates.
    let err = tracker
        .add_cost("run_b", CostKind::ClaudeApi, 1, "one more", BTreeMap::new())
        .unwrap_err();
    assert!(matches!(err, CostError::BudgetExceeded { .. }));
    let today = Utc::now().format("%Y-%m-%d").to_string();
    assert_eq!(tracker.day_total("ws-b", &today), 500);
}

#[test]
fn approval_expiring_exactly_at_expires_at_is_swept() {
    let store = Arc::new(RunStore::new(Arc::new(EventLog::new())));
    let run = store.create_run(CreateRunOptions {
        workspace_id: "ws-b".into(),
        template_id: "tpl".into(),
        template_version: "1".into(),
        contract: ContractBuilder::new("goal").build(),
    });
    store
        .transition(&run.run_id, RunState::Initializing, Narration::Silent)
        .unwrap();
    store
        .transition(&run.run_id, RunState::Planning, Narration::auto())
        .unwrap();

    let service = ApprovalService::new(Arc::clone(&store));
    let pending = service
        .request(
            &run.run_id,
            ApprovalRequest {
                checkpoint_id: "cp-exact".into(),
                action_type: "publish".into(),
                preview: serde_json::Value::Null,
                timeout_seconds: 30,
                timeout_action: TimeoutAction::Reject,
            },
        )
        .unwrap();

    // One instant before: untouched. Exactly at: swept.
    assert!(service
        .process_timeouts_at(pending.expires_at - ChronoDuration::milliseconds(1))
        .is_empty());
    let swept = service.process_timeouts_at(pending.expires_at);
    assert_eq!(swept.len(), 1);
    assert_eq!(store.get_run(&run.run_id).unwrap().state, RunState::Timeout);
}

#[test]
fn terminal_states_reject_every_action_except_retry() {
    let store = RunStore::new(Arc::new(EventLog::new()));
    let run = store.create_run(CreateRunOptions {
        workspace_id: "ws-b".into(),
        template_id: "tpl".into(),
        template_version: "1".into(),
        contract: ContractBuilder::new("goal").build(),
    });
    store.apply_action(&run.run_id, UserAction::Cancel).unwrap();

    for action in [UserAction::Pause, UserAction::Resume, UserAction::Cancel] {
        assert!(
            store.apply_action(&run.run_id, action).is_err(),
            "{action:?} must fail on a terminal run"
        );
    }
    let reset = store.apply_action(&run.run_id, UserAction::Retry).unwrap();
    assert_eq!(reset.state, RunState::Pending);
}

#[test]
fn batch_append_boundary_is_all_or_nothing() {
    let log = EventLog::new();
    log.append(event("run_b", 0)).unwrap();

    // A batch straddling an existing seq fails whole.
    let batch = vec![event("run_b", 0), event("run_b", 1)];
    assert!(log.append_batch(batch).is_err());
    assert_eq!(log.latest_seq("run_b"), 0);

    // The same events renumbered from last+1 land whole.
    let batch = vec![event("run_b", 1), event("run_b", 2)];
    log.append_batch(batch).unwrap();
    assert_eq!(log.latest_seq("run_b"), 2);
}
