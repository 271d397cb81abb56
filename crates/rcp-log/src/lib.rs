// SPDX-License-Identifier: MIT OR Apache-2.0
//! rcp-log
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The append-only per-run event stream.
//!
//! Each run's events carry a strictly monotonic, gap-free sequence number.
//! Append is idempotent on the globally-unique event id; reads are
//! cursor-based so a reconnecting consumer can resume from `after_seq`
//! without gaps or duplicates.

use chrono::{DateTime, Utc};
use rcp_core::{Event, EventKind, PayloadError};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;

/// Default page size for [`EventLog::query`].
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Errors from event-log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// The event's seq is not `last_seq + 1` for its run.
    #[error("invalid seq for run {run_id}: expected {expected}, got {got}")]
    InvalidSeq {
        /// Run whose stream was appended to.
        run_id: String,
        /// The only acceptable next seq.
        expected: i64,
        /// The seq that was offered.
        got: i64,
    },

    /// The payload failed its semantic checks.
    #[error("invalid payload")]
    InvalidPayload(#[from] PayloadError),

    /// A batch mixed events from different runs.
    #[error("batch mixes runs: expected {expected}, found {found}")]
    MixedRunIds {
        /// Run id of the first event.
        expected: String,
        /// The differing run id encountered.
        found: String,
    },

    /// A batch's seqs were not contiguous from `last_seq + 1`.
    #[error("batch seqs must be contiguous starting at {expected}")]
    NonContiguousBatch {
        /// The seq the batch had to start at.
        expected: i64,
    },

    /// A batch reused an event id already present in the log or the batch.
    #[error("duplicate event id in batch: {event_id}")]
    DuplicateInBatch {
        /// The repeated id.
        event_id: Uuid,
    },

    /// No event with the requested id exists.
    #[error("event {event_id} not found")]
    EventNotFound {
        /// The id that was looked up.
        event_id: Uuid,
    },
}

/// Whether an append stored a new event or hit the idempotency fast-path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The event was appended.
    Appended,
    /// An event with this id was already present; the log is unchanged.
    Duplicate,
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct QueryPage {
    /// Matching events in ascending seq order.
    pub events: Vec<Event>,
    /// Seq of the last returned event, or the request's `after_seq` when
    /// nothing matched. Pass back as the next `after_seq`.
    pub cursor: i64,
    /// `true` when more matching events exist beyond this page.
    pub has_more: bool,
}

/// Aggregate statistics for one run's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStats {
    /// Number of events in the stream.
    pub total: u64,
    /// Seq of the newest event; `-1` when empty.
    pub last_seq: i64,
    /// Event counts keyed by wire type name.
    pub counts_by_type: BTreeMap<&'static str, u64>,
    /// Timestamp of the oldest event.
    pub first_ts: Option<DateTime<Utc>>,
    /// Timestamp of the newest event.
    pub last_ts: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    /// Per-run streams, each ordered by seq.
    runs: HashMap<String, Vec<Event>>,
    /// Global event-id index: id → (run_id, position).
    index: HashMap<Uuid, (String, usize)>,
}

/// The append-only event log.
///
/// Thread-safe and synchronous; callers in async contexts never hold its
/// lock across an await point because every operation is a plain method
/// call.
#[derive(Default)]
pub struct EventLog {
    inner: RwLock<Inner>,
}

impl EventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event.
    ///
    /// Idempotent on `event_id`: re-appending an already-stored id is a
    /// successful no-op. Otherwise the event's seq must be exactly
    /// `last_seq + 1` for its run.
    ///
    /// # Errors
    ///
    /// [`LogError::InvalidSeq`] on a gap or replay with a fresh id;
    /// [`LogError::InvalidPayload`] when the payload fails semantic checks.
    pub fn append(&self, event: Event) -> Result<AppendOutcome, LogError> {
        event.payload.validate()?;
        let mut inner = self.inner.write().expect("event log lock poisoned");

        if inner.index.contains_key(&event.event_id) {
            return Ok(AppendOutcome::Duplicate);
        }

        let stream = inner.runs.entry(event.run_id.clone()).or_default();
        let expected = stream.last().map_or(0, |e| e.seq + 1);
        if event.seq != expected {
            return Err(LogError::InvalidSeq {
                run_id: event.run_id.clone(),
                expected,
                got: event.seq,
            });
        }

        let pos = stream.len();
        let key = (event.run_id.clone(), pos);
        stream.push(event.clone());
        inner.index.insert(event.event_id, key);
        Ok(AppendOutcome::Appended)
    }

    /// Append a batch atomically: either every event lands or none do.
    ///
    /// All events must share one run id, carry fresh event ids, and form a
    /// contiguous seq range starting at `last_seq + 1`.
    ///
    /// # Errors
    ///
    /// Any violation leaves the log untouched. An empty batch is a no-op.
    pub fn append_batch(&self, events: Vec<Event>) -> Result<(), LogError> {
        let Some(first) = events.first() else {
            return Ok(());
        };
        let run_id = first.run_id.clone();

        let mut inner = self.inner.write().expect("event log lock poisoned");
        let expected_start = inner
            .runs
            .get(&run_id)
            .and_then(|s| s.last())
            .map_or(0, |e| e.seq + 1);

        let mut seen_ids = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            event.payload.validate()?;
            if event.run_id != run_id {
                return Err(LogError::MixedRunIds {
                    expected: run_id.clone(),
                    found: event.run_id.clone(),
                });
            }
            if event.seq != expected_start + i as i64 {
                return Err(LogError::NonContiguousBatch {
                    expected: expected_start,
                });
            }
            if inner.index.contains_key(&event.event_id) || seen_ids.contains(&event.event_id) {
                return Err(LogError::DuplicateInBatch {
                    event_id: event.event_id,
                });
            }
            seen_ids.push(event.event_id);
        }

        let stream = inner.runs.entry(run_id.clone()).or_default();
        let mut positions = Vec::with_capacity(events.len());
        for event in events {
            positions.push((event.event_id, (run_id.clone(), stream.len())));
            stream.push(event);
        }
        for (id, key) in positions {
            inner.index.insert(id, key);
        }
        Ok(())
    }

    /// Read events with `seq > after_seq` in ascending order.
    ///
    /// `limit` defaults to [`DEFAULT_QUERY_LIMIT`]; `types` restricts the
    /// page to the given kinds. `has_more` reflects remaining *matching*
    /// events beyond the page.
    #[must_use]
    pub fn query(
        &self,
        run_id: &str,
        after_seq: i64,
        limit: Option<usize>,
        types: Option<&[EventKind]>,
    ) -> QueryPage {
        let limit = limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        let inner = self.inner.read().expect("event log lock poisoned");
        let Some(stream) = inner.runs.get(run_id) else {
            return QueryPage {
                events: Vec::new(),
                cursor: after_seq,
                has_more: false,
            };
        };

        // Seqs are dense from 0, so the suffix starts at a computable index.
        let start = usize::try_from(after_seq.saturating_add(1).max(0)).unwrap_or(usize::MAX);
        let mut events = Vec::new();
        let mut has_more = false;
        for event in stream.iter().skip(start) {
            if let Some(kinds) = types
                && !kinds.contains(&event.kind())
            {
                continue;
            }
            if events.len() == limit {
                has_more = true;
                break;
            }
            events.push(event.clone());
        }

        let cursor = events.last().map_or(after_seq, |e| e.seq);
        QueryPage {
            events,
            cursor,
            has_more,
        }
    }

    /// Look up a single event by id.
    ///
    /// # Errors
    ///
    /// [`LogError::EventNotFound`] when no event carries the id.
    pub fn get_by_id(&self, event_id: Uuid) -> Result<Event, LogError> {
        let inner = self.inner.read().expect("event log lock poisoned");
        inner
            .index
            .get(&event_id)
            .and_then(|(run_id, pos)| inner.runs.get(run_id).and_then(|s| s.get(*pos)))
            .cloned()
            .ok_or(LogError::EventNotFound { event_id })
    }

    /// Aggregate statistics for one run's stream.
    #[must_use]
    pub fn stats(&self, run_id: &str) -> LogStats {
        let inner = self.inner.read().expect("event log lock poisoned");
        let Some(stream) = inner.runs.get(run_id) else {
            return LogStats {
                total: 0,
                last_seq: -1,
                counts_by_type: BTreeMap::new(),
                first_ts: None,
                last_ts: None,
            };
        };

        let mut counts_by_type: BTreeMap<&'static str, u64> = BTreeMap::new();
        for event in stream {
            *counts_by_type.entry(event.kind().as_str()).or_default() += 1;
        }
        LogStats {
            total: stream.len() as u64,
            last_seq: stream.last().map_or(-1, |e| e.seq),
            counts_by_type,
            first_ts: stream.first().map(|e| e.ts),
            last_ts: stream.last().map(|e| e.ts),
        }
    }

    /// Seq of the newest event for a run; `-1` when the stream is empty.
    #[must_use]
    pub fn latest_seq(&self, run_id: &str) -> i64 {
        let inner = self.inner.read().expect("event log lock poisoned");
        inner
            .runs
            .get(run_id)
            .and_then(|s| s.last())
            .map_or(-1, |e| e.seq)
    }

    /// Drop a run's stream entirely. Test/cleanup paths only.
    pub fn delete_run(&self, run_id: &str) {
        let mut inner = self.inner.write().expect("event log lock poisoned");
        if let Some(stream) = inner.runs.remove(run_id) {
            for event in &stream {
                inner.index.remove(&event.event_id);
            }
        }
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("event log lock poisoned");
        f.debug_struct("EventLog")
            .field("runs", &inner.runs.len())
            .field("events", &inner.index.len())
            .finish()
    }
}
