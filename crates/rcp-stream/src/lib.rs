// SPDX-License-Identifier: MIT OR Apache-2.0
//! rcp-stream
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Streaming framings over the event log.
//!
//! Consumers do not register callbacks with an emitter; they hold an
//! [`EventCursor`] and pull. Both framings (SSE and WebSocket JSON frames)
//! carry the same event stream and honor the `after_seq` reconnection
//! cursor, so a dropped connection resumes exactly where it left off.

use chrono::{DateTime, Utc};
use rcp_core::Event;
use rcp_log::EventLog;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Retry hint sent to SSE clients on connect.
pub const DEFAULT_RETRY_MS: u64 = 5_000;

/// Interval between heartbeats on both framings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

// ── SSE ─────────────────────────────────────────────────────────────

/// One server-sent-events message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field.
    pub event: String,
    /// `id:` field (the event seq).
    pub id: Option<i64>,
    /// `retry:` field in milliseconds.
    pub retry: Option<u64>,
    /// `data:` field, already JSON-encoded.
    pub data: Option<String>,
}

impl SseFrame {
    /// Frame for a log event: `event: <type>`, `id: <seq>`, JSON data.
    ///
    /// # Errors
    ///
    /// Serialization failures.
    pub fn for_event(event: &Event) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: event.kind().as_str().to_string(),
            id: Some(event.seq),
            retry: None,
            data: Some(serde_json::to_string(event)?),
        })
    }

    /// The hello frame sent on connect, carrying the retry hint.
    #[must_use]
    pub fn hello() -> Self {
        Self {
            event: "hello".into(),
            id: None,
            retry: Some(DEFAULT_RETRY_MS),
            data: Some("{}".into()),
        }
    }

    /// A heartbeat frame.
    #[must_use]
    pub fn heartbeat(ts: DateTime<Utc>) -> Self {
        Self {
            event: "heartbeat".into(),
            id: None,
            retry: None,
            data: Some(format!("{{\"ts\":\"{}\"}}", ts.to_rfc3339())),
        }
    }

    /// Encode to the wire format, terminated by the blank line.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        out.push_str("event: ");
        out.push_str(&self.event);
        out.push('\n');
        if let Some(id) = self.id {
            out.push_str(&format!("id: {id}\n"));
        }
        if let Some(retry) = self.retry {
            out.push_str(&format!("retry: {retry}\n"));
        }
        if let Some(data) = &self.data {
            for line in data.lines() {
                out.push_str("data: ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out.push('\n');
        out
    }
}

// ── WebSocket ───────────────────────────────────────────────────────

/// JSON frames exchanged over a WebSocket subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsFrame {
    /// A log event.
    Event {
        /// The event.
        event: Event,
        /// Its seq, duplicated for cheap client-side cursor tracking.
        seq: i64,
    },
    /// Server liveness signal, sent every [`HEARTBEAT_INTERVAL`].
    Heartbeat {
        /// Server time.
        ts: DateTime<Utc>,
    },
    /// Client liveness probe.
    Ping,
    /// Server response to [`WsFrame::Ping`].
    Pong,
    /// Sent on connect with the stream's current position.
    Subscribed {
        /// Seq of the newest event at subscription time (`-1` if empty).
        seq: i64,
    },
    /// Terminal protocol error.
    Error {
        /// Human-readable description.
        error: String,
    },
}

impl WsFrame {
    /// Wrap a log event.
    #[must_use]
    pub fn event(event: Event) -> Self {
        let seq = event.seq;
        Self::Event { event, seq }
    }

    /// The reply to a client frame, if one is required.
    #[must_use]
    pub fn reply_to(frame: &Self) -> Option<Self> {
        match frame {
            Self::Ping => Some(Self::Pong),
            _ => None,
        }
    }
}

// ── Cursor ──────────────────────────────────────────────────────────

/// A pull-based subscription over one run's stream.
///
/// The cursor remembers the last seq it handed out; [`next_batch`]
/// (Self::next_batch) returns only newer events, in order, gap-free. Both
/// transports are thin loops around this.
#[derive(Debug, Clone)]
pub struct EventCursor {
    log: Arc<EventLog>,
    run_id: String,
    after_seq: i64,
}

impl EventCursor {
    /// Cursor over `run_id` starting after `after_seq` (`-1` for the full
    /// stream).
    #[must_use]
    pub fn new(log: Arc<EventLog>, run_id: impl Into<String>, after_seq: i64) -> Self {
        Self {
            log,
            run_id: run_id.into(),
            after_seq,
        }
        .normalized()
    }

    fn normalized(mut self) -> Self {
        self.after_seq = self.after_seq.max(-1);
        self
    }

    /// The subscription handshake frame for this cursor's stream.
    #[must_use]
    pub fn subscribed_frame(&self) -> WsFrame {
        WsFrame::Subscribed {
            seq: self.log.latest_seq(&self.run_id),
        }
    }

    /// Current cursor position (last seq handed out).
    #[must_use]
    pub fn position(&self) -> i64 {
        self.after_seq
    }

    /// Pull the next page of events and advance the cursor.
    #[must_use]
    pub fn next_batch(&mut self, limit: Option<usize>) -> Vec<Event> {
        let page = self.log.query(&self.run_id, self.after_seq, limit, None);
        self.after_seq = page.cursor;
        page.events
    }

    /// Await events, polling at `interval` until at least one is available.
    pub async fn wait_batch(&mut self, interval: Duration, limit: Option<usize>) -> Vec<Event> {
        loop {
            let events = self.next_batch(limit);
            if !events.is_empty() {
                return events;
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcp_core::{EventPayload, RunState, Severity};
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

    fn seeded_log(n: i64) -> Arc<EventLog> {
        let log = Arc::new(EventLog::new());
        for seq in 0..n {
            log.append(event("run_s", seq)).unwrap();
        }
        log
    }

    #[test]
    fn sse_wire_format() {
        let ev = event("run_s", 7);
        let frame = SseFrame::for_event(&ev).unwrap();
        let wire = frame.to_wire();
        assert!(wire.starts_with("event: file.changed\n"));
        assert!(wire.contains("id: 7\n"));
        assert!(wire.contains("data: {"));
        assert!(wire.ends_with("\n\n"));
    }

    #[test]
    fn sse_hello_carries_retry_hint() {
        let wire = SseFrame::hello().to_wire();
        assert!(wire.contains("retry: 5000\n"));
    }

    #[test]
    fn sse_heartbeat_event_name() {
        let wire = SseFrame::heartbeat(Utc::now()).to_wire();
        assert!(wire.starts_with("event: heartbeat\n"));
    }

    #[test]
    fn ws_frames_tag_with_type() {
        let json = serde_json::to_value(WsFrame::Subscribed { seq: 4 }).unwrap();
        assert_eq!(json["type"], "subscribed");
        assert_eq!(json["seq"], 4);

        let json = serde_json::to_value(WsFrame::event(event("run_s", 2))).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["seq"], 2);
        assert_eq!(json["event"]["type"], "file.changed");

        let ping: WsFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, WsFrame::Ping);
        assert_eq!(WsFrame::reply_to(&ping), Some(WsFrame::Pong));
        assert_eq!(WsFrame::reply_to(&WsFrame::Pong), None);
    }

    #[test]
    fn cursor_resumes_after_seq() {
        let log = seeded_log(10);
        let mut cursor = EventCursor::new(Arc::clone(&log), "run_s", 5);
        let batch = cursor.next_batch(None);
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[0].seq, 6);
        for pair in batch.windows(2) {
            assert_eq!(pair[1].seq, pair[0].seq + 1);
        }
        assert_eq!(cursor.position(), 9);
        assert!(cursor.next_batch(None).is_empty());
    }

    #[test]
    fn cursor_sees_later_appends() {
        let log = seeded_log(3);
        let mut cursor = EventCursor::new(Arc::clone(&log), "run_s", -1);
        assert_eq!(cursor.next_batch(None).len(), 3);

        log.append(event("run_s", 3)).unwrap();
        let batch = cursor.next_batch(None);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].seq, 3);
    }

    #[test]
    fn subscribed_frame_reports_current_seq() {
        let log = seeded_log(5);
        let cursor = EventCursor::new(Arc::clone(&log), "run_s", -1);
        assert_eq!(cursor.subscribed_frame(), WsFrame::Subscribed { seq: 4 });

        let empty = EventCursor::new(log, "run_other", -1);
        assert_eq!(empty.subscribed_frame(), WsFrame::Subscribed { seq: -1 });
    }

    #[tokio::test(start_paused = true)]
    async fn wait_batch_polls_until_events_arrive() {
        let log = Arc::new(EventLog::new());
        let mut cursor = EventCursor::new(Arc::clone(&log), "run_w", -1);

        let writer = Arc::clone(&log);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            writer.append(event("run_w", 0)).unwrap();
        });

        let batch = cursor
            .wait_batch(Duration::from_millis(25), None)
            .await;
        assert_eq!(batch.len(), 1);
        handle.await.unwrap();
    }
}
