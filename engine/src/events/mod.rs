pub mod machine;
pub mod signals;

use std::fmt;

use lane_replay_common::{EventKind, LaneId, SessionId};

pub use machine::{EventDetector, Phase};
pub use signals::Signals;

/// Stable identity of an event: session and its start time, delivery cycle
/// and kind. A re-emitted event carries the same id; the same session id
/// started again does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(String);

impl EventId {
    pub fn new(session_id: &SessionId, session_started_ms: i64, cycle: u64, kind: EventKind) -> Self {
        Self(format!("{session_id}-{session_started_ms}-{cycle}-{kind}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A delivery milestone. Immutable once emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub session_id: SessionId,
    pub lane_id: LaneId,
    pub kind: EventKind,
    pub ts_ms: i64,
    pub confidence: f32,
    /// Frame set that confirmed the event.
    pub frame_set_id: u64,
    /// Start of the delivery this event closes (`EndOfDelivery` only).
    pub span_start_ms: Option<i64>,
}

impl Event {
    /// Earliest instant the replay of this event should show.
    pub fn anchor_start_ms(&self) -> i64 {
        self.span_start_ms.map_or(self.ts_ms, |s| s.min(self.ts_ms))
    }
}
