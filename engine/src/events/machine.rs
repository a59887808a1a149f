use lane_replay_common::config::EventConfig;
use lane_replay_common::detection::NormalizedPoint;
use lane_replay_common::{EventKind, LaneId, SessionId};
use tracing::{debug, info};

use super::signals::{pins_moved, Signals};
use super::{Event, EventId};
use crate::detect::{Detection, DetectionStatus};

/// Externally visible phase of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Approaching,
    Delivered,
    Settling,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Approaching => "approaching",
            Phase::Delivered => "delivered",
            Phase::Settling => "settling",
        }
    }
}

/// Consecutive frame sets agreeing on one signal.
#[derive(Debug, Clone, Copy)]
struct Run {
    start_ms: i64,
    start_set: u64,
    len: u32,
    conf_sum: f32,
}

impl Run {
    fn confidence(&self) -> f32 {
        self.conf_sum / self.len.max(1) as f32
    }
}

/// Extend `run` on a hit, reset it on a miss. Returns the run length.
fn advance(run: &mut Option<Run>, hit: Option<f32>, ts_ms: i64, set_id: u64) -> u32 {
    match (hit, run.as_mut()) {
        (Some(conf), Some(r)) => {
            r.len += 1;
            r.conf_sum += conf;
            r.len
        }
        (Some(conf), None) => {
            *run = Some(Run {
                start_ms: ts_ms,
                start_set: set_id,
                len: 1,
                conf_sum: conf,
            });
            1
        }
        (None, _) => {
            *run = None;
            0
        }
    }
}

enum State {
    Idle {
        approach: Option<Run>,
        release: Option<Run>,
    },
    Approaching {
        approach: Run,
        last_bowler_ms: i64,
        release: Option<Run>,
    },
    Delivered {
        delivery_start_ms: i64,
        released_ms: i64,
        on_deck: Option<Run>,
    },
    Settling {
        delivery_start_ms: i64,
        entered_ms: i64,
        last_pins: Option<Vec<NormalizedPoint>>,
        first_motion: Option<(i64, u64)>,
        stable: Option<Run>,
    },
}

impl State {
    fn idle() -> Self {
        State::Idle {
            approach: None,
            release: None,
        }
    }

    fn phase(&self) -> Phase {
        match self {
            State::Idle { .. } => Phase::Idle,
            State::Approaching { .. } => Phase::Approaching,
            State::Delivered { .. } => Phase::Delivered,
            State::Settling { .. } => Phase::Settling,
        }
    }
}

/// Delivery state machine for one session:
/// `Idle → Approaching → Delivered → Settling → Idle`.
///
/// Every transition needs `debounce_frames` consecutive frame sets agreeing
/// on its signal; single-frame flicker never moves the machine. Timeouts are
/// evaluated against capture time on each detection and against the
/// pipeline clock on [`EventDetector::tick`].
pub struct EventDetector {
    session_id: SessionId,
    session_started_ms: i64,
    lane_id: LaneId,
    config: EventConfig,
    state: Option<State>, // Option so transitions can take() the state
    cycle: u64,
    last_set_id: Option<u64>,
}

impl EventDetector {
    pub fn new(
        session_id: SessionId,
        session_started_ms: i64,
        lane_id: LaneId,
        config: EventConfig,
    ) -> Self {
        Self {
            session_id,
            session_started_ms,
            lane_id,
            config,
            state: Some(State::idle()),
            cycle: 1,
            last_set_id: None,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn session_started_ms(&self) -> i64 {
        self.session_started_ms
    }

    pub fn phase(&self) -> Phase {
        self.state.as_ref().map_or(Phase::Idle, State::phase)
    }

    /// Deliveries completed or abandoned so far, plus the one in progress.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Feed one detection. Detections for another session, captured before
    /// this session started, or older than one already seen, are ignored;
    /// failed detections only advance time.
    pub fn on_detection(&mut self, detection: &Detection) -> Vec<Event> {
        if detection.session_id != self.session_id
            || detection.captured_at_ms < self.session_started_ms
        {
            return Vec::new();
        }
        if self.last_set_id.is_some_and(|last| detection.frame_set_id <= last) {
            debug!(lane = %self.lane_id, set = detection.frame_set_id, "out-of-order detection ignored");
            return Vec::new();
        }
        self.last_set_id = Some(detection.frame_set_id);

        let ts = detection.captured_at_ms;
        let mut events = Vec::new();
        if detection.status == DetectionStatus::Ok {
            let signals = Signals::from_entities(&detection.entities, &self.config);
            events = self.step(&signals, ts, detection.frame_set_id);
        }
        events.extend(self.tick(ts));
        events
    }

    /// Apply timeouts as of `now_ms`.
    pub fn tick(&mut self, now_ms: i64) -> Vec<Event> {
        let Some(state) = self.state.take() else {
            return Vec::new();
        };
        let mut events = Vec::new();
        let next = match state {
            State::Approaching { last_bowler_ms, .. }
                if now_ms - last_bowler_ms > self.config.approach_timeout_ms =>
            {
                info!(lane = %self.lane_id, session = %self.session_id, "APPROACHING→IDLE: bowler lost, no delivery");
                self.cycle += 1;
                State::idle()
            }
            State::Delivered {
                delivery_start_ms,
                released_ms,
                ..
            } if now_ms - released_ms > self.config.delivered_timeout_ms => {
                info!(lane = %self.lane_id, session = %self.session_id, "DELIVERED→SETTLING: ball tracking lost");
                State::Settling {
                    delivery_start_ms,
                    entered_ms: now_ms,
                    last_pins: None,
                    first_motion: None,
                    stable: None,
                }
            }
            State::Settling {
                delivery_start_ms,
                entered_ms,
                first_motion,
                ..
            } if now_ms - entered_ms > self.config.settling_timeout_ms => {
                info!(lane = %self.lane_id, session = %self.session_id, "SETTLING→IDLE: settle timeout");
                self.finish_delivery(&mut events, delivery_start_ms, first_motion, now_ms, None);
                State::idle()
            }
            other => other,
        };
        self.state = Some(next);
        events
    }

    fn step(&mut self, signals: &Signals, ts: i64, set_id: u64) -> Vec<Event> {
        let Some(state) = self.state.take() else {
            return Vec::new();
        };
        let k = self.config.debounce_frames;
        let mut events = Vec::new();

        let next = match state {
            State::Idle {
                mut approach,
                mut release,
            } => {
                let approach_len = advance(&mut approach, signals.bowler, ts, set_id);
                let release_len = advance(&mut release, signals.released, ts, set_id);
                match (release, approach) {
                    (Some(r), Some(a)) if release_len >= k && approach_len >= k => {
                        info!(lane = %self.lane_id, session = %self.session_id, ts = r.start_ms, "IDLE→DELIVERED: approach and release confirmed together");
                        events.push(self.event(
                            EventKind::ApproachStart,
                            a.start_ms,
                            a.confidence(),
                            a.start_set,
                            None,
                        ));
                        events.push(self.event(EventKind::Release, r.start_ms, r.confidence(), set_id, None));
                        State::Delivered {
                            delivery_start_ms: a.start_ms.min(r.start_ms),
                            released_ms: r.start_ms,
                            on_deck: None,
                        }
                    }
                    // The approach went unseen; the delivery starts at release.
                    (Some(r), _) if release_len >= k => {
                        info!(lane = %self.lane_id, session = %self.session_id, ts = r.start_ms, "IDLE→DELIVERED: release without observed approach");
                        events.push(self.event(EventKind::Release, r.start_ms, r.confidence(), set_id, None));
                        State::Delivered {
                            delivery_start_ms: r.start_ms,
                            released_ms: r.start_ms,
                            on_deck: None,
                        }
                    }
                    (_, Some(a)) if approach_len >= k => {
                        info!(lane = %self.lane_id, session = %self.session_id, ts = a.start_ms, "IDLE→APPROACHING: bowler on the approach");
                        State::Approaching {
                            approach: a,
                            last_bowler_ms: ts,
                            release,
                        }
                    }
                    _ => State::Idle { approach, release },
                }
            }
            State::Approaching {
                approach,
                mut last_bowler_ms,
                mut release,
            } => {
                if signals.bowler.is_some() {
                    last_bowler_ms = ts;
                }
                let release_len = advance(&mut release, signals.released, ts, set_id);
                match release {
                    Some(r) if release_len >= k => {
                        info!(lane = %self.lane_id, session = %self.session_id, ts = r.start_ms, "APPROACHING→DELIVERED: ball released");
                        events.push(self.event(
                            EventKind::ApproachStart,
                            approach.start_ms,
                            approach.confidence(),
                            approach.start_set,
                            None,
                        ));
                        events.push(self.event(EventKind::Release, r.start_ms, r.confidence(), set_id, None));
                        State::Delivered {
                            delivery_start_ms: approach.start_ms,
                            released_ms: r.start_ms,
                            on_deck: None,
                        }
                    }
                    _ => State::Approaching {
                        approach,
                        last_bowler_ms,
                        release,
                    },
                }
            }
            State::Delivered {
                delivery_start_ms,
                released_ms,
                mut on_deck,
            } => {
                let len = advance(&mut on_deck, signals.on_deck, ts, set_id);
                match on_deck {
                    Some(d) if len >= k => {
                        info!(lane = %self.lane_id, session = %self.session_id, ts = d.start_ms, "DELIVERED→SETTLING: ball reached the pin deck");
                        State::Settling {
                            delivery_start_ms,
                            entered_ms: d.start_ms,
                            last_pins: None,
                            first_motion: None,
                            stable: None,
                        }
                    }
                    _ => State::Delivered {
                        delivery_start_ms,
                        released_ms,
                        on_deck,
                    },
                }
            }
            State::Settling {
                delivery_start_ms,
                entered_ms,
                last_pins,
                mut first_motion,
                mut stable,
            } => {
                let moved = last_pins
                    .as_deref()
                    .is_some_and(|prev| pins_moved(prev, &signals.pins, self.config.pin_motion_epsilon));
                if moved {
                    if first_motion.is_none() {
                        debug!(lane = %self.lane_id, ts, "pin motion observed");
                        first_motion = Some((ts, set_id));
                    }
                    stable = None;
                } else {
                    // No pins in view is as settled as it gets.
                    let conf = signals.pin_confidence.unwrap_or(1.0);
                    advance(&mut stable, Some(conf), ts, set_id);
                }

                let quiet_long_enough = ts - entered_ms >= self.config.settle_quiet_ms;
                match stable {
                    Some(s) if s.len >= k && (first_motion.is_some() || quiet_long_enough) => {
                        info!(lane = %self.lane_id, session = %self.session_id, ts = s.start_ms, "SETTLING→IDLE: pins settled");
                        self.finish_delivery(&mut events, delivery_start_ms, first_motion, s.start_ms, Some(s));
                        State::idle()
                    }
                    _ => State::Settling {
                        delivery_start_ms,
                        entered_ms,
                        last_pins: Some(signals.pins.clone()),
                        first_motion,
                        stable,
                    },
                }
            }
        };
        self.state = Some(next);
        events
    }

    /// Emit the closing events of a delivery and start a new cycle.
    fn finish_delivery(
        &mut self,
        events: &mut Vec<Event>,
        delivery_start_ms: i64,
        first_motion: Option<(i64, u64)>,
        end_ms: i64,
        stable: Option<Run>,
    ) {
        let (confidence, set_id) = stable.map_or((0.0, self.last_set_id.unwrap_or_default()), |s| {
            (s.confidence(), s.start_set)
        });
        if let Some((motion_ms, motion_set)) = first_motion {
            events.push(self.event(EventKind::PinImpact, motion_ms, confidence, motion_set, None));
        }
        events.push(self.event(
            EventKind::EndOfDelivery,
            end_ms,
            confidence,
            set_id,
            Some(delivery_start_ms),
        ));
        self.cycle += 1;
    }

    fn event(
        &self,
        kind: EventKind,
        ts_ms: i64,
        confidence: f32,
        frame_set_id: u64,
        span_start_ms: Option<i64>,
    ) -> Event {
        let event = Event {
            id: EventId::new(&self.session_id, self.session_started_ms, self.cycle, kind),
            session_id: self.session_id.clone(),
            lane_id: self.lane_id.clone(),
            kind,
            ts_ms,
            confidence,
            frame_set_id,
            span_start_ms,
        };
        info!(lane = %self.lane_id, session = %self.session_id, event = %event.id, ts = ts_ms, confidence, "event emitted");
        event
    }
}
