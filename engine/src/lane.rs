use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use lane_replay_common::config::{EventConfig, SyncConfig};
use lane_replay_common::{FrameNotice, LaneId, PipelineClock, SessionId};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::detect::{Detection, DetectionJob, PoolHandle};
use crate::events::{Event, EventDetector, Phase};
use crate::registry::{Lane, LaneRegistry};
use crate::stats::PipelineStats;
use crate::sync::{FrameSet, Synchronizer};

/// How often lane tasks advance event-detector timeouts without detections.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// What a lane is doing right now, published on a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneStatus {
    pub session: Option<SessionId>,
    pub phase: Phase,
    pub cycle: u64,
    pub degraded: bool,
}

impl Default for LaneStatus {
    fn default() -> Self {
        Self {
            session: None,
            phase: Phase::Idle,
            cycle: 0,
            degraded: false,
        }
    }
}

pub enum LaneControl {
    /// Re-read the registry now; the ack fires once the lane has caught up,
    /// so a session that ended gets no further frame sets.
    Refresh(oneshot::Sender<LaneStatus>),
    Stop,
}

/// Everything a lane task needs from the pipeline.
pub struct LaneContext {
    pub registry: Arc<LaneRegistry>,
    pub pool: PoolHandle,
    pub events: mpsc::Sender<Event>,
    pub stats: Arc<PipelineStats>,
    pub clock: PipelineClock,
    pub sync_config: SyncConfig,
    pub event_config: EventConfig,
    pub detection_queue: usize,
}

/// Per-lane loop: notices in, frame sets to the detection pool, detections
/// through the session's event detector, events out to clip extraction.
pub struct LaneTask {
    lane_id: LaneId,
    ctx: LaneContext,
    sync: Synchronizer,
    detector: Option<EventDetector>,
    status: watch::Sender<LaneStatus>,
    detections_tx: mpsc::Sender<Detection>,
    detections_rx: mpsc::Receiver<Detection>,
}

impl LaneTask {
    pub fn new(lane: &Lane, ctx: LaneContext) -> (Self, watch::Receiver<LaneStatus>) {
        let (status, status_rx) = watch::channel(LaneStatus::default());
        let (detections_tx, detections_rx) = mpsc::channel(ctx.detection_queue.max(1) * 2);
        let task = Self {
            lane_id: lane.id.clone(),
            sync: Synchronizer::new(lane.id.clone(), lane.cameras.clone(), &ctx.sync_config),
            detector: None,
            ctx,
            status,
            detections_tx,
            detections_rx,
        };
        (task, status_rx)
    }

    pub async fn run(
        mut self,
        mut notices: broadcast::Receiver<FrameNotice>,
        mut control: mpsc::Receiver<LaneControl>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(lane = %self.lane_id, cameras = ?self.sync.cameras(), "lane task started");
        if !self.reconcile() {
            return;
        }
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                command = control.recv() => match command {
                    Some(LaneControl::Refresh(ack)) => {
                        let alive = self.reconcile();
                        let _ = ack.send(self.status.borrow().clone());
                        if !alive {
                            break;
                        }
                    }
                    Some(LaneControl::Stop) | None => break,
                },
                Some(detection) = self.detections_rx.recv() => {
                    self.on_detection(detection).await;
                }
                notice = notices.recv() => match notice {
                    Ok(notice) => self.on_notice(notice),
                    Err(RecvError::Lagged(skipped)) => {
                        self.ctx.stats.notices_lagged.fetch_add(skipped, Ordering::Relaxed);
                        warn!(lane = %self.lane_id, skipped, "lane fell behind the notice bus");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    if !self.reconcile() {
                        break;
                    }
                    let now = self.ctx.clock.now_ms();
                    if let Some(detector) = self.detector.as_mut() {
                        let events = detector.tick(now);
                        self.publish(events).await;
                    }
                }
            }
        }

        if let Some(detector) = self.detector.take() {
            self.discard(detector);
        }
        info!(lane = %self.lane_id, "lane task stopped");
    }

    /// Bring cameras and session in line with the registry. Returns false
    /// once the lane has been removed.
    fn reconcile(&mut self) -> bool {
        let Some(lane) = self.ctx.registry.snapshot(&self.lane_id) else {
            info!(lane = %self.lane_id, "lane removed from registry");
            return false;
        };
        if lane.cameras != self.sync.cameras() {
            info!(lane = %self.lane_id, cameras = ?lane.cameras, "camera assignment changed");
            self.sync.reassign(lane.cameras.clone());
        }

        // A session id reused after an end/start pair is a new session.
        let current = self
            .detector
            .as_ref()
            .map(|d| (d.session_id().clone(), d.session_started_ms()));
        let wanted = lane.session.as_ref().map(|s| (s.id.clone(), s.started_at_ms));
        if current != wanted {
            if let Some(detector) = self.detector.take() {
                self.discard(detector);
            }
            if let Some((session, started_at_ms)) = wanted {
                info!(lane = %self.lane_id, session = %session, started_at_ms, "event detector attached");
                self.detector = Some(EventDetector::new(
                    session,
                    started_at_ms,
                    self.lane_id.clone(),
                    self.ctx.event_config.clone(),
                ));
            }
            self.publish_status();
        }
        true
    }

    /// Drop a session's detector without emitting anything for an unfinished
    /// delivery, and withdraw its queued frame sets.
    fn discard(&mut self, detector: EventDetector) {
        let cancelled = self.ctx.pool.cancel_session(&self.lane_id, detector.session_id());
        if detector.phase() != Phase::Idle {
            info!(
                lane = %self.lane_id,
                session = %detector.session_id(),
                phase = detector.phase().as_str(),
                "session ended mid-delivery, detector discarded"
            );
        }
        debug!(lane = %self.lane_id, session = %detector.session_id(), cancelled, "event detector detached");
    }

    fn on_notice(&mut self, notice: FrameNotice) {
        let was_degraded = self.sync.is_degraded();
        for set in self.sync.on_notice(notice) {
            self.on_frame_set(set);
        }
        if self.sync.is_degraded() != was_degraded {
            self.publish_status();
        }
    }

    fn on_frame_set(&mut self, set: FrameSet) {
        self.ctx.stats.frame_sets.fetch_add(1, Ordering::Relaxed);
        if set.degraded {
            self.ctx.stats.degraded_frame_sets.fetch_add(1, Ordering::Relaxed);
        }
        // Without a session nobody consumes detections.
        let Some(detector) = self.detector.as_ref() else {
            return;
        };
        debug!(lane = %self.lane_id, set = set.id, spread = set.spread_ms(), degraded = set.degraded, "frame set ready");
        self.ctx.pool.submit(DetectionJob {
            session_id: detector.session_id().clone(),
            frame_set: set,
            reply: self.detections_tx.clone(),
        });
    }

    async fn on_detection(&mut self, detection: Detection) {
        let Some(detector) = self.detector.as_mut() else {
            return;
        };
        let phase = detector.phase();
        let events = detector.on_detection(&detection);
        let changed = detector.phase() != phase;
        self.publish(events).await;
        if changed {
            self.publish_status();
        }
    }

    async fn publish(&mut self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        for event in events {
            self.ctx.stats.events.fetch_add(1, Ordering::Relaxed);
            info!(
                lane = %self.lane_id,
                session = %event.session_id,
                event = %event.id,
                kind = %event.kind,
                ts = event.ts_ms,
                confidence = event.confidence,
                "event emitted"
            );
            if self.ctx.events.send(event).await.is_err() {
                warn!(lane = %self.lane_id, "clip extraction gone, event dropped");
            }
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = LaneStatus {
            session: self.detector.as_ref().map(|d| d.session_id().clone()),
            phase: self.detector.as_ref().map_or(Phase::Idle, EventDetector::phase),
            cycle: self.detector.as_ref().map_or(0, EventDetector::cycle),
            degraded: self.sync.is_degraded(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
