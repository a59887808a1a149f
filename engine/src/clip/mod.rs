pub mod encoder;
pub mod handoff;
pub mod keys;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lane_replay_capture::{RingBufferStore, TimeRange};
use lane_replay_common::config::ClipConfig;
use lane_replay_common::{CameraId, Frame, PipelineClock};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::events::{Event, EventId};
use crate::registry::LaneRegistry;
use crate::stats::PipelineStats;

pub use encoder::FfmpegClipSink;
pub use handoff::{ClipFailure, ClipSink, HandoffDispatcher, RetryPolicy, SinkError};

/// How much of the clip window a camera's frames cover.
#[derive(Debug, Clone, PartialEq)]
pub enum Coverage {
    Complete,
    /// Some of the window was evicted or never captured.
    Partial { missing: Vec<TimeRange> },
    /// Nothing retained for the window at all.
    Empty,
}

#[derive(Debug, Clone)]
pub struct CameraClip {
    pub camera_id: CameraId,
    /// In capture order.
    pub frames: Vec<Arc<Frame>>,
    pub coverage: Coverage,
}

/// Multi-angle footage around one event, ready for the storage collaborator.
#[derive(Debug, Clone)]
pub struct Clip {
    /// Equal to the event id, so storage can deduplicate retries.
    pub id: String,
    pub event: Event,
    pub window: TimeRange,
    pub cameras: Vec<CameraClip>,
    pub extracted_at: DateTime<Utc>,
}

impl Clip {
    pub fn is_partial(&self) -> bool {
        self.cameras
            .iter()
            .any(|c| c.coverage != Coverage::Complete)
    }

    pub fn frame_count(&self) -> usize {
        self.cameras.iter().map(|c| c.frames.len()).sum()
    }
}

/// Time window a clip of `event` has to cover.
pub fn clip_window(event: &Event, config: &ClipConfig) -> TimeRange {
    TimeRange::new(
        event.anchor_start_ms() - config.pre_roll_ms,
        event.ts_ms + config.post_roll_ms,
    )
}

/// Read `window` for every camera and grade its coverage. Gaps no longer than
/// `slack_ms` at the edges or between frames are tolerated.
pub fn extract(
    store: &RingBufferStore,
    event: &Event,
    cameras: &[CameraId],
    window: TimeRange,
    slack_ms: i64,
) -> Clip {
    let cameras = cameras
        .iter()
        .map(|camera_id| {
            let frames = store.read(camera_id, window);
            let coverage = grade(&frames, window, slack_ms);
            CameraClip {
                camera_id: camera_id.clone(),
                frames,
                coverage,
            }
        })
        .collect();
    Clip {
        id: event.id.to_string(),
        event: event.clone(),
        window,
        cameras,
        extracted_at: Utc::now(),
    }
}

fn grade(frames: &[Arc<Frame>], window: TimeRange, slack_ms: i64) -> Coverage {
    let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
        return Coverage::Empty;
    };
    let mut missing = Vec::new();
    if first.captured_at_ms - window.start_ms > slack_ms {
        missing.push(TimeRange::new(window.start_ms, first.captured_at_ms));
    }
    for pair in frames.windows(2) {
        let (a, b) = (pair[0].captured_at_ms, pair[1].captured_at_ms);
        if b - a > slack_ms {
            missing.push(TimeRange::new(a, b));
        }
    }
    if window.end_ms - last.captured_at_ms > slack_ms {
        missing.push(TimeRange::new(last.captured_at_ms, window.end_ms));
    }
    if missing.is_empty() {
        Coverage::Complete
    } else {
        Coverage::Partial { missing }
    }
}

/// Bounded memory of event ids already extracted.
struct SeenEvents {
    ids: HashSet<EventId>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl SeenEvents {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` if the id was already present.
    fn insert(&mut self, id: &EventId) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Turns events into clips.
///
/// Each accepted event gets its own task that waits for the post-roll to be
/// captured, reads the ring buffers and queues the clip for storage. The
/// manager itself never waits on extraction or storage.
pub struct ClipExtractionManager {
    store: Arc<RingBufferStore>,
    registry: Arc<LaneRegistry>,
    clock: PipelineClock,
    config: ClipConfig,
    seen: SeenEvents,
    handoff: mpsc::Sender<Clip>,
    stats: Arc<PipelineStats>,
    tasks: JoinSet<()>,
}

impl ClipExtractionManager {
    pub fn new(
        store: Arc<RingBufferStore>,
        registry: Arc<LaneRegistry>,
        clock: PipelineClock,
        config: ClipConfig,
        handoff: mpsc::Sender<Clip>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            seen: SeenEvents::new(config.dedup_capacity),
            store,
            registry,
            clock,
            config,
            handoff,
            stats,
            tasks: JoinSet::new(),
        }
    }

    /// Consume events until every sender is gone, then let in-flight
    /// extractions finish.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        info!(triggers = ?self.config.triggers, pre_roll_ms = self.config.pre_roll_ms, post_roll_ms = self.config.post_roll_ms, "clip extraction started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.submit(event);
                    }
                    None => break,
                },
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = result {
                        warn!(error = %e, "clip extraction task failed");
                    }
                }
            }
        }
        let in_flight = self.tasks.len();
        if in_flight > 0 {
            info!(in_flight, "draining clip extractions");
        }
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "clip extraction task failed");
            }
        }
        info!("clip extraction stopped");
    }

    /// Schedule extraction for `event`. Returns whether an extraction was
    /// scheduled; duplicates and non-trigger kinds are no-ops.
    pub fn submit(&mut self, event: Event) -> bool {
        if !self.config.triggers.contains(&event.kind) {
            return false;
        }
        if !self.seen.insert(&event.id) {
            self.stats.duplicate_events.fetch_add(1, Ordering::Relaxed);
            debug!(event = %event.id, "duplicate event ignored");
            return false;
        }
        let Some(lane) = self.registry.snapshot(&event.lane_id) else {
            warn!(lane = %event.lane_id, event = %event.id, "lane gone before extraction, event dropped");
            return false;
        };

        let window = clip_window(&event, &self.config);
        let ready_at = self
            .clock
            .instant_at(window.end_ms + self.config.extraction_margin_ms);
        let store = Arc::clone(&self.store);
        let handoff = self.handoff.clone();
        let stats = Arc::clone(&self.stats);
        let slack_ms = self.config.coverage_slack_ms;
        info!(event = %event.id, lane = %lane.id, start = window.start_ms, end = window.end_ms, cameras = lane.cameras.len(), "clip extraction scheduled");

        self.tasks.spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            let clip = extract(&store, &event, &lane.cameras, window, slack_ms);
            stats.clips_extracted.fetch_add(1, Ordering::Relaxed);
            if clip.is_partial() {
                stats.clips_partial.fetch_add(1, Ordering::Relaxed);
                for camera in &clip.cameras {
                    if camera.coverage != Coverage::Complete {
                        warn!(
                            clip = %clip.id,
                            camera = %camera.camera_id,
                            coverage = ?camera.coverage,
                            retained = ?store.retained_span(&camera.camera_id),
                            "clip partial for camera"
                        );
                    }
                }
            }
            info!(clip = %clip.id, frames = clip.frame_count(), partial = clip.is_partial(), "clip extracted");
            if handoff.send(clip).await.is_err() {
                warn!(event = %event.id, "handoff queue closed, clip dropped");
            }
        });
        true
    }
}
