use std::collections::HashMap;
use std::sync::Arc;

use lane_replay_capture::ingest::IngestTiming;
use lane_replay_capture::source::build_source;
use lane_replay_capture::{CaptureSource, IngestStats, IngestionUnit, NoticeBus, RingBufferStore};
use lane_replay_common::config::Config;
use lane_replay_common::{CameraId, LaneId, PipelineClock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::clip::{ClipExtractionManager, ClipFailure, ClipSink, HandoffDispatcher, RetryPolicy};
use crate::detect::{DetectionPool, InferenceBackend, PoolHandle};
use crate::events::Event;
use crate::lane::{LaneContext, LaneControl, LaneStatus, LaneTask};
use crate::registry::{Lane, LaneRegistry, RegistryError, SessionCommand};
use crate::stats::PipelineStats;

/// Notices buffered per lane before a slow lane starts skipping.
const NOTICE_BUS_CAPACITY: usize = 4_096;
const EVENT_QUEUE_DEPTH: usize = 256;
const ALERT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("camera {0} is not configured")]
    UnknownCamera(CameraId),
    #[error("lane {0} task is not running")]
    LaneUnavailable(LaneId),
    #[error("no camera could be started")]
    NoCameras,
}

struct LaneHandle {
    control: mpsc::Sender<LaneControl>,
    status: watch::Receiver<LaneStatus>,
}

/// The running capture → sync → detect → event → clip pipeline.
///
/// Owns every long-lived task. Session-service commands enter through
/// [`Pipeline::apply`]; nothing inside the pipeline writes the registry.
pub struct Pipeline {
    config: Config,
    clock: PipelineClock,
    registry: Arc<LaneRegistry>,
    bus: NoticeBus,
    stats: Arc<PipelineStats>,
    ingest_stats: Arc<IngestStats>,
    pool_handle: PoolHandle,
    pool: DetectionPool,
    events_tx: mpsc::Sender<Event>,
    lanes: HashMap<LaneId, LaneHandle>,
    shutdown_tx: watch::Sender<bool>,
    ingest_tasks: JoinSet<()>,
    lane_tasks: JoinSet<()>,
    clip_task: JoinHandle<()>,
    handoff_task: JoinHandle<()>,
}

impl Pipeline {
    /// Start capture for every configured camera, the detection pool, clip
    /// extraction and handoff, and one task per bootstrap lane.
    ///
    /// `sources` overrides the capture source of individual cameras; the rest
    /// are built from their config section. A camera that cannot get a ring
    /// buffer is logged and left out; the others run normally.
    pub fn start(
        config: Config,
        backend: Arc<dyn InferenceBackend>,
        sink: Arc<dyn ClipSink>,
        mut sources: HashMap<CameraId, Box<dyn CaptureSource>>,
    ) -> Result<(Self, mpsc::Receiver<ClipFailure>), PipelineError> {
        let clock = PipelineClock::new();
        let store = Arc::new(RingBufferStore::new(
            config.buffer.retention_ms(),
            config.buffer.max_frames,
        ));
        let registry = Arc::new(LaneRegistry::new());
        let bus = NoticeBus::new(NOTICE_BUS_CAPACITY);
        let stats = Arc::new(PipelineStats::default());
        let ingest_stats = Arc::new(IngestStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut ingest_tasks = JoinSet::new();
        for camera in &config.cameras {
            let writer = match store.register(&camera.id, camera.fps) {
                Ok(writer) => writer,
                Err(e) => {
                    error!(camera = %camera.id, error = %e, "camera not started");
                    continue;
                }
            };
            let source = sources
                .remove(&camera.id)
                .unwrap_or_else(|| build_source(camera));
            let unit = IngestionUnit::new(
                source,
                writer,
                bus.clone(),
                clock,
                IngestTiming::from(camera),
                Arc::clone(&ingest_stats),
            );
            ingest_tasks.spawn(unit.run(shutdown_rx.clone()));
        }
        if ingest_tasks.is_empty() {
            return Err(PipelineError::NoCameras);
        }

        let mut pool = DetectionPool::new(
            backend,
            Arc::clone(&store),
            &config.detection,
            Arc::clone(&stats),
        );
        pool.spawn_workers(config.detection.workers, shutdown_rx.clone());
        let pool_handle = pool.handle();

        let (alerts_tx, alerts_rx) = mpsc::channel(ALERT_QUEUE_DEPTH);
        let (handoff_tx, handoff_rx) = mpsc::channel(config.storage.queue_depth);
        let dispatcher = HandoffDispatcher::new(
            sink,
            RetryPolicy::from(&config.storage),
            alerts_tx,
            Arc::clone(&stats),
        );
        let handoff_task = tokio::spawn(dispatcher.run(handoff_rx));

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let manager = ClipExtractionManager::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            clock,
            config.clips.clone(),
            handoff_tx,
            Arc::clone(&stats),
        );
        let clip_task = tokio::spawn(manager.run(events_rx));

        let mut pipeline = Self {
            config,
            clock,
            registry,
            bus,
            stats,
            ingest_stats,
            pool_handle,
            pool,
            events_tx,
            lanes: HashMap::new(),
            shutdown_tx,
            ingest_tasks,
            lane_tasks: JoinSet::new(),
            clip_task,
            handoff_task,
        };

        for lane in pipeline.config.lanes.clone() {
            let command = SessionCommand::RegisterLane {
                lane: lane.id.clone(),
                cameras: lane.cameras.clone(),
            };
            match pipeline.registry.apply(&command, clock.now_ms()) {
                Ok(Some(lane)) => pipeline.spawn_lane(&lane),
                Ok(None) => {}
                Err(e) => warn!(lane = %lane.id, error = %e, "bootstrap lane skipped"),
            }
        }
        info!(
            cameras = pipeline.ingest_tasks.len(),
            lanes = pipeline.lanes.len(),
            "pipeline started"
        );
        Ok((pipeline, alerts_rx))
    }

    fn spawn_lane(&mut self, lane: &Lane) {
        let ctx = LaneContext {
            registry: Arc::clone(&self.registry),
            pool: self.pool_handle.clone(),
            events: self.events_tx.clone(),
            stats: Arc::clone(&self.stats),
            clock: self.clock,
            sync_config: self.config.sync.clone(),
            event_config: self.config.events.clone(),
            detection_queue: self.config.detection.queue_depth,
        };
        let (task, status) = LaneTask::new(lane, ctx);
        let (control, control_rx) = mpsc::channel(8);
        self.lane_tasks.spawn(task.run(
            self.bus.subscribe(),
            control_rx,
            self.shutdown_tx.subscribe(),
        ));
        self.lanes.insert(lane.id.clone(), LaneHandle { control, status });
    }

    /// Apply a session-service command and wait until the affected lane task
    /// has caught up with it. Returns the lane's status afterwards, or `None`
    /// when the lane was removed.
    pub async fn apply(&mut self, command: SessionCommand) -> Result<Option<LaneStatus>, PipelineError> {
        if let SessionCommand::RegisterLane { cameras, .. }
        | SessionCommand::ReassignCameras { cameras, .. } = &command
        {
            if let Some(unknown) = cameras.iter().find(|c| self.config.camera(c).is_none()) {
                return Err(PipelineError::UnknownCamera(unknown.clone()));
            }
        }

        let lane = self.registry.apply(&command, self.clock.now_ms())?;
        let lane_id = command.lane().clone();
        match (&command, lane) {
            (SessionCommand::RegisterLane { .. }, Some(lane)) => self.spawn_lane(&lane),
            (SessionCommand::RemoveLane { .. }, _) => {
                if let Some(handle) = self.lanes.remove(&lane_id) {
                    let _ = handle.control.send(LaneControl::Stop).await;
                }
                return Ok(None);
            }
            _ => {}
        }

        let handle = self
            .lanes
            .get(&lane_id)
            .ok_or_else(|| PipelineError::LaneUnavailable(lane_id.clone()))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        handle
            .control
            .send(LaneControl::Refresh(ack_tx))
            .await
            .map_err(|_| PipelineError::LaneUnavailable(lane_id.clone()))?;
        let status = ack_rx
            .await
            .map_err(|_| PipelineError::LaneUnavailable(lane_id))?;
        Ok(Some(status))
    }

    pub fn lane_status(&self, lane_id: &LaneId) -> Option<LaneStatus> {
        self.lanes.get(lane_id).map(|h| h.status.borrow().clone())
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn ingest_stats(&self) -> &Arc<IngestStats> {
        &self.ingest_stats
    }

    /// Receiver that flips to `true` when shutdown starts.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop capture and lanes, then let already-triggered extractions and
    /// their handoffs finish.
    pub async fn shutdown(self) {
        info!("pipeline shutting down");
        let _ = self.shutdown_tx.send(true);

        let Self {
            mut ingest_tasks,
            mut lane_tasks,
            pool,
            events_tx,
            lanes,
            clip_task,
            handoff_task,
            ..
        } = self;

        while let Some(result) = ingest_tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "ingestion task ended abnormally");
            }
        }
        drop(lanes);
        while let Some(result) = lane_tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "lane task ended abnormally");
            }
        }
        pool.join().await;

        // Last event sender: the clip manager drains and then closes handoff.
        drop(events_tx);
        if let Err(e) = clip_task.await {
            warn!(error = %e, "clip extraction ended abnormally");
        }
        if let Err(e) = handoff_task.await {
            warn!(error = %e, "clip handoff ended abnormally");
        }
        info!("pipeline stopped");
    }
}
