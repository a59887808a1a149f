use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lane_replay_capture::RingBufferStore;
use lane_replay_common::config::DetectionConfig;
use lane_replay_common::{Frame, LaneId, SessionId};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Detection, DetectionStatus, InferenceBackend, InferenceError, InferenceInput};
use crate::stats::PipelineStats;
use crate::sync::FrameSet;

/// Log at error level every this many consecutive failures.
const FAILURE_ALERT_EVERY: u64 = 10;

/// One frame set waiting for inference, with the lane's reply channel.
pub struct DetectionJob {
    pub session_id: SessionId,
    pub frame_set: FrameSet,
    pub reply: mpsc::Sender<Detection>,
}

struct Shared {
    queue: Mutex<VecDeque<DetectionJob>>,
    notify: Notify,
    /// One permit per worker. A backend call holds its permit until it
    /// returns, even after the worker has given up on it.
    inflight: Arc<Semaphore>,
    depth: usize,
    consecutive_failures: AtomicU64,
    stats: Arc<PipelineStats>,
}

/// Cloneable submission side of the pool, held by every lane task.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<Shared>,
}

impl PoolHandle {
    /// Queue a frame set. When the queue is full the oldest waiting job is
    /// dropped, so inference always works on the freshest frames.
    pub fn submit(&self, job: DetectionJob) {
        let dropped = {
            let mut queue = self.shared.queue.lock();
            queue.push_back(job);
            if queue.len() > self.shared.depth {
                queue.pop_front()
            } else {
                None
            }
        };
        if let Some(old) = dropped {
            self.shared.stats.detections_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                lane = %old.frame_set.lane_id,
                set = old.frame_set.id,
                "detection queue full, dropped oldest frame set"
            );
        }
        self.shared.notify.notify_one();
    }

    /// Drop queued jobs for a session that has ended.
    pub fn cancel_session(&self, lane_id: &LaneId, session_id: &SessionId) -> usize {
        let mut queue = self.shared.queue.lock();
        let before = queue.len();
        queue.retain(|job| !(&job.frame_set.lane_id == lane_id && &job.session_id == session_id));
        before - queue.len()
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

/// Bounded worker pool in front of the inference backend.
pub struct DetectionPool {
    shared: Arc<Shared>,
    backend: Arc<dyn InferenceBackend>,
    store: Arc<RingBufferStore>,
    timeout: Duration,
    workers: Vec<JoinHandle<()>>,
}

impl DetectionPool {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        store: Arc<RingBufferStore>,
        config: &DetectionConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(config.queue_depth + 1)),
                notify: Notify::new(),
                inflight: Arc::new(Semaphore::new(0)),
                depth: config.queue_depth.max(1),
                consecutive_failures: AtomicU64::new(0),
                stats,
            }),
            backend,
            store,
            timeout: Duration::from_millis(config.timeout_ms),
            workers: Vec::new(),
        }
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn spawn_workers(&mut self, count: usize, shutdown: watch::Receiver<bool>) {
        info!(workers = count, backend = self.backend.name(), timeout = ?self.timeout, "detection pool started");
        self.shared.inflight.add_permits(count);
        for worker_id in 0..count {
            let worker = Worker {
                id: worker_id,
                shared: Arc::clone(&self.shared),
                backend: Arc::clone(&self.backend),
                store: Arc::clone(&self.store),
                timeout: self.timeout,
            };
            self.workers.push(tokio::spawn(worker.run(shutdown.clone())));
        }
    }

    /// Wait for every worker to exit. Workers stop once shutdown is signalled.
    pub async fn join(self) {
        for handle in self.workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "detection worker ended abnormally");
            }
        }
    }
}

struct Worker {
    id: usize,
    shared: Arc<Shared>,
    backend: Arc<dyn InferenceBackend>,
    store: Arc<RingBufferStore>,
    timeout: Duration,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            // Waits out a timed-out call that is still running on the backend.
            let permit = tokio::select! {
                permit = Arc::clone(&self.shared.inflight).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => continue,
            };
            let job = self.shared.queue.lock().pop_front();
            let Some(job) = job else {
                drop(permit);
                tokio::select! {
                    _ = self.shared.notify.notified() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };
            let detection = self.process(&job, permit).await;
            self.deliver(&job, detection);
        }
        debug!(worker = self.id, "detection worker stopped");
    }

    /// Hand the detection to its lane without waiting on a lane that is
    /// behind; the other lanes share this worker.
    fn deliver(&self, job: &DetectionJob, detection: Detection) {
        match job.reply.try_send(detection) {
            Ok(()) => {}
            Err(TrySendError::Full(detection)) => {
                self.shared.stats.detections_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    lane = %detection.lane_id,
                    set = detection.frame_set_id,
                    "lane not keeping up, dropped detection"
                );
            }
            // The lane is gone; its detections no longer matter.
            Err(TrySendError::Closed(_)) => {}
        }
    }

    async fn process(&self, job: &DetectionJob, permit: OwnedSemaphorePermit) -> Detection {
        let frames: Vec<Arc<Frame>> = job
            .frame_set
            .frames
            .iter()
            .filter_map(|n| self.store.get(&n.camera_id, n.seq))
            .collect();

        // Cameras that ship their own detections need no model run.
        if !frames.is_empty() && frames.len() == job.frame_set.frames.len() {
            if let Some(entities) = precomputed(&frames) {
                self.shared.stats.detections.fetch_add(1, Ordering::Relaxed);
                return Detection::new(job.session_id.clone(), &job.frame_set, entities);
            }
        }

        let outcome = if frames.is_empty() {
            // Every frame was evicted before a worker got to the set.
            Ok(Ok(Err(InferenceError::NoFrames(job.frame_set.id))))
        } else {
            let input = InferenceInput {
                frame_set: job.frame_set.clone(),
                frames,
            };
            let backend = Arc::clone(&self.backend);
            let task = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                backend.detect(&input)
            });
            // A timed-out call keeps its blocking thread and its permit until
            // the backend returns; its result is discarded.
            tokio::time::timeout(self.timeout, task).await
        };

        let status = match outcome {
            Ok(Ok(Ok(entities))) => {
                self.shared.consecutive_failures.store(0, Ordering::Relaxed);
                self.shared.stats.detections.fetch_add(1, Ordering::Relaxed);
                return Detection::new(job.session_id.clone(), &job.frame_set, entities);
            }
            Ok(Ok(Err(e))) => {
                debug!(set = job.frame_set.id, error = %e, "inference failed");
                self.shared.stats.detection_failures.fetch_add(1, Ordering::Relaxed);
                DetectionStatus::Failed
            }
            Ok(Err(e)) => {
                warn!(set = job.frame_set.id, error = %e, "inference task panicked");
                self.shared.stats.detection_failures.fetch_add(1, Ordering::Relaxed);
                DetectionStatus::Failed
            }
            Err(_) => {
                self.shared.stats.detection_timeouts.fetch_add(1, Ordering::Relaxed);
                DetectionStatus::TimedOut
            }
        };

        let failures = self.shared.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures % FAILURE_ALERT_EVERY == 0 {
            error!(
                consecutive_failures = failures,
                backend = self.backend.name(),
                "detection backend keeps failing"
            );
        } else {
            warn!(lane = %job.frame_set.lane_id, set = job.frame_set.id, status = ?status, "empty detection substituted");
        }
        Detection::empty(job.session_id.clone(), &job.frame_set, status)
    }
}

fn precomputed(frames: &[Arc<Frame>]) -> Option<Vec<lane_replay_common::detection::Entity>> {
    let mut entities = Vec::new();
    for frame in frames {
        entities.extend(frame.detections.as_ref()?.iter().copied());
    }
    Some(entities)
}
