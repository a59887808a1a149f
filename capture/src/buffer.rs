use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lane_replay_common::{CameraId, Frame};
use parking_lot::RwLock;
use tracing::{debug, info};

/// Inclusive range of pipeline timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeRange {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("camera {0} already has an active writer")]
    WriterActive(CameraId),
    #[error("camera {camera} needs {needed} slots, ceiling is {ceiling}")]
    CapacityExceeded {
        camera: CameraId,
        needed: usize,
        ceiling: usize,
    },
    #[error("could not allocate ring buffer for camera {0}")]
    Allocation(CameraId),
    #[error("frame for camera {camera} out of order: seq {seq} after {last_seq}")]
    OutOfOrder {
        camera: CameraId,
        seq: u64,
        last_seq: u64,
    },
    #[error("frame for camera {got} written through writer for {expected}")]
    WrongCamera { expected: CameraId, got: CameraId },
}

/// Frames of one camera, oldest first. Sequence numbers and timestamps are
/// both non-decreasing front to back, which is what lets reads binary-search.
struct CameraRing {
    frames: RwLock<VecDeque<Arc<Frame>>>,
    writer_active: AtomicBool,
}

/// Time-bounded ring buffers, one per camera.
///
/// Each camera has exactly one writer (its ingestion unit) and any number of
/// readers. Readers copy `Arc` handles out under a short read lock, so a slow
/// consumer never holds the ring while it works with the frames; the lock is
/// writer-fair, so a stream of readers cannot starve the writer.
pub struct RingBufferStore {
    rings: RwLock<HashMap<CameraId, Arc<CameraRing>>>,
    retention_ms: i64,
    max_frames: usize,
}

impl RingBufferStore {
    pub fn new(retention_ms: i64, max_frames: usize) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            retention_ms,
            max_frames,
        }
    }

    pub fn retention_ms(&self) -> i64 {
        self.retention_ms
    }

    /// Create (or re-open) the ring for a camera and hand out its only writer.
    ///
    /// `expected_fps` sizes the allocation: a retention window that would need
    /// more slots than the configured ceiling is refused, and so is an
    /// allocation the process cannot satisfy.
    pub fn register(
        &self,
        camera_id: &CameraId,
        expected_fps: f64,
    ) -> Result<RingWriter, BufferError> {
        let needed = (((self.retention_ms as f64 / 1_000.0) * expected_fps).ceil() as usize).saturating_add(1);
        if needed > self.max_frames {
            return Err(BufferError::CapacityExceeded {
                camera: camera_id.clone(),
                needed,
                ceiling: self.max_frames,
            });
        }

        let mut rings = self.rings.write();
        let ring = match rings.get(camera_id) {
            Some(ring) => {
                if ring.writer_active.swap(true, Ordering::AcqRel) {
                    return Err(BufferError::WriterActive(camera_id.clone()));
                }
                Arc::clone(ring)
            }
            None => {
                let mut frames = VecDeque::new();
                frames
                    .try_reserve(needed)
                    .map_err(|_| BufferError::Allocation(camera_id.clone()))?;
                let ring = Arc::new(CameraRing {
                    frames: RwLock::new(frames),
                    writer_active: AtomicBool::new(true),
                });
                rings.insert(camera_id.clone(), Arc::clone(&ring));
                info!(camera = %camera_id, slots = needed, "ring buffer allocated");
                ring
            }
        };

        let last = ring.frames.read().back().map(|f| (f.seq, f.captured_at_ms));
        Ok(RingWriter {
            camera_id: camera_id.clone(),
            ring,
            retention_ms: self.retention_ms,
            max_frames: self.max_frames,
            last_seq: last.map(|(seq, _)| seq),
            last_ts: last.map(|(_, ts)| ts),
        })
    }

    /// Retained frames of `camera_id` captured inside `range`, in sequence
    /// order. Empty when nothing overlaps, including after eviction.
    pub fn read(&self, camera_id: &CameraId, range: TimeRange) -> Vec<Arc<Frame>> {
        let Some(ring) = self.ring(camera_id) else {
            return Vec::new();
        };
        let frames = ring.frames.read();
        let start = frames.partition_point(|f| f.captured_at_ms < range.start_ms);
        let end = frames.partition_point(|f| f.captured_at_ms <= range.end_ms);
        if start >= end {
            return Vec::new();
        }
        frames.range(start..end).cloned().collect()
    }

    /// The retained frame with sequence number `seq`, if not yet evicted.
    pub fn get(&self, camera_id: &CameraId, seq: u64) -> Option<Arc<Frame>> {
        let ring = self.ring(camera_id)?;
        let frames = ring.frames.read();
        let idx = frames.partition_point(|f| f.seq < seq);
        frames.get(idx).filter(|f| f.seq == seq).cloned()
    }

    /// Capture time span currently retained for a camera.
    pub fn retained_span(&self, camera_id: &CameraId) -> Option<TimeRange> {
        let ring = self.ring(camera_id)?;
        let frames = ring.frames.read();
        match (frames.front(), frames.back()) {
            (Some(first), Some(last)) => {
                Some(TimeRange::new(first.captured_at_ms, last.captured_at_ms))
            }
            _ => None,
        }
    }

    fn ring(&self, camera_id: &CameraId) -> Option<Arc<CameraRing>> {
        self.rings.read().get(camera_id).cloned()
    }
}

/// Sole write handle for one camera's ring. Not `Clone`; dropping it lets the
/// camera be registered again (for example after its ingestion restarts).
pub struct RingWriter {
    camera_id: CameraId,
    ring: Arc<CameraRing>,
    retention_ms: i64,
    max_frames: usize,
    last_seq: Option<u64>,
    last_ts: Option<i64>,
}

impl RingWriter {
    pub fn camera_id(&self) -> &CameraId {
        &self.camera_id
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    pub fn last_ts(&self) -> Option<i64> {
        self.last_ts
    }

    /// Append a frame, evicting everything older than the retention window
    /// (and anything beyond the slot ceiling).
    pub fn write(&mut self, frame: Frame) -> Result<Arc<Frame>, BufferError> {
        if frame.camera_id != self.camera_id {
            return Err(BufferError::WrongCamera {
                expected: self.camera_id.clone(),
                got: frame.camera_id,
            });
        }
        if let Some(last_seq) = self.last_seq {
            let ts_regressed = self.last_ts.is_some_and(|ts| frame.captured_at_ms < ts);
            if frame.seq <= last_seq || ts_regressed {
                return Err(BufferError::OutOfOrder {
                    camera: self.camera_id.clone(),
                    seq: frame.seq,
                    last_seq,
                });
            }
        }

        let frame = Arc::new(frame);
        let horizon = frame.captured_at_ms - self.retention_ms;
        let mut evicted = 0usize;
        {
            let mut frames = self.ring.frames.write();
            frames.push_back(Arc::clone(&frame));
            while frames
                .front()
                .is_some_and(|f| f.captured_at_ms < horizon || frames.len() > self.max_frames)
            {
                frames.pop_front();
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(camera = %self.camera_id, evicted, horizon, "evicted frames");
        }

        self.last_seq = Some(frame.seq);
        self.last_ts = Some(frame.captured_at_ms);
        Ok(frame)
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        self.ring.writer_active.store(false, Ordering::Release);
    }
}
