pub mod backends;
pub mod pool;

use std::sync::Arc;

use lane_replay_common::detection::Entity;
use lane_replay_common::{Frame, LaneId, SessionId};

use crate::sync::FrameSet;

pub use backends::{NullBackend, ScriptError, ScriptSpan, ScriptedBackend};
pub use pool::{DetectionJob, DetectionPool, PoolHandle};

/// How a detection came about. Anything but `Ok` carries no entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStatus {
    Ok,
    Failed,
    TimedOut,
}

/// Entities seen in one frame set. Consumed once by the lane's event detector.
#[derive(Debug, Clone)]
pub struct Detection {
    pub frame_set_id: u64,
    pub lane_id: LaneId,
    pub session_id: SessionId,
    /// Reference capture time of the frame set.
    pub captured_at_ms: i64,
    pub degraded: bool,
    pub entities: Vec<Entity>,
    pub status: DetectionStatus,
}

impl Detection {
    pub fn new(session_id: SessionId, frame_set: &FrameSet, entities: Vec<Entity>) -> Self {
        Self {
            frame_set_id: frame_set.id,
            lane_id: frame_set.lane_id.clone(),
            session_id,
            captured_at_ms: frame_set.reference_ts(),
            degraded: frame_set.degraded,
            entities,
            status: DetectionStatus::Ok,
        }
    }

    /// A detection with no entities, standing in for a failed inference.
    pub fn empty(session_id: SessionId, frame_set: &FrameSet, status: DetectionStatus) -> Self {
        Self {
            status,
            ..Self::new(session_id, frame_set, Vec::new())
        }
    }
}

/// What a backend is handed: the frame set plus the frames it references,
/// resolved from the ring buffer. Frames already evicted are absent.
pub struct InferenceInput {
    pub frame_set: FrameSet,
    pub frames: Vec<Arc<Frame>>,
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("model error: {0}")]
    Model(String),
    #[error("no frames available for frame set {0}")]
    NoFrames(u64),
}

/// Pluggable vision model.
///
/// Called on a blocking thread with a deadline. Implementations may be slow
/// or fail; the pool turns both into empty detections.
pub trait InferenceBackend: Send + Sync + 'static {
    fn detect(&self, input: &InferenceInput) -> Result<Vec<Entity>, InferenceError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}
