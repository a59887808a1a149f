use std::collections::HashMap;

use lane_replay_common::{CameraId, LaneId, SessionId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

/// A lane as seen by the pipeline at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Lane {
    pub id: LaneId,
    pub cameras: Vec<CameraId>,
    pub session: Option<Session>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub lane_id: LaneId,
    /// Pipeline clock at session start.
    pub started_at_ms: i64,
}

/// Notifications pushed by the external session service. The pipeline never
/// originates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SessionCommand {
    RegisterLane { lane: LaneId, cameras: Vec<CameraId> },
    StartSession { lane: LaneId, session: SessionId },
    EndSession { lane: LaneId },
    ReassignCameras { lane: LaneId, cameras: Vec<CameraId> },
    RemoveLane { lane: LaneId },
}

impl SessionCommand {
    pub fn lane(&self) -> &LaneId {
        match self {
            SessionCommand::RegisterLane { lane, .. }
            | SessionCommand::StartSession { lane, .. }
            | SessionCommand::EndSession { lane }
            | SessionCommand::ReassignCameras { lane, .. }
            | SessionCommand::RemoveLane { lane } => lane,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("lane {0} is not registered")]
    UnknownLane(LaneId),
    #[error("lane {0} is already registered")]
    LaneExists(LaneId),
    #[error("lane {lane} already runs session {session}")]
    SessionActive { lane: LaneId, session: SessionId },
    #[error("lane {0} has no active session")]
    NoSession(LaneId),
    #[error("lane {0} needs at least one camera")]
    NoCameras(LaneId),
}

/// Lane → session → cameras mapping.
///
/// Written only through [`LaneRegistry::apply`], which is the boundary the
/// session service drives. Everything else in the pipeline reads snapshots by
/// value, so a lookup racing a reassignment sees either the old or the new
/// assignment, never a mix.
#[derive(Debug, Default)]
pub struct LaneRegistry {
    lanes: RwLock<HashMap<LaneId, Lane>>,
}

impl LaneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, lane_id: &LaneId) -> Option<Lane> {
        self.lanes.read().get(lane_id).cloned()
    }

    /// Apply one session-service command. Returns the lane as it stands
    /// afterwards (`None` once removed).
    pub fn apply(&self, command: &SessionCommand, now_ms: i64) -> Result<Option<Lane>, RegistryError> {
        let mut lanes = self.lanes.write();
        match command {
            SessionCommand::RegisterLane { lane, cameras } => {
                if lanes.contains_key(lane) {
                    return Err(RegistryError::LaneExists(lane.clone()));
                }
                if cameras.is_empty() {
                    return Err(RegistryError::NoCameras(lane.clone()));
                }
                let entry = Lane {
                    id: lane.clone(),
                    cameras: cameras.clone(),
                    session: None,
                };
                lanes.insert(lane.clone(), entry.clone());
                info!(lane = %lane, cameras = cameras.len(), "lane registered");
                Ok(Some(entry))
            }
            SessionCommand::StartSession { lane, session } => {
                let entry = lanes
                    .get_mut(lane)
                    .ok_or_else(|| RegistryError::UnknownLane(lane.clone()))?;
                if let Some(active) = &entry.session {
                    return Err(RegistryError::SessionActive {
                        lane: lane.clone(),
                        session: active.id.clone(),
                    });
                }
                entry.session = Some(Session {
                    id: session.clone(),
                    lane_id: lane.clone(),
                    started_at_ms: now_ms,
                });
                info!(lane = %lane, session = %session, "session started");
                Ok(Some(entry.clone()))
            }
            SessionCommand::EndSession { lane } => {
                let entry = lanes
                    .get_mut(lane)
                    .ok_or_else(|| RegistryError::UnknownLane(lane.clone()))?;
                let ended = entry
                    .session
                    .take()
                    .ok_or_else(|| RegistryError::NoSession(lane.clone()))?;
                info!(lane = %lane, session = %ended.id, "session ended");
                Ok(Some(entry.clone()))
            }
            SessionCommand::ReassignCameras { lane, cameras } => {
                if cameras.is_empty() {
                    return Err(RegistryError::NoCameras(lane.clone()));
                }
                let entry = lanes
                    .get_mut(lane)
                    .ok_or_else(|| RegistryError::UnknownLane(lane.clone()))?;
                entry.cameras = cameras.clone();
                info!(lane = %lane, cameras = cameras.len(), "lane cameras reassigned");
                Ok(Some(entry.clone()))
            }
            SessionCommand::RemoveLane { lane } => {
                lanes
                    .remove(lane)
                    .ok_or_else(|| RegistryError::UnknownLane(lane.clone()))?;
                info!(lane = %lane, "lane removed");
                Ok(None)
            }
        }
    }
}
