use std::path::Path;
use std::time::Duration;

use lane_replay_common::detection::Entity;
use serde::Deserialize;

use super::{InferenceBackend, InferenceError, InferenceInput};

/// Sees nothing, ever. Lanes keep synchronizing but never leave `Idle`.
#[derive(Debug, Default)]
pub struct NullBackend;

impl InferenceBackend for NullBackend {
    fn detect(&self, _input: &InferenceInput) -> Result<Vec<Entity>, InferenceError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// One scripted interval. Frame sets whose reference time falls inside
/// `[from_ms, to_ms]` see `entities`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptSpan {
    pub from_ms: i64,
    pub to_ms: i64,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub fail: bool,
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("failed to read detection script {0}: {1}")]
    Read(String, std::io::Error),
    #[error("failed to parse detection script: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Deterministic stand-in for a vision model, driven by a JSON timeline.
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    spans: Vec<ScriptSpan>,
}

impl ScriptedBackend {
    pub fn new(spans: Vec<ScriptSpan>) -> Self {
        Self { spans }
    }

    pub fn from_json(json: &str) -> Result<Self, ScriptError> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ScriptError::Read(path.display().to_string(), e))?;
        Self::from_json(&json)
    }
}

impl InferenceBackend for ScriptedBackend {
    fn detect(&self, input: &InferenceInput) -> Result<Vec<Entity>, InferenceError> {
        let ts = input.frame_set.reference_ts();
        let mut entities = Vec::new();
        for span in self.spans.iter().filter(|s| s.from_ms <= ts && ts <= s.to_ms) {
            if span.delay_ms > 0 {
                std::thread::sleep(Duration::from_millis(span.delay_ms));
            }
            if span.fail {
                return Err(InferenceError::Model(format!("scripted failure at {ts}ms")));
            }
            entities.extend_from_slice(&span.entities);
        }
        Ok(entities)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::FrameSet;
    use lane_replay_common::detection::EntityKind;
    use lane_replay_common::{CameraId, FrameNotice, LaneId};

    fn input_at(ts: i64) -> InferenceInput {
        InferenceInput {
            frame_set: FrameSet {
                id: 1,
                lane_id: LaneId::new("lane-1"),
                frames: vec![FrameNotice {
                    camera_id: CameraId::new("a"),
                    captured_at_ms: ts,
                    seq: 1,
                }],
                missing: Vec::new(),
                degraded: false,
            },
            frames: Vec::new(),
        }
    }

    const SCRIPT: &str = r#"[
        {"from_ms": 0, "to_ms": 999,
         "entities": [{"kind": "bowler", "position": {"x": 0.5, "y": 0.1}, "confidence": 0.8}]},
        {"from_ms": 500, "to_ms": 999,
         "entities": [{"kind": "ball_in_hand", "position": {"x": 0.5, "y": 0.12}, "confidence": 0.7}]},
        {"from_ms": 2000, "to_ms": 2100, "fail": true}
    ]"#;

    #[test]
    fn overlapping_spans_accumulate() {
        let backend = ScriptedBackend::from_json(SCRIPT).unwrap();
        assert_eq!(backend.detect(&input_at(100)).unwrap().len(), 1);
        let both = backend.detect(&input_at(600)).unwrap();
        assert_eq!(both.len(), 2);
        assert_eq!(both[1].kind, EntityKind::BallInHand);
        assert!(backend.detect(&input_at(1_500)).unwrap().is_empty());
    }

    #[test]
    fn failing_span_errors() {
        let backend = ScriptedBackend::from_json(SCRIPT).unwrap();
        assert!(matches!(
            backend.detect(&input_at(2_050)),
            Err(InferenceError::Model(_))
        ));
    }

    #[test]
    fn malformed_script_is_rejected() {
        assert!(matches!(
            ScriptedBackend::from_json("{not json"),
            Err(ScriptError::Parse(_))
        ));
        assert!(NullBackend.detect(&input_at(0)).unwrap().is_empty());
    }
}
