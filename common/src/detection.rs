use serde::{Deserialize, Serialize};

/// What a detector saw. Positions are lane-normalized: `y = 0` is the start
/// of the approach, `y = 1` the pin deck; `x` runs gutter to gutter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Bowler's body (pose centroid).
    Bowler,
    /// Ball still held by the bowler.
    BallInHand,
    /// Ball rolling free of the hand.
    Ball,
    /// A standing or falling pin.
    Pin,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPoint {
    pub x: f32,
    pub y: f32,
}

impl NormalizedPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &NormalizedPoint) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub position: NormalizedPoint,
    pub confidence: f32,
}

impl Entity {
    pub fn new(kind: EntityKind, x: f32, y: f32, confidence: f32) -> Self {
        Self {
            kind,
            position: NormalizedPoint::new(x, y),
            confidence,
        }
    }
}
