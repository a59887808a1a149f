use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed vocabulary of delivery milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ApproachStart,
    Release,
    PinImpact,
    EndOfDelivery,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ApproachStart => "approach-start",
            EventKind::Release => "release",
            EventKind::PinImpact => "pin-impact",
            EventKind::EndOfDelivery => "end-of-delivery",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
