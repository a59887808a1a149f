//! Types shared by the capture and engine crates: configuration, frames,
//! identifiers, detection entities and the pipeline clock.

pub mod clock;
pub mod config;
pub mod detection;
pub mod event;
pub mod frame;
pub mod ids;

pub use clock::PipelineClock;
pub use event::EventKind;
pub use frame::{Frame, FrameNotice, PayloadFormat};
pub use ids::{CameraId, LaneId, SessionId};
