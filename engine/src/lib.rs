//! Lane replay engine: synchronizes camera frames per lane, runs detection on
//! a shared worker pool, infers delivery events per session and cuts
//! multi-angle replay clips around them.

pub mod clip;
pub mod detect;
pub mod events;
pub mod lane;
pub mod pipeline;
pub mod registry;
pub mod stats;
pub mod sync;

pub use pipeline::{Pipeline, PipelineError};
pub use registry::{LaneRegistry, SessionCommand};
