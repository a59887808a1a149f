//! Per-camera capture: the ring buffer store that owns raw frames, the capture
//! source boundary, and the ingestion unit that connects the two.

pub mod buffer;
pub mod ingest;
pub mod mjpeg;
pub mod source;
pub mod synthetic;

pub use buffer::{BufferError, RingBufferStore, RingWriter, TimeRange};
pub use ingest::{IngestStats, IngestionUnit, NoticeBus};
pub use source::{CaptureError, CaptureSource, CapturedFrame};
