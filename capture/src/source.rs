use async_trait::async_trait;
use bytes::Bytes;
use lane_replay_common::config::{CameraConfig, CaptureMode};
use lane_replay_common::detection::Entity;
use lane_replay_common::PayloadFormat;
use std::time::Duration;
use tokio::time::Instant;

use crate::mjpeg::{MjpegSource, PollingSource};
use crate::synthetic::SyntheticSource;

/// One frame as delivered by a capture source, before the ingestion unit
/// assigns it a sequence number and pipeline timestamp.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub payload: Bytes,
    pub format: PayloadFormat,
    /// When the last byte of the frame arrived.
    pub captured_at: Instant,
    pub detections: Option<Vec<Entity>>,
}

impl CapturedFrame {
    pub fn jpeg(payload: Bytes) -> Self {
        Self {
            payload,
            format: PayloadFormat::Jpeg,
            captured_at: Instant::now(),
            detections: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("stream ended")]
    EndOfStream,
    #[error("no frame within {0:?}")]
    Stalled(Duration),
}

/// Pull-based camera interface. Every error is treated as transient by the
/// ingestion unit: it logs, backs off and pulls again.
#[async_trait]
pub trait CaptureSource: Send {
    async fn next_frame(&mut self) -> Result<CapturedFrame, CaptureError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Build the source described by a camera's config section.
pub fn build_source(config: &CameraConfig) -> Box<dyn CaptureSource> {
    match config.mode {
        CaptureMode::Mjpeg => {
            let url = format!("{}?quality={}&fps={}", config.url, config.quality, config.fps);
            Box::new(MjpegSource::new(url))
        }
        CaptureMode::Polling => {
            let url = format!("{}?quality={}", config.url, config.quality);
            let interval = Duration::from_secs_f64(1.0 / config.fps);
            Box::new(PollingSource::new(url, interval))
        }
        CaptureMode::Synthetic => Box::new(SyntheticSource::new(config.fps, 64, 48)),
    }
}
