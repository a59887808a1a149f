use async_trait::async_trait;
use bytes::Bytes;
use lane_replay_common::PayloadFormat;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::source::{CaptureError, CaptureSource, CapturedFrame};

/// Generates small grey-ramp raw frames at a fixed rate. Used for bench runs
/// and demos where no camera is attached.
pub struct SyntheticSource {
    ticker: Interval,
    width: u32,
    height: u32,
    counter: u64,
}

impl SyntheticSource {
    pub fn new(fps: f64, width: u32, height: u32) -> Self {
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / fps));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            ticker,
            width,
            height,
            counter: 0,
        }
    }

    fn render(&self) -> Vec<u8> {
        let shift = (self.counter % 256) as u8;
        (0..self.width * self.height)
            .map(|i| (i as u8).wrapping_add(shift))
            .collect()
    }
}

#[async_trait]
impl CaptureSource for SyntheticSource {
    async fn next_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        self.ticker.tick().await;
        self.counter += 1;
        Ok(CapturedFrame {
            payload: Bytes::from(self.render()),
            format: PayloadFormat::Raw {
                width: self.width,
                height: self.height,
            },
            captured_at: Instant::now(),
            detections: None,
        })
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}
