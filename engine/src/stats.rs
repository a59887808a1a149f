use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lane_replay_capture::IngestStats;
use tokio::sync::watch;
use tracing::{info, warn};

/// Counters for everything downstream of capture. Updated with relaxed
/// atomics from whichever task observes the event.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frame_sets: AtomicU64,
    pub degraded_frame_sets: AtomicU64,
    pub notices_lagged: AtomicU64,
    pub detections: AtomicU64,
    pub detections_dropped: AtomicU64,
    pub detection_failures: AtomicU64,
    pub detection_timeouts: AtomicU64,
    pub events: AtomicU64,
    pub duplicate_events: AtomicU64,
    pub clips_extracted: AtomicU64,
    pub clips_partial: AtomicU64,
    pub clips_stored: AtomicU64,
    pub clips_failed: AtomicU64,
    pub handoff_retries: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub capture_failures: u64,
    pub frames_rejected: u64,
    pub frame_sets: u64,
    pub degraded_frame_sets: u64,
    pub notices_lagged: u64,
    pub detections: u64,
    pub detections_dropped: u64,
    pub detection_failures: u64,
    pub detection_timeouts: u64,
    pub events: u64,
    pub duplicate_events: u64,
    pub clips_extracted: u64,
    pub clips_partial: u64,
    pub clips_stored: u64,
    pub clips_failed: u64,
    pub handoff_retries: u64,
}

impl PipelineStats {
    pub fn snapshot(&self, ingest: &IngestStats) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_captured: get(&ingest.frames_captured),
            capture_failures: get(&ingest.capture_failures),
            frames_rejected: get(&ingest.frames_rejected),
            frame_sets: get(&self.frame_sets),
            degraded_frame_sets: get(&self.degraded_frame_sets),
            notices_lagged: get(&self.notices_lagged),
            detections: get(&self.detections),
            detections_dropped: get(&self.detections_dropped),
            detection_failures: get(&self.detection_failures),
            detection_timeouts: get(&self.detection_timeouts),
            events: get(&self.events),
            duplicate_events: get(&self.duplicate_events),
            clips_extracted: get(&self.clips_extracted),
            clips_partial: get(&self.clips_partial),
            clips_stored: get(&self.clips_stored),
            clips_failed: get(&self.clips_failed),
            handoff_retries: get(&self.handoff_retries),
        }
    }
}

/// Health status derived from a snapshot and its predecessor.
fn health(current: &StatsSnapshot, previous: &StatsSnapshot) -> &'static str {
    if current.clips_failed > previous.clips_failed {
        "degraded"
    } else if current.frames_captured == previous.frames_captured {
        "stalled"
    } else if current.degraded_frame_sets > previous.degraded_frame_sets
        || current.detection_timeouts > previous.detection_timeouts
    {
        "pressure"
    } else {
        "healthy"
    }
}

/// Periodically writes counters to the stats file and logs a summary line.
pub struct StatsReporter {
    path: PathBuf,
    interval: Duration,
    stats: Arc<PipelineStats>,
    ingest: Arc<IngestStats>,
}

impl StatsReporter {
    pub fn new(
        path: PathBuf,
        interval: Duration,
        stats: Arc<PipelineStats>,
        ingest: Arc<IngestStats>,
    ) -> Self {
        Self {
            path,
            interval,
            stats,
            ingest,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut previous = StatsSnapshot::default();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let current = self.stats.snapshot(&self.ingest);
            let status = health(&current, &previous);
            info!(
                frames = current.frames_captured,
                frame_sets = current.frame_sets,
                detections = current.detections,
                events = current.events,
                clips_stored = current.clips_stored,
                clips_failed = current.clips_failed,
                status,
                "pipeline stats"
            );
            write_stats_file(&self.path, &current, status);
            previous = current;
        }
        // Final numbers for whoever reads the file after shutdown.
        let current = self.stats.snapshot(&self.ingest);
        write_stats_file(&self.path, &current, "stopped");
    }
}

fn write_stats_file(path: &Path, snapshot: &StatsSnapshot, status: &str) {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let json = serde_json::json!({
        "status": status,
        "counters": snapshot,
        "updated_at": now,
    });
    if let Err(e) = std::fs::write(path, json.to_string()) {
        warn!(error = %e, path = %path.display(), "failed to write stats file");
    }
}
